use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMember {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub channel_id: ObjectId,
    pub user_id: ObjectId,
    pub role: MemberRole,
    pub joined_at: DateTime,
    #[serde(default)]
    pub is_muted: bool,
    pub muted_until: Option<DateTime>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

/// Declaration order is rank order: `Member < Admin < Owner`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    #[default]
    Member,
    Admin,
    Owner,
}

impl MemberRole {
    pub fn is_admin(self) -> bool {
        matches!(self, MemberRole::Admin | MemberRole::Owner)
    }
}

impl ChannelMember {
    pub const COLLECTION: &'static str = "channel_members";

    /// A mute without an expiry lasts until lifted; one with an expiry in the
    /// past no longer applies.
    pub fn is_muted_at(&self, now: DateTime) -> bool {
        if !self.is_muted {
            return false;
        }
        match self.muted_until {
            Some(until) => until > now,
            None => true,
        }
    }
}
