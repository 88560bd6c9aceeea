use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub server_id: ObjectId,
    pub channel_type: ChannelType,
    pub name: String,
    pub description: Option<String>,
    pub creator_id: ObjectId,
    #[serde(default)]
    pub is_archived: bool,
    pub last_message_id: Option<ObjectId>,
    pub last_activity_at: Option<DateTime>,
    #[serde(default)]
    pub member_count: u32,
    #[serde(default)]
    pub message_count: u64,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    #[default]
    Public,
    Private,
    Direct,
}

impl Channel {
    pub const COLLECTION: &'static str = "channels";

    pub fn is_direct(&self) -> bool {
        self.channel_type == ChannelType::Direct
    }

    /// Stable name for the direct channel between two users, independent of
    /// argument order.
    pub fn direct_name(a: ObjectId, b: ObjectId) -> String {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        format!("dm:{}:{}", lo.to_hex(), hi.to_hex())
    }
}
