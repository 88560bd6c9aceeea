use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub channel_id: ObjectId,
    pub message_id: ObjectId,
    pub user_id: ObjectId,
    pub emoji: String,
    pub created_at: DateTime,
    /// Latest time the user applied this emoji; re-reacting moves it forward.
    pub reacted_at: DateTime,
}

impl Reaction {
    pub const COLLECTION: &'static str = "reactions";
}
