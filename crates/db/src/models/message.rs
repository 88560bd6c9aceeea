use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

use super::attachment::Attachment;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub channel_id: ObjectId,
    /// `None` for system messages.
    pub author_id: Option<ObjectId>,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    pub reply_to: Option<ObjectId>,
    #[serde(default)]
    pub mentions: Vec<ObjectId>,
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reaction_summary: Vec<ReactionSummary>,
    pub edited_at: Option<DateTime>,
    #[serde(default)]
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    System,
    Action,
    File,
    Reaction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: u32,
}

/// Total order of messages: creation time, then id for messages created in
/// the same millisecond.
pub type MessagePosition = (DateTime, ObjectId);

impl Message {
    pub const COLLECTION: &'static str = "messages";

    pub fn position(&self) -> MessagePosition {
        (self.created_at, self.id)
    }

    /// Threads are one level deep: a reply belongs to the thread of the
    /// message it replies to, never to that message's own parent.
    pub fn thread_root_id(&self) -> ObjectId {
        self.reply_to.unwrap_or(self.id)
    }

    pub fn is_system(&self) -> bool {
        self.message_type == MessageType::System || self.author_id.is_none()
    }
}
