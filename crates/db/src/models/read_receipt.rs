use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

use super::message::MessagePosition;

/// One user having read a channel up to one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub channel_id: ObjectId,
    pub user_id: ObjectId,
    pub message_id: ObjectId,
    pub message_created_at: DateTime,
    pub read_at: DateTime,
}

impl ReadReceipt {
    pub const COLLECTION: &'static str = "read_receipts";

    pub fn position(&self) -> MessagePosition {
        (self.message_created_at, self.message_id)
    }
}

/// Materialized per-user view of a channel, derived from receipts and
/// messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelReadStatus {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub channel_id: ObjectId,
    pub user_id: ObjectId,
    pub last_read_message_id: Option<ObjectId>,
    pub last_read_message_at: Option<DateTime>,
    pub last_read_at: Option<DateTime>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub mention_count: u32,
    pub updated_at: DateTime,
}

impl ChannelReadStatus {
    pub const COLLECTION: &'static str = "channel_read_status";

    pub fn empty(channel_id: ObjectId, user_id: ObjectId) -> Self {
        Self {
            id: ObjectId::new(),
            channel_id,
            user_id,
            last_read_message_id: None,
            last_read_message_at: None,
            last_read_at: None,
            unread_count: 0,
            mention_count: 0,
            updated_at: DateTime::now(),
        }
    }

    pub fn cursor(&self) -> Option<MessagePosition> {
        match (self.last_read_message_at, self.last_read_message_id) {
            (Some(at), Some(id)) => Some((at, id)),
            _ => None,
        }
    }
}
