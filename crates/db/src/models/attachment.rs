use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

/// File metadata only; the bytes live in external storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub message_id: ObjectId,
    pub uploader_id: ObjectId,
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub created_at: DateTime,
}

impl Attachment {
    pub const COLLECTION: &'static str = "attachments";
}
