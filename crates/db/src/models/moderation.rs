use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationRule {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub server_id: ObjectId,
    pub name: String,
    pub pattern: String,
    pub action: ModerationAction,
    /// Lower values are evaluated first.
    pub severity: u32,
    pub duration_secs: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    Warn,
    Delete,
    Mute,
    Ban,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationViolation {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub server_id: ObjectId,
    pub rule_id: ObjectId,
    pub message_id: ObjectId,
    pub user_id: ObjectId,
    pub channel_id: ObjectId,
    pub action: ModerationAction,
    pub status: ViolationStatus,
    #[serde(default)]
    pub action_taken: bool,
    #[serde(default)]
    pub attempts: u32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime,
    pub resolved_at: Option<DateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ViolationStatus {
    #[default]
    Pending,
    Resolved,
    Failed,
}

/// One entry of the rolling warning counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub server_id: ObjectId,
    pub user_id: ObjectId,
    pub violation_id: ObjectId,
    pub created_at: DateTime,
    pub expires_at: DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerBan {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub server_id: ObjectId,
    pub user_id: ObjectId,
    pub violation_id: Option<ObjectId>,
    pub expires_at: Option<DateTime>,
    pub created_at: DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerModerationSettings {
    #[serde(rename = "_id")]
    pub server_id: ObjectId,
    pub max_warnings: u32,
    pub warning_expiry_secs: i64,
    pub default_mute_secs: i64,
    pub updated_at: DateTime,
}

impl ModerationRule {
    pub const COLLECTION: &'static str = "moderation_rules";
}

impl ModerationViolation {
    pub const COLLECTION: &'static str = "moderation_violations";
}

impl Warning {
    pub const COLLECTION: &'static str = "moderation_warnings";
}

impl ServerBan {
    pub const COLLECTION: &'static str = "server_bans";

    pub fn is_active_at(&self, now: DateTime) -> bool {
        self.expires_at.is_none_or(|expires| expires > now)
    }
}

impl ServerModerationSettings {
    pub const COLLECTION: &'static str = "server_moderation_settings";
}
