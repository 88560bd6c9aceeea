//! Persistence contract consumed by the messaging core.
//!
//! Every method is a single atomic step on the backing store. Operations
//! whose precondition must hold at write time (content edits on live
//! messages, unique memberships, reaction upserts, monotonic read status)
//! take the precondition into the call instead of leaving a read-then-write
//! window to the caller.

pub mod base;
pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use bson::{oid::ObjectId, DateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use threadline_db::models::{
    Attachment, Channel, ChannelMember, ChannelReadStatus, MemberRole, Message, MessageType,
    ModerationRule, ModerationViolation, Reaction, ReactionSummary, ReadReceipt, ServerBan,
    ServerModerationSettings, ViolationStatus, Warning,
};

pub use memory::MemoryStore;
pub use mongo::MongoStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("duplicate {0}")]
    DuplicateKey(&'static str),
    #[error("transient: {0}")]
    Transient(String),
    #[error("backend: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationParams {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_per_page")]
    pub per_page: u64,
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl PaginationParams {
    pub fn new(page: u64, per_page: u64) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.max(1),
        }
    }

    pub fn skip(&self) -> u64 {
        (self.page.max(1) - 1).saturating_mul(self.per_page)
    }
}

fn default_page() -> u64 {
    1
}

fn default_per_page() -> u64 {
    25
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub total_pages: u64,
}

impl<T> PaginatedResult<T> {
    pub fn new(items: Vec<T>, total: u64, params: &PaginationParams) -> Self {
        let per_page = params.per_page.max(1);
        Self {
            items,
            total,
            page: params.page,
            per_page,
            total_pages: total.div_ceil(per_page),
        }
    }

    /// Slices an already filtered and sorted list.
    pub fn from_sorted(all: Vec<T>, params: &PaginationParams) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(params.skip() as usize)
            .take(params.per_page as usize)
            .collect();
        Self::new(items, total, params)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyFilter {
    #[default]
    Any,
    /// Only messages that are not replies.
    TopLevel,
    /// Only direct replies to the given message.
    To(ObjectId),
}

/// Message query. Results are ordered by `(created_at, id)`.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub channel_id: Option<ObjectId>,
    pub author_id: Option<ObjectId>,
    pub reply: ReplyFilter,
    pub message_type: Option<MessageType>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<DateTime>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<DateTime>,
    pub has_attachments: Option<bool>,
    pub include_deleted: bool,
    pub order: SortOrder,
}

impl MessageFilter {
    pub fn channel(channel_id: ObjectId) -> Self {
        Self {
            channel_id: Some(channel_id),
            ..Default::default()
        }
    }

    pub fn replies_to(root_id: ObjectId) -> Self {
        Self {
            reply: ReplyFilter::To(root_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        if self.channel_id.is_some_and(|c| c != message.channel_id) {
            return false;
        }
        if self.author_id.is_some() && self.author_id != message.author_id {
            return false;
        }
        match self.reply {
            ReplyFilter::Any => {}
            ReplyFilter::TopLevel if message.reply_to.is_some() => return false,
            ReplyFilter::To(root) if message.reply_to != Some(root) => return false,
            _ => {}
        }
        if self.message_type.is_some_and(|t| t != message.message_type) {
            return false;
        }
        if self.since.is_some_and(|since| message.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| message.created_at > until) {
            return false;
        }
        if let Some(has) = self.has_attachments {
            if has == message.attachments.is_empty() {
                return false;
            }
        }
        self.include_deleted || !message.is_deleted
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_archived: Option<bool>,
}

impl ChannelUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.is_archived.is_none()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // Channels
    /// Fails with `DuplicateKey` when a direct channel with the same
    /// (server, name) exists.
    async fn insert_channel(&self, channel: &Channel) -> StoreResult<()>;
    async fn delete_channel(&self, id: ObjectId) -> StoreResult<bool>;
    async fn get_channel(&self, id: ObjectId) -> StoreResult<Channel>;
    async fn find_direct_channel(
        &self,
        server_id: ObjectId,
        name: &str,
    ) -> StoreResult<Option<Channel>>;
    async fn find_channels(&self, ids: &[ObjectId]) -> StoreResult<Vec<Channel>>;
    async fn update_channel(&self, id: ObjectId, update: &ChannelUpdate) -> StoreResult<Channel>;
    async fn adjust_member_count(&self, id: ObjectId, delta: i32) -> StoreResult<()>;
    async fn record_channel_activity(
        &self,
        id: ObjectId,
        message_id: ObjectId,
        at: DateTime,
    ) -> StoreResult<()>;

    // Members
    /// Fails with `DuplicateKey` when the (channel, user) pair exists.
    async fn insert_member(&self, member: &ChannelMember) -> StoreResult<()>;
    async fn get_member(&self, channel_id: ObjectId, user_id: ObjectId)
        -> StoreResult<ChannelMember>;
    async fn update_member_role(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        role: MemberRole,
    ) -> StoreResult<ChannelMember>;
    async fn set_member_mute(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        muted: bool,
        until: Option<DateTime>,
    ) -> StoreResult<ChannelMember>;
    async fn delete_member(&self, channel_id: ObjectId, user_id: ObjectId) -> StoreResult<bool>;
    async fn find_members(&self, channel_id: ObjectId) -> StoreResult<Vec<ChannelMember>>;
    async fn find_members_paginated(
        &self,
        channel_id: ObjectId,
        params: &PaginationParams,
    ) -> StoreResult<PaginatedResult<ChannelMember>>;
    async fn find_memberships(&self, user_id: ObjectId) -> StoreResult<Vec<ChannelMember>>;

    // Messages
    async fn insert_message(&self, message: &Message) -> StoreResult<()>;
    async fn get_message(&self, id: ObjectId) -> StoreResult<Message>;
    async fn find_messages(&self, filter: &MessageFilter) -> StoreResult<Vec<Message>>;
    async fn find_messages_paginated(
        &self,
        filter: &MessageFilter,
        params: &PaginationParams,
    ) -> StoreResult<PaginatedResult<Message>>;
    /// Returns `false` when the message is already soft-deleted.
    async fn update_message_content(
        &self,
        id: ObjectId,
        content: &str,
        mentions: Option<&[ObjectId]>,
        edited_at: DateTime,
    ) -> StoreResult<bool>;
    /// Clears content, attachments and reaction summary. Returns `false`
    /// when the message was already soft-deleted.
    async fn erase_message(&self, id: ObjectId, deleted_at: DateTime) -> StoreResult<bool>;
    /// No-op on soft-deleted messages.
    async fn set_reaction_summary(
        &self,
        id: ObjectId,
        summary: &[ReactionSummary],
    ) -> StoreResult<()>;
    async fn delete_message(&self, id: ObjectId) -> StoreResult<bool>;

    // Attachments
    async fn insert_attachments(&self, attachments: &[Attachment]) -> StoreResult<()>;
    async fn find_attachments(&self, message_id: ObjectId) -> StoreResult<Vec<Attachment>>;
    async fn delete_attachments(&self, message_id: ObjectId) -> StoreResult<u64>;

    // Reactions
    /// Insert, or keep the stored row and move `reacted_at` to the later of
    /// the two timestamps.
    async fn upsert_reaction(&self, reaction: &Reaction) -> StoreResult<Reaction>;
    async fn delete_reaction(
        &self,
        message_id: ObjectId,
        user_id: ObjectId,
        emoji: &str,
    ) -> StoreResult<bool>;
    async fn find_reactions(&self, message_id: ObjectId) -> StoreResult<Vec<Reaction>>;
    async fn delete_reactions(&self, message_id: ObjectId) -> StoreResult<u64>;

    // Read receipts and status
    async fn insert_receipt(&self, receipt: &ReadReceipt) -> StoreResult<()>;
    /// Receipt with the furthest message position for (channel, user).
    async fn latest_receipt(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> StoreResult<Option<ReadReceipt>>;
    async fn find_receipts(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> StoreResult<Vec<ReadReceipt>>;
    async fn get_read_status(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> StoreResult<Option<ChannelReadStatus>>;
    /// Stores the status unless the stored one has a cursor strictly ahead
    /// of it. Returns whether the write happened.
    async fn put_read_status(&self, status: &ChannelReadStatus) -> StoreResult<bool>;
    async fn increment_unread(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        mentions: u32,
    ) -> StoreResult<()>;

    // Moderation
    async fn insert_rule(&self, rule: &ModerationRule) -> StoreResult<()>;
    async fn get_rule(&self, id: ObjectId) -> StoreResult<ModerationRule>;
    async fn set_rule_active(&self, id: ObjectId, active: bool) -> StoreResult<ModerationRule>;
    async fn find_rules(&self, server_id: ObjectId, active_only: bool)
        -> StoreResult<Vec<ModerationRule>>;
    async fn insert_violation(&self, violation: &ModerationViolation) -> StoreResult<()>;
    async fn get_violation(&self, id: ObjectId) -> StoreResult<ModerationViolation>;
    async fn update_violation(&self, violation: &ModerationViolation) -> StoreResult<()>;
    async fn find_violations(
        &self,
        server_id: ObjectId,
        status: Option<ViolationStatus>,
    ) -> StoreResult<Vec<ModerationViolation>>;
    /// Fails with `DuplicateKey` when a warning exists for the violation.
    async fn insert_warning(&self, warning: &Warning) -> StoreResult<()>;
    async fn count_active_warnings(
        &self,
        server_id: ObjectId,
        user_id: ObjectId,
        now: DateTime,
    ) -> StoreResult<u64>;
    /// Fails with `DuplicateKey` when a ban exists for the same violation.
    async fn insert_ban(&self, ban: &ServerBan) -> StoreResult<()>;
    async fn find_active_ban(
        &self,
        server_id: ObjectId,
        user_id: ObjectId,
        now: DateTime,
    ) -> StoreResult<Option<ServerBan>>;
    async fn get_server_settings(
        &self,
        server_id: ObjectId,
    ) -> StoreResult<Option<ServerModerationSettings>>;
    async fn put_server_settings(&self, settings: &ServerModerationSettings) -> StoreResult<()>;
}
