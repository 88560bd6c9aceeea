//! Per-user read positions and the unread/mention counts derived from them.
//!
//! Receipts are the source of truth. `ChannelReadStatus` is a cache that is
//! bumped on every post and rebuilt whenever a user asks for it.

use std::sync::Arc;

use bson::{oid::ObjectId, DateTime};
use threadline_db::models::{ChannelReadStatus, Message, MessagePosition, ReadReceipt};
use tracing::{debug, warn};

use crate::error::{InvalidState, ServiceError, ServiceResult};
use crate::events::{EventKind, EventPublisher};
use crate::ledger::MembershipLedger;
use crate::store::{MessageFilter, Store};

/// Decides whether a message mentions a user.
pub trait MentionDetector: Send + Sync {
    fn mentions(&self, message: &Message, user_id: ObjectId) -> bool;
}

/// Uses the mention list resolved at post time.
#[derive(Debug, Default, Clone, Copy)]
pub struct MentionList;

impl MentionDetector for MentionList {
    fn mentions(&self, message: &Message, user_id: ObjectId) -> bool {
        message.mentions.contains(&user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnreadCounts {
    pub cursor: Option<MessagePosition>,
    pub unread_count: u32,
    pub mention_count: u32,
}

/// The cursor is the furthest position among `user_id`'s receipts. Every
/// live message positioned after it is unread; no receipt means everything
/// is unread.
pub fn compute_unread(
    messages: &[Message],
    receipts: &[ReadReceipt],
    user_id: ObjectId,
    detector: &dyn MentionDetector,
) -> UnreadCounts {
    let cursor = receipts
        .iter()
        .filter(|r| r.user_id == user_id)
        .map(ReadReceipt::position)
        .max();

    let mut counts = UnreadCounts {
        cursor,
        ..Default::default()
    };
    for message in messages {
        if message.is_deleted || cursor.is_some_and(|c| message.position() <= c) {
            continue;
        }
        counts.unread_count += 1;
        if detector.mentions(message, user_id) {
            counts.mention_count += 1;
        }
    }
    counts
}

pub struct ReadCursorTracker {
    store: Arc<dyn Store>,
    ledger: Arc<MembershipLedger>,
    publisher: Arc<dyn EventPublisher>,
    detector: Arc<dyn MentionDetector>,
}

impl ReadCursorTracker {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<MembershipLedger>,
        publisher: Arc<dyn EventPublisher>,
        detector: Arc<dyn MentionDetector>,
    ) -> Self {
        Self {
            store,
            ledger,
            publisher,
            detector,
        }
    }

    pub fn detector(&self) -> &dyn MentionDetector {
        self.detector.as_ref()
    }

    /// Moves the cursor forward to `message_id`. A message at or behind the
    /// current cursor leaves everything as it is.
    pub async fn mark_read(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        message_id: ObjectId,
    ) -> ServiceResult<ChannelReadStatus> {
        self.ledger.require_member(channel_id, user_id).await?;
        let message = self.store.get_message(message_id).await?;
        if message.channel_id != channel_id {
            return Err(ServiceError::InvalidState(InvalidState::MessageNotInChannel));
        }
        self.advance(channel_id, user_id, &message).await
    }

    /// Marks everything currently in the channel as read.
    pub async fn mark_all_read(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<ChannelReadStatus> {
        self.ledger.require_member(channel_id, user_id).await?;
        let channel = self.store.get_channel(channel_id).await?;
        let Some(last_id) = channel.last_message_id else {
            return self.get_channel_read_status(channel_id, user_id).await;
        };
        let message = self.store.get_message(last_id).await?;
        self.advance(channel_id, user_id, &message).await
    }

    async fn advance(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        message: &Message,
    ) -> ServiceResult<ChannelReadStatus> {
        let current = self.store.latest_receipt(channel_id, user_id).await?;
        if current.is_some_and(|r| r.position() >= message.position()) {
            debug!(?channel_id, ?user_id, message_id = ?message.id, "Cursor already past message");
            return self.current_status(channel_id, user_id).await;
        }

        let now = DateTime::now();
        let receipt = ReadReceipt {
            id: ObjectId::new(),
            channel_id,
            user_id,
            message_id: message.id,
            message_created_at: message.created_at,
            read_at: now,
        };
        self.store.insert_receipt(&receipt).await?;

        let status = self.rebuild(channel_id, user_id, &receipt).await?;
        if !self.store.put_read_status(&status).await? {
            debug!(?channel_id, ?user_id, "Concurrent cursor advance won");
            return self.current_status(channel_id, user_id).await;
        }

        debug!(?channel_id, ?user_id, message_id = ?message.id, unread = status.unread_count, "Cursor advanced");
        self.publisher.publish(
            channel_id,
            EventKind::ReadUpdated,
            serde_json::json!({
                "channel_id": channel_id.to_hex(),
                "user_id": user_id.to_hex(),
                "last_read_message_id": message.id.to_hex(),
            }),
        );
        Ok(status)
    }

    async fn rebuild(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        receipt: &ReadReceipt,
    ) -> ServiceResult<ChannelReadStatus> {
        let filter = MessageFilter {
            since: Some(receipt.message_created_at),
            ..MessageFilter::channel(channel_id)
        };
        let after = self.store.find_messages(&filter).await?;
        let counts = compute_unread(
            &after,
            std::slice::from_ref(receipt),
            user_id,
            self.detector.as_ref(),
        );

        let existing = self.store.get_read_status(channel_id, user_id).await?;
        let mut status =
            existing.unwrap_or_else(|| ChannelReadStatus::empty(channel_id, user_id));
        status.last_read_message_id = Some(receipt.message_id);
        status.last_read_message_at = Some(receipt.message_created_at);
        status.last_read_at = Some(receipt.read_at);
        status.unread_count = counts.unread_count;
        status.mention_count = counts.mention_count;
        status.updated_at = DateTime::now();
        Ok(status)
    }

    async fn current_status(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<ChannelReadStatus> {
        match self.store.get_read_status(channel_id, user_id).await? {
            Some(status) => Ok(status),
            None => self.get_channel_read_status(channel_id, user_id).await,
        }
    }

    /// Called after a message is persisted: the author has read their own
    /// message, everyone else gains one unread.
    pub async fn record_post(&self, message: &Message) -> ServiceResult<()> {
        let channel_id = message.channel_id;
        for member in self.store.find_members(channel_id).await? {
            if Some(member.user_id) == message.author_id {
                self.advance(channel_id, member.user_id, message).await?;
                continue;
            }
            let mentioned = u32::from(self.detector.mentions(message, member.user_id));
            if let Err(e) = self
                .store
                .increment_unread(channel_id, member.user_id, mentioned)
                .await
            {
                warn!(?channel_id, user_id = ?member.user_id, error = %e, "Failed to bump unread count");
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Recomputes the status from receipts and messages and stores the
    /// result.
    pub async fn get_channel_read_status(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<ChannelReadStatus> {
        self.ledger.require_member(channel_id, user_id).await?;

        let latest = self.store.latest_receipt(channel_id, user_id).await?;
        let filter = MessageFilter {
            since: latest.as_ref().map(|r| r.message_created_at),
            ..MessageFilter::channel(channel_id)
        };
        let messages = self.store.find_messages(&filter).await?;
        let receipts: Vec<ReadReceipt> = latest.into_iter().collect();
        let counts = compute_unread(&messages, &receipts, user_id, self.detector.as_ref());

        let existing = self.store.get_read_status(channel_id, user_id).await?;
        let mut status =
            existing.unwrap_or_else(|| ChannelReadStatus::empty(channel_id, user_id));
        if let Some(receipt) = receipts.first() {
            status.last_read_message_id = Some(receipt.message_id);
            status.last_read_message_at = Some(receipt.message_created_at);
            status.last_read_at = Some(receipt.read_at);
        }
        status.unread_count = counts.unread_count;
        status.mention_count = counts.mention_count;
        status.updated_at = DateTime::now();

        if !self.store.put_read_status(&status).await? {
            if let Some(stored) = self.store.get_read_status(channel_id, user_id).await? {
                return Ok(stored);
            }
        }
        Ok(status)
    }

    pub async fn list_receipts(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<Vec<ReadReceipt>> {
        self.ledger.require_member(channel_id, user_id).await?;
        Ok(self.store.find_receipts(channel_id, user_id).await?)
    }
}
