use std::collections::BTreeSet;
use std::sync::Arc;

use bson::{oid::ObjectId, DateTime};
use serde::Serialize;
use threadline_config::MessagingSettings;
use threadline_db::models::{Attachment, Message, MessageType};
use tracing::{debug, info, warn};

use crate::error::{InvalidState, ServiceError, ServiceResult};
use crate::events::{EventKind, EventPublisher};
use crate::ledger::MembershipLedger;
use crate::read_cursor::{compute_unread, MentionDetector};
use crate::store::{
    MessageFilter, PaginatedResult, PaginationParams, ReplyFilter, SortOrder, Store, StoreError,
};

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub channel_id: ObjectId,
    pub author_id: ObjectId,
    pub content: String,
    pub reply_to: Option<ObjectId>,
    pub attachments: Vec<NewAttachment>,
    pub mentions: Vec<ObjectId>,
    pub metadata: Option<serde_json::Value>,
    pub message_type: MessageType,
}

impl NewMessage {
    pub fn text(channel_id: ObjectId, author_id: ObjectId, content: impl Into<String>) -> Self {
        Self {
            channel_id,
            author_id,
            content: content.into(),
            reply_to: None,
            attachments: Vec::new(),
            mentions: Vec::new(),
            metadata: None,
            message_type: MessageType::Text,
        }
    }

    pub fn replying_to(mut self, message_id: ObjectId) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn with_attachment(mut self, attachment: NewAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_mentions(mut self, mentions: impl IntoIterator<Item = ObjectId>) -> Self {
        self.mentions.extend(mentions);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Thread {
    pub root: Message,
    /// Live direct replies, oldest first.
    pub replies: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub root_id: ObjectId,
    pub reply_count: u32,
    pub participant_count: u32,
    pub latest_reply_id: Option<ObjectId>,
    pub latest_reply_at: Option<DateTime>,
    pub unread_count: u32,
}

pub struct MessageService {
    store: Arc<dyn Store>,
    ledger: Arc<MembershipLedger>,
    publisher: Arc<dyn EventPublisher>,
    detector: Arc<dyn MentionDetector>,
    settings: MessagingSettings,
}

impl MessageService {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<MembershipLedger>,
        publisher: Arc<dyn EventPublisher>,
        detector: Arc<dyn MentionDetector>,
        settings: MessagingSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            publisher,
            detector,
            settings,
        }
    }

    pub async fn post_message(&self, new: NewMessage) -> ServiceResult<Message> {
        let message = self.prepare(new).await?;
        self.persist(&message).await?;
        Ok(message)
    }

    /// Runs every precondition of a post and builds the record without
    /// storing it.
    pub async fn prepare(&self, new: NewMessage) -> ServiceResult<Message> {
        self.ledger
            .require_writer(new.channel_id, new.author_id)
            .await?;
        if new.message_type == MessageType::System {
            return Err(ServiceError::InsufficientRole(
                "system messages cannot be posted by users",
            ));
        }
        self.validate_content(&new.content, !new.attachments.is_empty())?;

        if let Some(reply_to) = new.reply_to {
            let target = match self.store.get_message(reply_to).await {
                Ok(target) => target,
                Err(StoreError::NotFound(_)) => {
                    return Err(ServiceError::InvalidState(InvalidState::InvalidReplyTarget));
                }
                Err(e) => return Err(e.into()),
            };
            if target.channel_id != new.channel_id || target.is_deleted {
                return Err(ServiceError::InvalidState(InvalidState::InvalidReplyTarget));
            }
        }

        let now = DateTime::now();
        let id = ObjectId::new();
        let attachments: Vec<Attachment> = new
            .attachments
            .into_iter()
            .map(|a| Attachment {
                id: ObjectId::new(),
                message_id: id,
                uploader_id: new.author_id,
                filename: a.filename,
                size: a.size,
                content_type: a.content_type,
                url: a.url,
                thumbnail_url: a.thumbnail_url,
                created_at: now,
            })
            .collect();

        let message_type = if new.content.trim().is_empty() && !attachments.is_empty() {
            MessageType::File
        } else {
            new.message_type
        };

        let mut mentions = Vec::with_capacity(new.mentions.len());
        for user_id in new.mentions {
            if !mentions.contains(&user_id) {
                mentions.push(user_id);
            }
        }

        Ok(Message {
            id,
            channel_id: new.channel_id,
            author_id: Some(new.author_id),
            content: new.content,
            message_type,
            reply_to: new.reply_to,
            mentions,
            metadata: new.metadata,
            attachments,
            reaction_summary: Vec::new(),
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Writes a prepared message. Either the message and its attachment
    /// records are both stored or neither is; the channel activity counters
    /// are refreshed best-effort afterwards.
    pub async fn persist(&self, message: &Message) -> ServiceResult<()> {
        self.store.insert_message(message).await?;
        if !message.attachments.is_empty() {
            if let Err(e) = self.store.insert_attachments(&message.attachments).await {
                warn!(message_id = ?message.id, error = %e, "Attachments not stored, discarding message");
                self.discard(message.id).await;
                return Err(e.into());
            }
        }
        if let Err(e) = self
            .store
            .record_channel_activity(message.channel_id, message.id, message.created_at)
            .await
        {
            warn!(channel_id = ?message.channel_id, message_id = ?message.id, error = %e, "Channel activity not recorded");
        }

        info!(
            message_id = ?message.id,
            channel_id = ?message.channel_id,
            author_id = ?message.author_id,
            reply_to = ?message.reply_to,
            "Message posted"
        );
        self.publisher.publish(
            message.channel_id,
            EventKind::MessageCreated,
            message_payload(message),
        );
        Ok(())
    }

    async fn discard(&self, message_id: ObjectId) {
        if let Err(e) = self.store.delete_attachments(message_id).await {
            warn!(?message_id, error = %e, "Discard left attachments behind");
        }
        if let Err(e) = self.store.delete_message(message_id).await {
            warn!(?message_id, error = %e, "Discard left the message behind");
        }
    }

    pub async fn post_system_message(
        &self,
        channel_id: ObjectId,
        content: impl Into<String>,
    ) -> ServiceResult<Message> {
        let content = content.into();
        let channel = self.store.get_channel(channel_id).await?;
        if channel.is_archived {
            return Err(ServiceError::InvalidState(InvalidState::ChannelArchived));
        }
        self.validate_content(&content, false)?;

        let now = DateTime::now();
        let message = Message {
            id: ObjectId::new(),
            channel_id,
            author_id: None,
            content,
            message_type: MessageType::System,
            reply_to: None,
            mentions: Vec::new(),
            metadata: None,
            attachments: Vec::new(),
            reaction_summary: Vec::new(),
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.persist(&message).await?;
        Ok(message)
    }

    fn validate_content(&self, content: &str, has_attachments: bool) -> ServiceResult<()> {
        if content.trim().is_empty() && !has_attachments {
            return Err(ServiceError::InvalidState(InvalidState::EmptyMessage));
        }
        if content.chars().count() > self.settings.max_content_length {
            return Err(ServiceError::InvalidState(InvalidState::ContentTooLong));
        }
        Ok(())
    }

    pub async fn edit_message(
        &self,
        message_id: ObjectId,
        editor_id: ObjectId,
        content: impl Into<String>,
        mentions: Option<Vec<ObjectId>>,
    ) -> ServiceResult<Message> {
        let content = content.into();
        let message = self.store.get_message(message_id).await?;
        if message.is_deleted {
            return Err(ServiceError::InvalidState(InvalidState::MessageDeleted));
        }
        if message.is_system() {
            return Err(ServiceError::InvalidState(InvalidState::SystemMessageImmutable));
        }
        if message.author_id != Some(editor_id) {
            return Err(ServiceError::InsufficientRole("only the author can edit a message"));
        }
        self.ledger
            .require_member(message.channel_id, editor_id)
            .await?;
        self.validate_content(&content, !message.attachments.is_empty())?;

        let updated = self
            .store
            .update_message_content(message_id, &content, mentions.as_deref(), DateTime::now())
            .await?;
        if !updated {
            return Err(ServiceError::InvalidState(InvalidState::MessageDeleted));
        }

        let message = self.store.get_message(message_id).await?;
        info!(?message_id, ?editor_id, "Message edited");
        self.publisher.publish(
            message.channel_id,
            EventKind::MessageUpdated,
            message_payload(&message),
        );
        Ok(message)
    }

    /// Author or channel admin. Deleting twice is a no-op.
    pub async fn soft_delete_message(
        &self,
        message_id: ObjectId,
        actor_id: ObjectId,
    ) -> ServiceResult<Message> {
        let message = self.store.get_message(message_id).await?;
        if message.author_id == Some(actor_id) {
            self.ledger
                .require_member(message.channel_id, actor_id)
                .await?;
        } else {
            self.ledger
                .require_admin(message.channel_id, actor_id)
                .await?;
        }
        if message.is_deleted {
            return Ok(message);
        }

        self.erase_message(message_id).await?;
        Ok(self.store.get_message(message_id).await?)
    }

    /// Clears content, attachment list and reactions. Returns whether this
    /// call performed the deletion.
    pub async fn erase_message(&self, message_id: ObjectId) -> ServiceResult<bool> {
        let erased = self
            .store
            .erase_message(message_id, DateTime::now())
            .await?;
        let removed = self.store.delete_reactions(message_id).await?;
        if !erased {
            debug!(?message_id, "Message already deleted");
            return Ok(false);
        }

        let message = self.store.get_message(message_id).await?;
        info!(?message_id, reactions_removed = removed, "Message deleted");
        self.publisher.publish(
            message.channel_id,
            EventKind::MessageDeleted,
            serde_json::json!({
                "id": message.id.to_hex(),
                "channel_id": message.channel_id.to_hex(),
                "thread_root_id": message.thread_root_id().to_hex(),
            }),
        );
        Ok(true)
    }

    /// Hard delete by a channel admin, together with attachment and
    /// reaction records.
    pub async fn purge_message(&self, message_id: ObjectId, actor_id: ObjectId) -> ServiceResult<()> {
        let message = self.store.get_message(message_id).await?;
        self.ledger
            .require_admin(message.channel_id, actor_id)
            .await?;

        let attachments = self.store.delete_attachments(message_id).await?;
        let reactions = self.store.delete_reactions(message_id).await?;
        if self.store.delete_message(message_id).await? {
            info!(?message_id, ?actor_id, attachments, reactions, "Message purged");
            self.publisher.publish(
                message.channel_id,
                EventKind::MessageDeleted,
                serde_json::json!({
                    "id": message.id.to_hex(),
                    "channel_id": message.channel_id.to_hex(),
                    "purged": true,
                }),
            );
        }
        Ok(())
    }

    pub async fn get_message(&self, message_id: ObjectId, viewer_id: ObjectId) -> ServiceResult<Message> {
        let message = self.store.get_message(message_id).await?;
        self.ledger
            .require_member(message.channel_id, viewer_id)
            .await?;
        Ok(message)
    }

    /// Top-level messages, newest first.
    pub async fn list_channel_messages(
        &self,
        channel_id: ObjectId,
        viewer_id: ObjectId,
        params: &PaginationParams,
    ) -> ServiceResult<PaginatedResult<Message>> {
        let filter = MessageFilter {
            reply: ReplyFilter::TopLevel,
            order: SortOrder::Descending,
            ..MessageFilter::channel(channel_id)
        };
        self.list_messages(viewer_id, filter, params).await
    }

    /// Filtered listing within one channel (author, type, date range,
    /// attachment presence).
    pub async fn list_messages(
        &self,
        viewer_id: ObjectId,
        filter: MessageFilter,
        params: &PaginationParams,
    ) -> ServiceResult<PaginatedResult<Message>> {
        let Some(channel_id) = filter.channel_id else {
            return Err(ServiceError::NotFound("channel"));
        };
        self.ledger.require_member(channel_id, viewer_id).await?;
        let params = if params.per_page == 0 {
            PaginationParams::new(params.page, self.settings.default_page_size)
        } else {
            params.clone()
        };
        Ok(self.store.find_messages_paginated(&filter, &params).await?)
    }

    pub async fn get_thread(&self, root_id: ObjectId, viewer_id: ObjectId) -> ServiceResult<Thread> {
        let root = self.store.get_message(root_id).await?;
        self.ledger
            .require_member(root.channel_id, viewer_id)
            .await?;
        let filter = MessageFilter {
            channel_id: Some(root.channel_id),
            ..MessageFilter::replies_to(root_id)
        };
        let replies = self.store.find_messages(&filter).await?;
        Ok(Thread { root, replies })
    }

    pub async fn get_thread_summary(
        &self,
        root_id: ObjectId,
        viewer_id: ObjectId,
    ) -> ServiceResult<ThreadSummary> {
        let thread = self.get_thread(root_id, viewer_id).await?;

        let participants: BTreeSet<ObjectId> = std::iter::once(&thread.root)
            .chain(thread.replies.iter())
            .filter(|m| !m.is_system())
            .filter_map(|m| m.author_id)
            .collect();

        let receipts: Vec<_> = self
            .store
            .latest_receipt(thread.root.channel_id, viewer_id)
            .await?
            .into_iter()
            .collect();
        let unread = compute_unread(&thread.replies, &receipts, viewer_id, self.detector.as_ref());
        let latest = thread.replies.last();

        Ok(ThreadSummary {
            root_id,
            reply_count: thread.replies.len() as u32,
            participant_count: participants.len() as u32,
            latest_reply_id: latest.map(|m| m.id),
            latest_reply_at: latest.map(|m| m.created_at),
            unread_count: unread.unread_count,
        })
    }
}

pub(crate) fn message_payload(message: &Message) -> serde_json::Value {
    serde_json::json!({
        "id": message.id.to_hex(),
        "channel_id": message.channel_id.to_hex(),
        "author_id": message.author_id.map(|id| id.to_hex()),
        "content": message.content,
        "message_type": message.message_type,
        "reply_to": message.reply_to.map(|id| id.to_hex()),
        "thread_root_id": message.thread_root_id().to_hex(),
        "mentions": message.mentions.iter().map(|id| id.to_hex()).collect::<Vec<_>>(),
        "attachment_count": message.attachments.len(),
        "is_deleted": message.is_deleted,
        "created_at": message.created_at.timestamp_millis(),
        "edited_at": message.edited_at.map(|t| t.timestamp_millis()),
    })
}
