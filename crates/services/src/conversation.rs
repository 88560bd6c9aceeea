use std::sync::Arc;

use bson::oid::ObjectId;
use threadline_config::Settings;
use threadline_db::models::{Message, ModerationViolation};
use tracing::{info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::events::{ChannelHub, EventPublisher};
use crate::ledger::MembershipLedger;
use crate::message::{MessageService, NewMessage};
use crate::moderation::ModerationPipeline;
use crate::reaction::ReactionAggregator;
use crate::read_cursor::{MentionDetector, MentionList, ReadCursorTracker};
use crate::store::{base::classify, MongoStore, Store};

/// Outcome of a moderated post. `message` reflects any enforcement, so a
/// `delete` rule hands back the erased record.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub message: Message,
    pub violation: Option<ModerationViolation>,
}

/// The five components wired over one store and one publisher.
pub struct Conversation {
    pub ledger: Arc<MembershipLedger>,
    pub messages: Arc<MessageService>,
    pub reactions: Arc<ReactionAggregator>,
    pub cursors: Arc<ReadCursorTracker>,
    pub moderation: Arc<ModerationPipeline>,
    store: Arc<dyn Store>,
}

impl Conversation {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<dyn EventPublisher>,
        settings: &Settings,
    ) -> Self {
        Self::with_detector(store, publisher, Arc::new(MentionList), settings)
    }

    pub fn with_detector(
        store: Arc<dyn Store>,
        publisher: Arc<dyn EventPublisher>,
        detector: Arc<dyn MentionDetector>,
        settings: &Settings,
    ) -> Self {
        let ledger = Arc::new(MembershipLedger::new(store.clone(), publisher.clone()));
        let messages = Arc::new(MessageService::new(
            store.clone(),
            ledger.clone(),
            publisher.clone(),
            detector.clone(),
            settings.messaging.clone(),
        ));
        let reactions = Arc::new(ReactionAggregator::new(
            store.clone(),
            ledger.clone(),
            publisher.clone(),
        ));
        let cursors = Arc::new(ReadCursorTracker::new(
            store.clone(),
            ledger.clone(),
            publisher.clone(),
            detector,
        ));
        let moderation = Arc::new(ModerationPipeline::new(
            store.clone(),
            ledger.clone(),
            messages.clone(),
            publisher,
            settings.moderation.clone(),
        ));

        Self {
            ledger,
            messages,
            reactions,
            cursors,
            moderation,
            store,
        }
    }

    /// Connects to MongoDB, makes sure indexes exist and wires everything
    /// to a fresh `ChannelHub`.
    pub async fn connect(settings: &Settings) -> ServiceResult<(Self, Arc<ChannelHub>)> {
        let db = threadline_db::connect(&settings.database)
            .await
            .map_err(|e| ServiceError::from(classify(e, "database")))?;
        threadline_db::indexes::ensure_indexes(&db)
            .await
            .map_err(|e| ServiceError::from(classify(e, "index")))?;

        let hub = Arc::new(ChannelHub::new(settings.events.channel_capacity));
        let store: Arc<dyn Store> = Arc::new(MongoStore::new(&db));
        info!(db = %settings.database.name, "Conversation engine ready");
        Ok((Self::new(store, hub.clone(), settings), hub))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Full post path: restriction and content checks, rule evaluation,
    /// persistence, cursor bookkeeping, then enforcement of a matched rule.
    /// A failed enforcement leaves the message posted and the violation
    /// `failed`.
    pub async fn submit_message(&self, new: NewMessage) -> ServiceResult<SubmitOutcome> {
        let channel = self.ledger.get_channel(new.channel_id).await?;
        let message = self.messages.prepare(new).await?;
        let matched = self
            .moderation
            .evaluate(channel.server_id, &message)
            .await?;

        self.messages.persist(&message).await?;
        self.record_post(&message).await;

        let Some(rule) = matched else {
            return Ok(SubmitOutcome {
                message,
                violation: None,
            });
        };

        let violation = self.moderation.record_violation(&rule, &message).await?;
        let violation = match self.moderation.enforce(violation.id).await {
            Ok(violation) => violation,
            Err(ServiceError::EnforcementFailed { violation_id, reason }) => {
                warn!(?violation_id, %reason, message_id = ?message.id, "Message kept after failed enforcement");
                self.store.get_violation(violation_id).await?
            }
            Err(e) => return Err(e),
        };

        let message = self.store.get_message(message.id).await?;
        Ok(SubmitOutcome {
            message,
            violation: Some(violation),
        })
    }

    pub async fn post_system_message(
        &self,
        channel_id: ObjectId,
        content: impl Into<String>,
    ) -> ServiceResult<Message> {
        let message = self
            .messages
            .post_system_message(channel_id, content)
            .await?;
        self.record_post(&message).await;
        Ok(message)
    }

    /// Cursor bookkeeping for a stored message. Read status is rebuilt from
    /// receipts on demand, so a failure here is logged, not surfaced.
    async fn record_post(&self, message: &Message) {
        if let Err(e) = self.cursors.record_post(message).await {
            warn!(message_id = ?message.id, channel_id = ?message.channel_id, error = %e, "Read cursors not updated after post");
        }
    }
}
