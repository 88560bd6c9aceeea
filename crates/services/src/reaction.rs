use std::collections::BTreeMap;
use std::sync::Arc;

use bson::{oid::ObjectId, DateTime};
use serde::Serialize;
use threadline_db::models::{Reaction, ReactionSummary};
use tracing::{debug, info};

use crate::error::{InvalidState, ServiceError, ServiceResult};
use crate::events::{EventKind, EventPublisher};
use crate::ledger::MembershipLedger;
use crate::store::Store;

/// Bounds on emoji length, in UTF-16 code units.
pub const MIN_EMOJI_UNITS: usize = 1;
pub const MAX_EMOJI_UNITS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionCount {
    pub emoji: String,
    pub count: u32,
    pub has_reacted: bool,
}

pub fn validate_emoji(emoji: &str) -> ServiceResult<()> {
    let units = emoji.encode_utf16().count();
    if !(MIN_EMOJI_UNITS..=MAX_EMOJI_UNITS).contains(&units) {
        return Err(ServiceError::InvalidState(InvalidState::InvalidEmoji));
    }
    Ok(())
}

/// Groups by emoji; highest count first, ties broken by emoji.
pub fn group_reactions(reactions: &[Reaction], viewer_id: ObjectId) -> Vec<ReactionCount> {
    let mut groups: BTreeMap<&str, ReactionCount> = BTreeMap::new();
    for reaction in reactions {
        let entry = groups
            .entry(reaction.emoji.as_str())
            .or_insert_with(|| ReactionCount {
                emoji: reaction.emoji.clone(),
                count: 0,
                has_reacted: false,
            });
        entry.count += 1;
        entry.has_reacted |= reaction.user_id == viewer_id;
    }

    let mut counts: Vec<ReactionCount> = groups.into_values().collect();
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.emoji.cmp(&b.emoji)));
    counts
}

pub struct ReactionAggregator {
    store: Arc<dyn Store>,
    ledger: Arc<MembershipLedger>,
    publisher: Arc<dyn EventPublisher>,
}

impl ReactionAggregator {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<MembershipLedger>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            ledger,
            publisher,
        }
    }

    /// Re-reacting with the same emoji refreshes the stored timestamp.
    pub async fn add_reaction(
        &self,
        message_id: ObjectId,
        user_id: ObjectId,
        emoji: &str,
    ) -> ServiceResult<Reaction> {
        validate_emoji(emoji)?;
        let message = self.store.get_message(message_id).await?;
        if message.is_deleted {
            return Err(ServiceError::InvalidState(InvalidState::MessageDeleted));
        }
        self.ledger
            .require_writer(message.channel_id, user_id)
            .await?;

        let now = DateTime::now();
        let reaction = self
            .store
            .upsert_reaction(&Reaction {
                id: ObjectId::new(),
                channel_id: message.channel_id,
                message_id,
                user_id,
                emoji: emoji.to_string(),
                created_at: now,
                reacted_at: now,
            })
            .await?;

        // A soft delete may have cleared reactions between the check above
        // and the upsert.
        if self.store.get_message(message_id).await?.is_deleted {
            self.store.delete_reaction(message_id, user_id, emoji).await?;
            return Err(ServiceError::InvalidState(InvalidState::MessageDeleted));
        }

        let summary = self.refresh_summary(message_id).await?;
        debug!(?message_id, ?user_id, emoji, "Reaction upserted");
        self.publish(message.channel_id, message_id, &summary);
        Ok(reaction)
    }

    pub async fn remove_reaction(
        &self,
        message_id: ObjectId,
        user_id: ObjectId,
        emoji: &str,
    ) -> ServiceResult<bool> {
        let message = self.store.get_message(message_id).await?;
        self.ledger
            .require_member(message.channel_id, user_id)
            .await?;

        let removed = self
            .store
            .delete_reaction(message_id, user_id, emoji)
            .await?;
        if removed {
            let summary = self.refresh_summary(message_id).await?;
            info!(?message_id, ?user_id, emoji, "Reaction removed");
            self.publish(message.channel_id, message_id, &summary);
        }
        Ok(removed)
    }

    pub async fn count_reactions(
        &self,
        message_id: ObjectId,
        viewer_id: ObjectId,
    ) -> ServiceResult<Vec<ReactionCount>> {
        let message = self.store.get_message(message_id).await?;
        self.ledger
            .require_member(message.channel_id, viewer_id)
            .await?;
        let reactions = self.store.find_reactions(message_id).await?;
        Ok(group_reactions(&reactions, viewer_id))
    }

    pub async fn list_reactions(
        &self,
        message_id: ObjectId,
        viewer_id: ObjectId,
    ) -> ServiceResult<Vec<Reaction>> {
        let message = self.store.get_message(message_id).await?;
        self.ledger
            .require_member(message.channel_id, viewer_id)
            .await?;
        Ok(self.store.find_reactions(message_id).await?)
    }

    async fn refresh_summary(&self, message_id: ObjectId) -> ServiceResult<Vec<ReactionSummary>> {
        let reactions = self.store.find_reactions(message_id).await?;
        let summary: Vec<ReactionSummary> = group_reactions(&reactions, ObjectId::new())
            .into_iter()
            .map(|c| ReactionSummary {
                emoji: c.emoji,
                count: c.count,
            })
            .collect();
        self.store.set_reaction_summary(message_id, &summary).await?;
        Ok(summary)
    }

    fn publish(&self, channel_id: ObjectId, message_id: ObjectId, summary: &[ReactionSummary]) {
        self.publisher.publish(
            channel_id,
            EventKind::MessageReaction,
            serde_json::json!({
                "message_id": message_id.to_hex(),
                "channel_id": channel_id.to_hex(),
                "reactions": summary,
            }),
        );
    }
}
