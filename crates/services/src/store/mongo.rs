use async_trait::async_trait;
use bson::{doc, oid::ObjectId, Bson, DateTime, Document};
use mongodb::Database;
use serde::Serialize;
use threadline_db::models::{
    Attachment, Channel, ChannelMember, ChannelReadStatus, MemberRole, Message, ModerationRule,
    ModerationViolation, Reaction, ReactionSummary, ReadReceipt, ServerBan,
    ServerModerationSettings, ViolationStatus, Warning,
};
use tracing::debug;

use super::base::BaseDao;
use super::{
    ChannelUpdate, MessageFilter, PaginatedResult, PaginationParams, ReplyFilter, SortOrder,
    Store, StoreError, StoreResult,
};

pub struct MongoStore {
    channels: BaseDao<Channel>,
    members: BaseDao<ChannelMember>,
    messages: BaseDao<Message>,
    attachments: BaseDao<Attachment>,
    reactions: BaseDao<Reaction>,
    receipts: BaseDao<ReadReceipt>,
    read_status: BaseDao<ChannelReadStatus>,
    rules: BaseDao<ModerationRule>,
    violations: BaseDao<ModerationViolation>,
    warnings: BaseDao<Warning>,
    bans: BaseDao<ServerBan>,
    server_settings: BaseDao<ServerModerationSettings>,
}

impl MongoStore {
    pub fn new(db: &Database) -> Self {
        Self {
            channels: BaseDao::new(db, Channel::COLLECTION, "channel"),
            members: BaseDao::new(db, ChannelMember::COLLECTION, "membership"),
            messages: BaseDao::new(db, Message::COLLECTION, "message"),
            attachments: BaseDao::new(db, Attachment::COLLECTION, "attachment"),
            reactions: BaseDao::new(db, Reaction::COLLECTION, "reaction"),
            receipts: BaseDao::new(db, ReadReceipt::COLLECTION, "read receipt"),
            read_status: BaseDao::new(db, ChannelReadStatus::COLLECTION, "read status"),
            rules: BaseDao::new(db, ModerationRule::COLLECTION, "moderation rule"),
            violations: BaseDao::new(db, ModerationViolation::COLLECTION, "violation"),
            warnings: BaseDao::new(db, Warning::COLLECTION, "warning"),
            bans: BaseDao::new(db, ServerBan::COLLECTION, "ban"),
            server_settings: BaseDao::new(
                db,
                ServerModerationSettings::COLLECTION,
                "moderation settings",
            ),
        }
    }
}

fn to_bson<T: Serialize>(value: &T) -> StoreResult<Bson> {
    bson::to_bson(value).map_err(|e| StoreError::Backend(e.to_string()))
}

fn pair(channel_id: ObjectId, user_id: ObjectId) -> Document {
    doc! { "channel_id": channel_id, "user_id": user_id }
}

fn message_query(filter: &MessageFilter) -> StoreResult<Document> {
    let mut query = doc! {};
    if let Some(channel_id) = filter.channel_id {
        query.insert("channel_id", channel_id);
    }
    if let Some(author_id) = filter.author_id {
        query.insert("author_id", author_id);
    }
    match filter.reply {
        ReplyFilter::Any => {}
        ReplyFilter::TopLevel => {
            query.insert("reply_to", Bson::Null);
        }
        ReplyFilter::To(root) => {
            query.insert("reply_to", root);
        }
    }
    if let Some(message_type) = filter.message_type {
        query.insert("message_type", to_bson(&message_type)?);
    }
    let mut range = doc! {};
    if let Some(since) = filter.since {
        range.insert("$gte", since);
    }
    if let Some(until) = filter.until {
        range.insert("$lte", until);
    }
    if !range.is_empty() {
        query.insert("created_at", range);
    }
    match filter.has_attachments {
        Some(true) => {
            query.insert("attachments", doc! { "$ne": [] });
        }
        Some(false) => {
            query.insert("attachments", Bson::Array(Vec::new()));
        }
        None => {}
    }
    if !filter.include_deleted {
        query.insert("is_deleted", false);
    }
    Ok(query)
}

fn message_sort(order: SortOrder) -> Document {
    let direction = match order {
        SortOrder::Ascending => 1,
        SortOrder::Descending => -1,
    };
    doc! { "created_at": direction, "_id": direction }
}

impl MongoStore {
    /// Distinguishes "precondition no longer holds" from "record missing"
    /// after a conditional update matched nothing.
    async fn message_exists(&self, id: ObjectId) -> StoreResult<bool> {
        self.messages.find_by_id(id).await.map(|_| true)
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn insert_channel(&self, channel: &Channel) -> StoreResult<()> {
        self.channels.insert_one(channel).await
    }

    async fn delete_channel(&self, id: ObjectId) -> StoreResult<bool> {
        Ok(self.channels.hard_delete(doc! { "_id": id }).await? > 0)
    }

    async fn get_channel(&self, id: ObjectId) -> StoreResult<Channel> {
        self.channels.find_by_id(id).await
    }

    async fn find_direct_channel(
        &self,
        server_id: ObjectId,
        name: &str,
    ) -> StoreResult<Option<Channel>> {
        self.channels
            .find_one(doc! { "server_id": server_id, "channel_type": "direct", "name": name })
            .await
    }

    async fn find_channels(&self, ids: &[ObjectId]) -> StoreResult<Vec<Channel>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.channels
            .find_many(
                doc! { "_id": { "$in": ids.to_vec() } },
                Some(doc! { "created_at": 1, "_id": 1 }),
            )
            .await
    }

    async fn update_channel(&self, id: ObjectId, update: &ChannelUpdate) -> StoreResult<Channel> {
        let mut set_doc = doc! { "updated_at": DateTime::now() };
        if let Some(name) = &update.name {
            set_doc.insert("name", name.clone());
        }
        if let Some(description) = &update.description {
            set_doc.insert("description", description.clone());
        }
        if let Some(is_archived) = update.is_archived {
            set_doc.insert("is_archived", is_archived);
        }

        self.channels
            .find_one_and_update(doc! { "_id": id }, doc! { "$set": set_doc })
            .await?
            .ok_or(StoreError::NotFound("channel"))
    }

    async fn adjust_member_count(&self, id: ObjectId, delta: i32) -> StoreResult<()> {
        let matched = self
            .channels
            .update_one(doc! { "_id": id }, doc! { "$inc": { "member_count": delta } })
            .await?;
        if !matched {
            return Err(StoreError::NotFound("channel"));
        }
        Ok(())
    }

    async fn record_channel_activity(
        &self,
        id: ObjectId,
        message_id: ObjectId,
        at: DateTime,
    ) -> StoreResult<()> {
        let matched = self
            .channels
            .update_one(doc! { "_id": id }, doc! { "$inc": { "message_count": 1 } })
            .await?;
        if !matched {
            return Err(StoreError::NotFound("channel"));
        }

        // Only move the pointer forward.
        self.channels
            .update_one(
                doc! {
                    "_id": id,
                    "$or": [
                        { "last_activity_at": null },
                        { "last_activity_at": { "$lte": at } },
                    ],
                },
                doc! { "$set": { "last_activity_at": at, "last_message_id": message_id } },
            )
            .await?;
        Ok(())
    }

    async fn insert_member(&self, member: &ChannelMember) -> StoreResult<()> {
        self.members.insert_one(member).await
    }

    async fn get_member(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> StoreResult<ChannelMember> {
        self.members
            .find_one(pair(channel_id, user_id))
            .await?
            .ok_or(StoreError::NotFound("membership"))
    }

    async fn update_member_role(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        role: MemberRole,
    ) -> StoreResult<ChannelMember> {
        self.members
            .find_one_and_update(
                pair(channel_id, user_id),
                doc! { "$set": { "role": to_bson(&role)?, "updated_at": DateTime::now() } },
            )
            .await?
            .ok_or(StoreError::NotFound("membership"))
    }

    async fn set_member_mute(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        muted: bool,
        until: Option<DateTime>,
    ) -> StoreResult<ChannelMember> {
        let until = if muted { until } else { None };
        self.members
            .find_one_and_update(
                pair(channel_id, user_id),
                doc! {
                    "$set": {
                        "is_muted": muted,
                        "muted_until": until,
                        "updated_at": DateTime::now(),
                    }
                },
            )
            .await?
            .ok_or(StoreError::NotFound("membership"))
    }

    async fn delete_member(&self, channel_id: ObjectId, user_id: ObjectId) -> StoreResult<bool> {
        let deleted = self.members.hard_delete(pair(channel_id, user_id)).await?;
        Ok(deleted > 0)
    }

    async fn find_members(&self, channel_id: ObjectId) -> StoreResult<Vec<ChannelMember>> {
        self.members
            .find_many(
                doc! { "channel_id": channel_id },
                Some(doc! { "joined_at": 1, "_id": 1 }),
            )
            .await
    }

    async fn find_members_paginated(
        &self,
        channel_id: ObjectId,
        params: &PaginationParams,
    ) -> StoreResult<PaginatedResult<ChannelMember>> {
        self.members
            .find_paginated(
                doc! { "channel_id": channel_id },
                doc! { "joined_at": 1, "_id": 1 },
                params,
            )
            .await
    }

    async fn find_memberships(&self, user_id: ObjectId) -> StoreResult<Vec<ChannelMember>> {
        self.members
            .find_many(
                doc! { "user_id": user_id },
                Some(doc! { "joined_at": 1, "_id": 1 }),
            )
            .await
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        self.messages.insert_one(message).await
    }

    async fn get_message(&self, id: ObjectId) -> StoreResult<Message> {
        self.messages.find_by_id(id).await
    }

    async fn find_messages(&self, filter: &MessageFilter) -> StoreResult<Vec<Message>> {
        self.messages
            .find_many(message_query(filter)?, Some(message_sort(filter.order)))
            .await
    }

    async fn find_messages_paginated(
        &self,
        filter: &MessageFilter,
        params: &PaginationParams,
    ) -> StoreResult<PaginatedResult<Message>> {
        self.messages
            .find_paginated(message_query(filter)?, message_sort(filter.order), params)
            .await
    }

    async fn update_message_content(
        &self,
        id: ObjectId,
        content: &str,
        mentions: Option<&[ObjectId]>,
        edited_at: DateTime,
    ) -> StoreResult<bool> {
        let mut set_doc = doc! {
            "content": content,
            "edited_at": edited_at,
            "updated_at": edited_at,
        };
        if let Some(mentions) = mentions {
            set_doc.insert("mentions", mentions.to_vec());
        }

        let matched = self
            .messages
            .update_one(
                doc! { "_id": id, "is_deleted": false },
                doc! { "$set": set_doc },
            )
            .await?;
        if matched {
            return Ok(true);
        }
        self.message_exists(id).await.map(|_| false)
    }

    async fn erase_message(&self, id: ObjectId, deleted_at: DateTime) -> StoreResult<bool> {
        let matched = self
            .messages
            .update_one(
                doc! { "_id": id, "is_deleted": false },
                doc! {
                    "$set": {
                        "is_deleted": true,
                        "deleted_at": deleted_at,
                        "content": "",
                        "attachments": [],
                        "reaction_summary": [],
                        "mentions": [],
                        "updated_at": deleted_at,
                    }
                },
            )
            .await?;
        if matched {
            debug!(?id, "Soft-deleted message");
            return Ok(true);
        }
        self.message_exists(id).await.map(|_| false)
    }

    async fn set_reaction_summary(
        &self,
        id: ObjectId,
        summary: &[ReactionSummary],
    ) -> StoreResult<()> {
        let summary_bson = to_bson(&summary)?;
        self.messages
            .update_one(
                doc! { "_id": id, "is_deleted": false },
                doc! { "$set": { "reaction_summary": summary_bson } },
            )
            .await?;
        Ok(())
    }

    async fn delete_message(&self, id: ObjectId) -> StoreResult<bool> {
        let deleted = self.messages.hard_delete(doc! { "_id": id }).await?;
        Ok(deleted > 0)
    }

    async fn insert_attachments(&self, attachments: &[Attachment]) -> StoreResult<()> {
        self.attachments.insert_many(attachments).await
    }

    async fn find_attachments(&self, message_id: ObjectId) -> StoreResult<Vec<Attachment>> {
        self.attachments
            .find_many(
                doc! { "message_id": message_id },
                Some(doc! { "created_at": 1, "_id": 1 }),
            )
            .await
    }

    async fn delete_attachments(&self, message_id: ObjectId) -> StoreResult<u64> {
        self.attachments
            .hard_delete(doc! { "message_id": message_id })
            .await
    }

    async fn upsert_reaction(&self, reaction: &Reaction) -> StoreResult<Reaction> {
        let filter = doc! {
            "message_id": reaction.message_id,
            "user_id": reaction.user_id,
            "emoji": reaction.emoji.as_str(),
        };
        let update = doc! {
            "$max": { "reacted_at": reaction.reacted_at },
            "$setOnInsert": {
                "_id": reaction.id,
                "channel_id": reaction.channel_id,
                "created_at": reaction.created_at,
            },
        };

        // Two concurrent upserts on a missing key race on the unique index;
        // the loser retries and lands on the update path.
        match self.reactions.upsert_one(filter.clone(), update.clone()).await {
            Err(StoreError::DuplicateKey(_)) => {
                self.reactions.upsert_one(filter.clone(), update).await?;
            }
            other => other?,
        }

        self.reactions
            .find_one(filter)
            .await?
            .ok_or(StoreError::NotFound("reaction"))
    }

    async fn delete_reaction(
        &self,
        message_id: ObjectId,
        user_id: ObjectId,
        emoji: &str,
    ) -> StoreResult<bool> {
        let deleted = self
            .reactions
            .hard_delete(doc! {
                "message_id": message_id,
                "user_id": user_id,
                "emoji": emoji,
            })
            .await?;
        Ok(deleted > 0)
    }

    async fn find_reactions(&self, message_id: ObjectId) -> StoreResult<Vec<Reaction>> {
        self.reactions
            .find_many(
                doc! { "message_id": message_id },
                Some(doc! { "created_at": 1, "_id": 1 }),
            )
            .await
    }

    async fn delete_reactions(&self, message_id: ObjectId) -> StoreResult<u64> {
        self.reactions
            .hard_delete(doc! { "message_id": message_id })
            .await
    }

    async fn insert_receipt(&self, receipt: &ReadReceipt) -> StoreResult<()> {
        self.receipts.insert_one(receipt).await
    }

    async fn latest_receipt(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> StoreResult<Option<ReadReceipt>> {
        self.receipts
            .find_one_sorted(
                pair(channel_id, user_id),
                doc! { "message_created_at": -1, "message_id": -1 },
            )
            .await
    }

    async fn find_receipts(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> StoreResult<Vec<ReadReceipt>> {
        self.receipts
            .find_many(pair(channel_id, user_id), Some(doc! { "read_at": 1, "_id": 1 }))
            .await
    }

    async fn get_read_status(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> StoreResult<Option<ChannelReadStatus>> {
        self.read_status.find_one(pair(channel_id, user_id)).await
    }

    async fn put_read_status(&self, status: &ChannelReadStatus) -> StoreResult<bool> {
        let mut filter = pair(status.channel_id, status.user_id);
        match status.cursor() {
            Some((at, id)) => {
                filter.insert(
                    "$or",
                    vec![
                        doc! { "last_read_message_at": null },
                        doc! { "last_read_message_at": { "$lt": at } },
                        doc! { "last_read_message_at": at, "last_read_message_id": { "$lte": id } },
                    ],
                );
            }
            None => {
                filter.insert("last_read_message_at", Bson::Null);
            }
        }
        let update = doc! {
            "$set": {
                "last_read_message_id": status.last_read_message_id,
                "last_read_message_at": status.last_read_message_at,
                "last_read_at": status.last_read_at,
                "unread_count": status.unread_count,
                "mention_count": status.mention_count,
                "updated_at": status.updated_at,
            },
            "$setOnInsert": { "_id": status.id },
        };

        // A stored cursor ahead of ours makes the filter miss and the upsert
        // collide with the unique (channel, user) index.
        match self.read_status.upsert_one(filter, update).await {
            Ok(()) => Ok(true),
            Err(StoreError::DuplicateKey(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn increment_unread(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        mentions: u32,
    ) -> StoreResult<()> {
        self.read_status
            .upsert_one(
                pair(channel_id, user_id),
                doc! {
                    "$inc": { "unread_count": 1, "mention_count": mentions },
                    "$set": { "updated_at": DateTime::now() },
                    "$setOnInsert": { "_id": ObjectId::new() },
                },
            )
            .await
    }

    async fn insert_rule(&self, rule: &ModerationRule) -> StoreResult<()> {
        self.rules.insert_one(rule).await
    }

    async fn get_rule(&self, id: ObjectId) -> StoreResult<ModerationRule> {
        self.rules.find_by_id(id).await
    }

    async fn set_rule_active(&self, id: ObjectId, active: bool) -> StoreResult<ModerationRule> {
        self.rules
            .find_one_and_update(
                doc! { "_id": id },
                doc! { "$set": { "is_active": active, "updated_at": DateTime::now() } },
            )
            .await?
            .ok_or(StoreError::NotFound("moderation rule"))
    }

    async fn find_rules(
        &self,
        server_id: ObjectId,
        active_only: bool,
    ) -> StoreResult<Vec<ModerationRule>> {
        let mut filter = doc! { "server_id": server_id };
        if active_only {
            filter.insert("is_active", true);
        }
        self.rules
            .find_many(filter, Some(doc! { "severity": 1, "created_at": 1, "_id": 1 }))
            .await
    }

    async fn insert_violation(&self, violation: &ModerationViolation) -> StoreResult<()> {
        self.violations.insert_one(violation).await
    }

    async fn get_violation(&self, id: ObjectId) -> StoreResult<ModerationViolation> {
        self.violations.find_by_id(id).await
    }

    async fn update_violation(&self, violation: &ModerationViolation) -> StoreResult<()> {
        let matched = self
            .violations
            .replace_one(doc! { "_id": violation.id }, violation)
            .await?;
        if !matched {
            return Err(StoreError::NotFound("violation"));
        }
        Ok(())
    }

    async fn find_violations(
        &self,
        server_id: ObjectId,
        status: Option<ViolationStatus>,
    ) -> StoreResult<Vec<ModerationViolation>> {
        let mut filter = doc! { "server_id": server_id };
        if let Some(status) = status {
            filter.insert("status", to_bson(&status)?);
        }
        self.violations
            .find_many(filter, Some(doc! { "created_at": 1, "_id": 1 }))
            .await
    }

    async fn insert_warning(&self, warning: &Warning) -> StoreResult<()> {
        self.warnings.insert_one(warning).await
    }

    async fn count_active_warnings(
        &self,
        server_id: ObjectId,
        user_id: ObjectId,
        now: DateTime,
    ) -> StoreResult<u64> {
        self.warnings
            .count(doc! {
                "server_id": server_id,
                "user_id": user_id,
                "expires_at": { "$gt": now },
            })
            .await
    }

    async fn insert_ban(&self, ban: &ServerBan) -> StoreResult<()> {
        self.bans.insert_one(ban).await
    }

    async fn find_active_ban(
        &self,
        server_id: ObjectId,
        user_id: ObjectId,
        now: DateTime,
    ) -> StoreResult<Option<ServerBan>> {
        self.bans
            .find_one(doc! {
                "server_id": server_id,
                "user_id": user_id,
                "$or": [
                    { "expires_at": null },
                    { "expires_at": { "$gt": now } },
                ],
            })
            .await
    }

    async fn get_server_settings(
        &self,
        server_id: ObjectId,
    ) -> StoreResult<Option<ServerModerationSettings>> {
        self.server_settings
            .find_one(doc! { "_id": server_id })
            .await
    }

    async fn put_server_settings(&self, settings: &ServerModerationSettings) -> StoreResult<()> {
        self.server_settings
            .collection()
            .replace_one(doc! { "_id": settings.server_id }, settings)
            .upsert(true)
            .await
            .map_err(|e| self.server_settings.err(e))?;
        Ok(())
    }
}
