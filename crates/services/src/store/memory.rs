use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bson::{oid::ObjectId, DateTime};
use dashmap::{mapref::entry::Entry, DashMap};
use threadline_db::models::{
    Attachment, Channel, ChannelMember, ChannelReadStatus, MemberRole, Message, ModerationRule,
    ModerationViolation, Reaction, ReactionSummary, ReadReceipt, ServerBan,
    ServerModerationSettings, ViolationStatus, Warning,
};
use tracing::debug;

use super::{
    ChannelUpdate, MessageFilter, PaginatedResult, PaginationParams, SortOrder, Store,
    StoreError, StoreResult,
};

type PairKey = (ObjectId, ObjectId);
type ReactionKey = (ObjectId, ObjectId, String);

/// Process-local store. Each call locks only the map shards it touches, so
/// per-key operations are atomic without a global lock.
#[derive(Default)]
pub struct MemoryStore {
    channels: DashMap<ObjectId, Channel>,
    members: DashMap<PairKey, ChannelMember>,
    messages: DashMap<ObjectId, Message>,
    attachments: DashMap<ObjectId, Attachment>,
    reactions: DashMap<ReactionKey, Reaction>,
    receipts: DashMap<PairKey, Vec<ReadReceipt>>,
    read_status: DashMap<PairKey, ChannelReadStatus>,
    rules: DashMap<ObjectId, ModerationRule>,
    violations: DashMap<ObjectId, ModerationViolation>,
    // Keyed by violation id: at most one warning per violation.
    warnings: DashMap<ObjectId, Warning>,
    // Keyed by violation id, or the ban's own id for manual bans.
    bans: DashMap<ObjectId, ServerBan>,
    server_settings: DashMap<ObjectId, ServerModerationSettings>,
    // (server, name) of direct channels, mirroring the partial unique index.
    direct_names: DashMap<(ObjectId, String), ObjectId>,
    unavailable: AtomicBool,
    faults: DashMap<&'static str, u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: while set, every call fails with `Transient`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next `times` calls of the named store method fail with
    /// `Transient`, leaving every other method working.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        *self.faults.entry(op).or_insert(0) += times;
    }

    fn check(&self, op: &'static str) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("memory store marked unavailable".to_string()));
        }
        if let Some(mut pending) = self.faults.get_mut(op) {
            if *pending > 0 {
                *pending -= 1;
                debug!(op, "Injected store fault");
                return Err(StoreError::Transient(format!("injected fault in {op}")));
            }
        }
        Ok(())
    }

    fn sorted_messages(&self, filter: &MessageFilter) -> Vec<Message> {
        let mut found: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| filter.matches(m.value()))
            .map(|m| m.value().clone())
            .collect();
        found.sort_by_key(|m| m.position());
        if filter.order == SortOrder::Descending {
            found.reverse();
        }
        found
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_channel(&self, channel: &Channel) -> StoreResult<()> {
        self.check("insert_channel")?;
        let Entry::Vacant(slot) = self.channels.entry(channel.id) else {
            return Err(StoreError::DuplicateKey("channel"));
        };
        if channel.is_direct() {
            match self
                .direct_names
                .entry((channel.server_id, channel.name.clone()))
            {
                Entry::Occupied(_) => return Err(StoreError::DuplicateKey("channel")),
                Entry::Vacant(name) => {
                    name.insert(channel.id);
                }
            }
        }
        slot.insert(channel.clone());
        Ok(())
    }

    async fn delete_channel(&self, id: ObjectId) -> StoreResult<bool> {
        self.check("delete_channel")?;
        let Some((_, channel)) = self.channels.remove(&id) else {
            return Ok(false);
        };
        if channel.is_direct() {
            self.direct_names.remove(&(channel.server_id, channel.name));
        }
        Ok(true)
    }

    async fn get_channel(&self, id: ObjectId) -> StoreResult<Channel> {
        self.check("get_channel")?;
        self.channels
            .get(&id)
            .map(|c| c.clone())
            .ok_or(StoreError::NotFound("channel"))
    }

    async fn find_direct_channel(
        &self,
        server_id: ObjectId,
        name: &str,
    ) -> StoreResult<Option<Channel>> {
        self.check("find_direct_channel")?;
        let Some(id) = self
            .direct_names
            .get(&(server_id, name.to_string()))
            .map(|id| *id)
        else {
            return Ok(None);
        };
        Ok(self.channels.get(&id).map(|c| c.clone()))
    }

    async fn find_channels(&self, ids: &[ObjectId]) -> StoreResult<Vec<Channel>> {
        self.check("find_channels")?;
        let mut found: Vec<Channel> = ids
            .iter()
            .filter_map(|id| self.channels.get(id).map(|c| c.clone()))
            .collect();
        found.sort_by_key(|c| (c.created_at, c.id));
        Ok(found)
    }

    async fn update_channel(&self, id: ObjectId, update: &ChannelUpdate) -> StoreResult<Channel> {
        self.check("update_channel")?;
        let mut channel = self
            .channels
            .get_mut(&id)
            .ok_or(StoreError::NotFound("channel"))?;
        if let Some(name) = &update.name {
            channel.name = name.clone();
        }
        if let Some(description) = &update.description {
            channel.description = Some(description.clone());
        }
        if let Some(archived) = update.is_archived {
            channel.is_archived = archived;
        }
        channel.updated_at = DateTime::now();
        Ok(channel.clone())
    }

    async fn adjust_member_count(&self, id: ObjectId, delta: i32) -> StoreResult<()> {
        self.check("adjust_member_count")?;
        let mut channel = self
            .channels
            .get_mut(&id)
            .ok_or(StoreError::NotFound("channel"))?;
        channel.member_count = channel.member_count.saturating_add_signed(delta);
        Ok(())
    }

    async fn record_channel_activity(
        &self,
        id: ObjectId,
        message_id: ObjectId,
        at: DateTime,
    ) -> StoreResult<()> {
        self.check("record_channel_activity")?;
        let mut channel = self
            .channels
            .get_mut(&id)
            .ok_or(StoreError::NotFound("channel"))?;
        channel.message_count += 1;
        if channel.last_activity_at.is_none_or(|last| last <= at) {
            channel.last_activity_at = Some(at);
            channel.last_message_id = Some(message_id);
        }
        Ok(())
    }

    async fn insert_member(&self, member: &ChannelMember) -> StoreResult<()> {
        self.check("insert_member")?;
        match self.members.entry((member.channel_id, member.user_id)) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey("membership")),
            Entry::Vacant(slot) => {
                slot.insert(member.clone());
                debug!(channel_id = ?member.channel_id, user_id = ?member.user_id, "Inserted member");
                Ok(())
            }
        }
    }

    async fn get_member(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> StoreResult<ChannelMember> {
        self.check("get_member")?;
        self.members
            .get(&(channel_id, user_id))
            .map(|m| m.clone())
            .ok_or(StoreError::NotFound("membership"))
    }

    async fn update_member_role(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        role: MemberRole,
    ) -> StoreResult<ChannelMember> {
        self.check("update_member_role")?;
        let mut member = self
            .members
            .get_mut(&(channel_id, user_id))
            .ok_or(StoreError::NotFound("membership"))?;
        member.role = role;
        member.updated_at = DateTime::now();
        Ok(member.clone())
    }

    async fn set_member_mute(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        muted: bool,
        until: Option<DateTime>,
    ) -> StoreResult<ChannelMember> {
        self.check("set_member_mute")?;
        let mut member = self
            .members
            .get_mut(&(channel_id, user_id))
            .ok_or(StoreError::NotFound("membership"))?;
        member.is_muted = muted;
        member.muted_until = if muted { until } else { None };
        member.updated_at = DateTime::now();
        Ok(member.clone())
    }

    async fn delete_member(&self, channel_id: ObjectId, user_id: ObjectId) -> StoreResult<bool> {
        self.check("delete_member")?;
        Ok(self.members.remove(&(channel_id, user_id)).is_some())
    }

    async fn find_members(&self, channel_id: ObjectId) -> StoreResult<Vec<ChannelMember>> {
        self.check("find_members")?;
        let mut found: Vec<ChannelMember> = self
            .members
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .map(|m| m.value().clone())
            .collect();
        found.sort_by_key(|m| (m.joined_at, m.id));
        Ok(found)
    }

    async fn find_members_paginated(
        &self,
        channel_id: ObjectId,
        params: &PaginationParams,
    ) -> StoreResult<PaginatedResult<ChannelMember>> {
        let all = self.find_members(channel_id).await?;
        Ok(PaginatedResult::from_sorted(all, params))
    }

    async fn find_memberships(&self, user_id: ObjectId) -> StoreResult<Vec<ChannelMember>> {
        self.check("find_memberships")?;
        let mut found: Vec<ChannelMember> = self
            .members
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.value().clone())
            .collect();
        found.sort_by_key(|m| (m.joined_at, m.id));
        Ok(found)
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        self.check("insert_message")?;
        match self.messages.entry(message.id) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey("message")),
            Entry::Vacant(slot) => {
                slot.insert(message.clone());
                Ok(())
            }
        }
    }

    async fn get_message(&self, id: ObjectId) -> StoreResult<Message> {
        self.check("get_message")?;
        self.messages
            .get(&id)
            .map(|m| m.clone())
            .ok_or(StoreError::NotFound("message"))
    }

    async fn find_messages(&self, filter: &MessageFilter) -> StoreResult<Vec<Message>> {
        self.check("find_messages")?;
        Ok(self.sorted_messages(filter))
    }

    async fn find_messages_paginated(
        &self,
        filter: &MessageFilter,
        params: &PaginationParams,
    ) -> StoreResult<PaginatedResult<Message>> {
        self.check("find_messages_paginated")?;
        Ok(PaginatedResult::from_sorted(self.sorted_messages(filter), params))
    }

    async fn update_message_content(
        &self,
        id: ObjectId,
        content: &str,
        mentions: Option<&[ObjectId]>,
        edited_at: DateTime,
    ) -> StoreResult<bool> {
        self.check("update_message_content")?;
        let mut message = self
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound("message"))?;
        if message.is_deleted {
            return Ok(false);
        }
        message.content = content.to_string();
        if let Some(mentions) = mentions {
            message.mentions = mentions.to_vec();
        }
        message.edited_at = Some(edited_at);
        message.updated_at = edited_at;
        Ok(true)
    }

    async fn erase_message(&self, id: ObjectId, deleted_at: DateTime) -> StoreResult<bool> {
        self.check("erase_message")?;
        let mut message = self
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound("message"))?;
        if message.is_deleted {
            return Ok(false);
        }
        message.is_deleted = true;
        message.deleted_at = Some(deleted_at);
        message.content.clear();
        message.attachments.clear();
        message.reaction_summary.clear();
        message.mentions.clear();
        message.updated_at = deleted_at;
        Ok(true)
    }

    async fn set_reaction_summary(
        &self,
        id: ObjectId,
        summary: &[ReactionSummary],
    ) -> StoreResult<()> {
        self.check("set_reaction_summary")?;
        let mut message = self
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound("message"))?;
        if !message.is_deleted {
            message.reaction_summary = summary.to_vec();
        }
        Ok(())
    }

    async fn delete_message(&self, id: ObjectId) -> StoreResult<bool> {
        self.check("delete_message")?;
        Ok(self.messages.remove(&id).is_some())
    }

    async fn insert_attachments(&self, attachments: &[Attachment]) -> StoreResult<()> {
        self.check("insert_attachments")?;
        for attachment in attachments {
            self.attachments.insert(attachment.id, attachment.clone());
        }
        Ok(())
    }

    async fn find_attachments(&self, message_id: ObjectId) -> StoreResult<Vec<Attachment>> {
        self.check("find_attachments")?;
        let mut found: Vec<Attachment> = self
            .attachments
            .iter()
            .filter(|a| a.message_id == message_id)
            .map(|a| a.value().clone())
            .collect();
        found.sort_by_key(|a| (a.created_at, a.id));
        Ok(found)
    }

    async fn delete_attachments(&self, message_id: ObjectId) -> StoreResult<u64> {
        self.check("delete_attachments")?;
        let before = self.attachments.len();
        self.attachments.retain(|_, a| a.message_id != message_id);
        Ok((before - self.attachments.len()) as u64)
    }

    async fn upsert_reaction(&self, reaction: &Reaction) -> StoreResult<Reaction> {
        self.check("upsert_reaction")?;
        let key = (reaction.message_id, reaction.user_id, reaction.emoji.clone());
        let stored = match self.reactions.entry(key) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                existing.reacted_at = existing.reacted_at.max(reaction.reacted_at);
                existing.clone()
            }
            Entry::Vacant(slot) => slot.insert(reaction.clone()).clone(),
        };
        Ok(stored)
    }

    async fn delete_reaction(
        &self,
        message_id: ObjectId,
        user_id: ObjectId,
        emoji: &str,
    ) -> StoreResult<bool> {
        self.check("delete_reaction")?;
        Ok(self
            .reactions
            .remove(&(message_id, user_id, emoji.to_string()))
            .is_some())
    }

    async fn find_reactions(&self, message_id: ObjectId) -> StoreResult<Vec<Reaction>> {
        self.check("find_reactions")?;
        let mut found: Vec<Reaction> = self
            .reactions
            .iter()
            .filter(|r| r.message_id == message_id)
            .map(|r| r.value().clone())
            .collect();
        found.sort_by_key(|r| (r.created_at, r.id));
        Ok(found)
    }

    async fn delete_reactions(&self, message_id: ObjectId) -> StoreResult<u64> {
        self.check("delete_reactions")?;
        let before = self.reactions.len();
        self.reactions.retain(|key, _| key.0 != message_id);
        Ok((before - self.reactions.len()) as u64)
    }

    async fn insert_receipt(&self, receipt: &ReadReceipt) -> StoreResult<()> {
        self.check("insert_receipt")?;
        self.receipts
            .entry((receipt.channel_id, receipt.user_id))
            .or_default()
            .push(receipt.clone());
        Ok(())
    }

    async fn latest_receipt(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> StoreResult<Option<ReadReceipt>> {
        self.check("latest_receipt")?;
        Ok(self.receipts.get(&(channel_id, user_id)).and_then(|list| {
            list.iter().max_by_key(|r| r.position()).cloned()
        }))
    }

    async fn find_receipts(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> StoreResult<Vec<ReadReceipt>> {
        self.check("find_receipts")?;
        Ok(self
            .receipts
            .get(&(channel_id, user_id))
            .map(|list| list.clone())
            .unwrap_or_default())
    }

    async fn get_read_status(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> StoreResult<Option<ChannelReadStatus>> {
        self.check("get_read_status")?;
        Ok(self.read_status.get(&(channel_id, user_id)).map(|s| s.clone()))
    }

    async fn put_read_status(&self, status: &ChannelReadStatus) -> StoreResult<bool> {
        self.check("put_read_status")?;
        match self.read_status.entry((status.channel_id, status.user_id)) {
            Entry::Occupied(mut slot) => {
                if slot.get().cursor() > status.cursor() {
                    return Ok(false);
                }
                let id = slot.get().id;
                let mut next = status.clone();
                next.id = id;
                slot.insert(next);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(status.clone());
                Ok(true)
            }
        }
    }

    async fn increment_unread(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        mentions: u32,
    ) -> StoreResult<()> {
        self.check("increment_unread")?;
        let mut status = self
            .read_status
            .entry((channel_id, user_id))
            .or_insert_with(|| ChannelReadStatus::empty(channel_id, user_id));
        status.unread_count += 1;
        status.mention_count += mentions;
        status.updated_at = DateTime::now();
        Ok(())
    }

    async fn insert_rule(&self, rule: &ModerationRule) -> StoreResult<()> {
        self.check("insert_rule")?;
        match self.rules.entry(rule.id) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey("moderation rule")),
            Entry::Vacant(slot) => {
                slot.insert(rule.clone());
                Ok(())
            }
        }
    }

    async fn get_rule(&self, id: ObjectId) -> StoreResult<ModerationRule> {
        self.check("get_rule")?;
        self.rules
            .get(&id)
            .map(|r| r.clone())
            .ok_or(StoreError::NotFound("moderation rule"))
    }

    async fn set_rule_active(&self, id: ObjectId, active: bool) -> StoreResult<ModerationRule> {
        self.check("set_rule_active")?;
        let mut rule = self
            .rules
            .get_mut(&id)
            .ok_or(StoreError::NotFound("moderation rule"))?;
        rule.is_active = active;
        rule.updated_at = DateTime::now();
        Ok(rule.clone())
    }

    async fn find_rules(
        &self,
        server_id: ObjectId,
        active_only: bool,
    ) -> StoreResult<Vec<ModerationRule>> {
        self.check("find_rules")?;
        let mut found: Vec<ModerationRule> = self
            .rules
            .iter()
            .filter(|r| r.server_id == server_id && (!active_only || r.is_active))
            .map(|r| r.value().clone())
            .collect();
        found.sort_by_key(|r| (r.severity, r.created_at, r.id));
        Ok(found)
    }

    async fn insert_violation(&self, violation: &ModerationViolation) -> StoreResult<()> {
        self.check("insert_violation")?;
        match self.violations.entry(violation.id) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey("violation")),
            Entry::Vacant(slot) => {
                slot.insert(violation.clone());
                Ok(())
            }
        }
    }

    async fn get_violation(&self, id: ObjectId) -> StoreResult<ModerationViolation> {
        self.check("get_violation")?;
        self.violations
            .get(&id)
            .map(|v| v.clone())
            .ok_or(StoreError::NotFound("violation"))
    }

    async fn update_violation(&self, violation: &ModerationViolation) -> StoreResult<()> {
        self.check("update_violation")?;
        let mut stored = self
            .violations
            .get_mut(&violation.id)
            .ok_or(StoreError::NotFound("violation"))?;
        *stored = violation.clone();
        Ok(())
    }

    async fn find_violations(
        &self,
        server_id: ObjectId,
        status: Option<ViolationStatus>,
    ) -> StoreResult<Vec<ModerationViolation>> {
        self.check("find_violations")?;
        let mut found: Vec<ModerationViolation> = self
            .violations
            .iter()
            .filter(|v| v.server_id == server_id && status.is_none_or(|s| s == v.status))
            .map(|v| v.value().clone())
            .collect();
        found.sort_by_key(|v| (v.created_at, v.id));
        Ok(found)
    }

    async fn insert_warning(&self, warning: &Warning) -> StoreResult<()> {
        self.check("insert_warning")?;
        match self.warnings.entry(warning.violation_id) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey("warning")),
            Entry::Vacant(slot) => {
                slot.insert(warning.clone());
                Ok(())
            }
        }
    }

    async fn count_active_warnings(
        &self,
        server_id: ObjectId,
        user_id: ObjectId,
        now: DateTime,
    ) -> StoreResult<u64> {
        self.check("count_active_warnings")?;
        Ok(self
            .warnings
            .iter()
            .filter(|w| w.server_id == server_id && w.user_id == user_id && w.expires_at > now)
            .count() as u64)
    }

    async fn insert_ban(&self, ban: &ServerBan) -> StoreResult<()> {
        self.check("insert_ban")?;
        match self.bans.entry(ban.violation_id.unwrap_or(ban.id)) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey("ban")),
            Entry::Vacant(slot) => {
                slot.insert(ban.clone());
                Ok(())
            }
        }
    }

    async fn find_active_ban(
        &self,
        server_id: ObjectId,
        user_id: ObjectId,
        now: DateTime,
    ) -> StoreResult<Option<ServerBan>> {
        self.check("find_active_ban")?;
        Ok(self
            .bans
            .iter()
            .find(|b| b.server_id == server_id && b.user_id == user_id && b.is_active_at(now))
            .map(|b| b.value().clone()))
    }

    async fn get_server_settings(
        &self,
        server_id: ObjectId,
    ) -> StoreResult<Option<ServerModerationSettings>> {
        self.check("get_server_settings")?;
        Ok(self.server_settings.get(&server_id).map(|s| s.clone()))
    }

    async fn put_server_settings(&self, settings: &ServerModerationSettings) -> StoreResult<()> {
        self.check("put_server_settings")?;
        self.server_settings
            .insert(settings.server_id, settings.clone());
        Ok(())
    }
}
