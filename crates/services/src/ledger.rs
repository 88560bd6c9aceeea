//! Channel records and per-user membership. Every other component asks
//! this ledger before mutating anything on a user's behalf.

use std::sync::Arc;

use bson::{oid::ObjectId, DateTime};
use threadline_db::models::{Channel, ChannelMember, ChannelType, MemberRole, ServerBan};
use tracing::{debug, info, warn};

use crate::error::{Conflict, InvalidState, ServiceError, ServiceResult};
use crate::events::{EventKind, EventPublisher};
use crate::store::{ChannelUpdate, PaginatedResult, PaginationParams, Store, StoreError};

#[derive(Debug, Clone)]
pub struct CreateChannel {
    pub server_id: ObjectId,
    pub channel_type: ChannelType,
    pub name: String,
    pub description: Option<String>,
    pub creator_id: ObjectId,
    /// For direct channels: exactly the two participants, creator included.
    /// Otherwise: extra users joining as plain members.
    pub participant_ids: Vec<ObjectId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The member removes themselves.
    Leave,
    /// An admin or owner removes someone they outrank.
    Kick,
    /// The channel is being dissolved; the owner may be removed too. Only
    /// honored once the channel is archived.
    Teardown,
}

pub struct MembershipLedger {
    store: Arc<dyn Store>,
    publisher: Arc<dyn EventPublisher>,
}

impl MembershipLedger {
    pub fn new(store: Arc<dyn Store>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }

    pub async fn create_channel(&self, req: CreateChannel) -> ServiceResult<Channel> {
        if req.channel_type == ChannelType::Direct {
            return self.create_direct_channel(req).await;
        }

        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(ServiceError::InvalidState(InvalidState::InvalidChannelName));
        }

        let mut participants: Vec<ObjectId> = Vec::new();
        for user_id in req.participant_ids {
            if user_id != req.creator_id && !participants.contains(&user_id) {
                participants.push(user_id);
            }
        }

        let now = DateTime::now();
        let channel = Channel {
            id: ObjectId::new(),
            server_id: req.server_id,
            channel_type: req.channel_type,
            name,
            description: req.description,
            creator_id: req.creator_id,
            is_archived: false,
            last_message_id: None,
            last_activity_at: None,
            member_count: 1 + participants.len() as u32,
            message_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_channel(&channel).await?;

        let members: Vec<ChannelMember> =
            std::iter::once(new_member(channel.id, req.creator_id, MemberRole::Owner, now))
                .chain(
                    participants
                        .into_iter()
                        .map(|user_id| new_member(channel.id, user_id, MemberRole::Member, now)),
                )
                .collect();
        self.seed_members(&channel, &members).await?;

        info!(channel_id = ?channel.id, creator_id = ?channel.creator_id, "Channel created");
        self.publish_channel(EventKind::ChannelCreated, &channel);
        Ok(channel)
    }

    async fn create_direct_channel(&self, req: CreateChannel) -> ServiceResult<Channel> {
        let [a, b] = req.participant_ids[..] else {
            return Err(ServiceError::InvalidState(InvalidState::InvalidParticipants));
        };
        if a == b {
            return Err(ServiceError::Conflict(Conflict::DirectChannelWithSelf));
        }
        if req.creator_id != a && req.creator_id != b {
            return Err(ServiceError::InsufficientRole(
                "creator must be a direct channel participant",
            ));
        }

        let name = Channel::direct_name(a, b);
        let now = DateTime::now();
        let channel = Channel {
            id: ObjectId::new(),
            server_id: req.server_id,
            channel_type: ChannelType::Direct,
            name,
            description: None,
            creator_id: req.creator_id,
            is_archived: false,
            last_message_id: None,
            last_activity_at: None,
            member_count: 2,
            message_count: 0,
            created_at: now,
            updated_at: now,
        };
        // The pair's unique name decides the winner when two creations race.
        match self.store.insert_channel(&channel).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey(_)) => {
                let existing = self
                    .store
                    .find_direct_channel(req.server_id, &channel.name)
                    .await?
                    .ok_or(ServiceError::NotFound("channel"))?;
                debug!(channel_id = ?existing.id, "Reusing direct channel");
                return Ok(existing);
            }
            Err(e) => return Err(e.into()),
        }
        let members = [a, b].map(|user_id| new_member(channel.id, user_id, MemberRole::Member, now));
        self.seed_members(&channel, &members).await?;

        info!(channel_id = ?channel.id, "Direct channel created");
        self.publish_channel(EventKind::ChannelCreated, &channel);
        Ok(channel)
    }

    /// Writes the initial memberships of a freshly inserted channel. On
    /// failure the channel and any rows already written are removed again.
    async fn seed_members(&self, channel: &Channel, members: &[ChannelMember]) -> ServiceResult<()> {
        for (written, member) in members.iter().enumerate() {
            if let Err(e) = self.store.insert_member(member).await {
                warn!(channel_id = ?channel.id, error = %e, "Channel creation failed, rolling back");
                self.rollback_channel(channel.id, &members[..written]).await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn rollback_channel(&self, channel_id: ObjectId, members: &[ChannelMember]) {
        for member in members {
            if let Err(e) = self.store.delete_member(channel_id, member.user_id).await {
                warn!(?channel_id, user_id = ?member.user_id, error = %e, "Rollback left a membership behind");
            }
        }
        if let Err(e) = self.store.delete_channel(channel_id).await {
            warn!(?channel_id, error = %e, "Rollback left the channel behind");
        }
    }

    pub async fn get_channel(&self, channel_id: ObjectId) -> ServiceResult<Channel> {
        Ok(self.store.get_channel(channel_id).await?)
    }

    pub async fn update_channel(
        &self,
        channel_id: ObjectId,
        actor_id: ObjectId,
        name: Option<String>,
        description: Option<String>,
    ) -> ServiceResult<Channel> {
        let channel = self.store.get_channel(channel_id).await?;
        if channel.is_direct() {
            return Err(ServiceError::Conflict(Conflict::DirectChannelMembership));
        }
        self.require_admin(channel_id, actor_id).await?;

        let name = match name {
            Some(name) if name.trim().is_empty() => {
                return Err(ServiceError::InvalidState(InvalidState::InvalidChannelName));
            }
            other => other.map(|n| n.trim().to_string()),
        };
        let update = ChannelUpdate {
            name,
            description,
            is_archived: None,
        };
        if update.is_empty() {
            return Ok(channel);
        }

        let channel = self.store.update_channel(channel_id, &update).await?;
        self.publish_channel(EventKind::ChannelUpdated, &channel);
        Ok(channel)
    }

    pub async fn archive_channel(
        &self,
        channel_id: ObjectId,
        actor_id: ObjectId,
    ) -> ServiceResult<Channel> {
        let channel = self.store.get_channel(channel_id).await?;
        if channel.is_direct() {
            return Err(ServiceError::Conflict(Conflict::DirectChannelMembership));
        }
        self.require_admin(channel_id, actor_id).await?;
        if channel.is_archived {
            return Ok(channel);
        }

        let channel = self.set_archived(channel_id).await?;
        info!(?channel_id, ?actor_id, "Channel archived");
        Ok(channel)
    }

    /// Owner-only teardown: archives the channel and drops every membership,
    /// the owner's included.
    pub async fn dissolve_channel(
        &self,
        channel_id: ObjectId,
        actor_id: ObjectId,
    ) -> ServiceResult<Channel> {
        let channel = self.store.get_channel(channel_id).await?;
        if channel.is_direct() {
            return Err(ServiceError::Conflict(Conflict::DirectChannelMembership));
        }
        let actor = self.require_member(channel_id, actor_id).await?;
        if actor.role != MemberRole::Owner {
            return Err(ServiceError::InsufficientRole("owner required"));
        }

        if !channel.is_archived {
            self.set_archived(channel_id).await?;
        }
        let mut members = self.store.find_members(channel_id).await?;
        // Owner last, so the authority check holds for every removal.
        members.sort_by_key(|m| m.role == MemberRole::Owner);
        for member in members {
            self.remove_member(channel_id, actor_id, member.user_id, Removal::Teardown)
                .await?;
        }
        info!(?channel_id, "Channel dissolved");
        Ok(self.store.get_channel(channel_id).await?)
    }

    async fn set_archived(&self, channel_id: ObjectId) -> ServiceResult<Channel> {
        let update = ChannelUpdate {
            is_archived: Some(true),
            ..Default::default()
        };
        let channel = self.store.update_channel(channel_id, &update).await?;
        self.publish_channel(EventKind::ChannelUpdated, &channel);
        Ok(channel)
    }

    pub async fn add_member(
        &self,
        channel_id: ObjectId,
        actor_id: ObjectId,
        user_id: ObjectId,
        role: MemberRole,
    ) -> ServiceResult<ChannelMember> {
        let channel = self.store.get_channel(channel_id).await?;
        if channel.is_direct() {
            return Err(ServiceError::Conflict(Conflict::DirectChannelMembership));
        }
        if channel.is_archived {
            return Err(ServiceError::InvalidState(InvalidState::ChannelArchived));
        }
        if role == MemberRole::Owner {
            return Err(ServiceError::Conflict(Conflict::OwnerRoleImmutable));
        }

        let self_join =
            actor_id == user_id && channel.channel_type == ChannelType::Public && role == MemberRole::Member;
        if !self_join {
            let actor = self.require_admin(channel_id, actor_id).await?;
            if role >= actor.role {
                return Err(ServiceError::InsufficientRole("cannot grant a role at or above your own"));
            }
        }
        if self.active_ban(channel.server_id, user_id).await?.is_some() {
            return Err(ServiceError::Restricted("user is banned from this server"));
        }

        let member = new_member(channel_id, user_id, role, DateTime::now());
        match self.store.insert_member(&member).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey(_)) => {
                return Err(ServiceError::AlreadyExists("membership"));
            }
            Err(e) => return Err(e.into()),
        }
        self.store.adjust_member_count(channel_id, 1).await?;

        info!(?channel_id, ?user_id, ?role, "Member added");
        self.publish_member(EventKind::MemberJoined, channel_id, user_id, Some(role));
        Ok(member)
    }

    pub async fn remove_member(
        &self,
        channel_id: ObjectId,
        actor_id: ObjectId,
        user_id: ObjectId,
        removal: Removal,
    ) -> ServiceResult<()> {
        let channel = self.store.get_channel(channel_id).await?;
        if channel.is_direct() {
            return Err(ServiceError::Conflict(Conflict::DirectChannelMembership));
        }
        let target = self.require_member(channel_id, user_id).await?;

        match removal {
            Removal::Leave => {
                if actor_id != user_id {
                    return Err(ServiceError::InsufficientRole("only the member can leave"));
                }
            }
            Removal::Kick => {
                let actor = self.require_admin(channel_id, actor_id).await?;
                if target.role == MemberRole::Owner {
                    return Err(ServiceError::Conflict(Conflict::CannotRemoveOwner));
                }
                if actor.role <= target.role {
                    return Err(ServiceError::InsufficientRole(
                        "cannot remove a member of equal or higher role",
                    ));
                }
            }
            Removal::Teardown => {
                if !channel.is_archived {
                    return Err(ServiceError::Conflict(Conflict::ChannelNotDissolving));
                }
                if !self.is_owner(channel_id, actor_id).await? {
                    return Err(ServiceError::InsufficientRole("owner required"));
                }
            }
        }

        let mut archive = false;
        if target.role == MemberRole::Owner && removal != Removal::Teardown {
            let members = self.store.find_members(channel_id).await?;
            if members.iter().any(|m| m.user_id != user_id) {
                return Err(ServiceError::Conflict(Conflict::CannotRemoveOwner));
            }
            archive = true;
        }

        self.detach(&channel, user_id).await?;
        if archive && !channel.is_archived {
            self.set_archived(channel_id).await?;
            info!(?channel_id, "Last member left, channel archived");
        }
        Ok(())
    }

    /// Moderation-side removal: no actor, but the owner stays protected.
    /// Direct channels keep both rows; the server ban alone restricts them.
    pub(crate) async fn expel_member(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<()> {
        let channel = self.store.get_channel(channel_id).await?;
        let target = self.require_member(channel_id, user_id).await?;
        if target.role == MemberRole::Owner {
            return Err(ServiceError::Conflict(Conflict::CannotRemoveOwner));
        }
        if channel.is_direct() {
            return Ok(());
        }
        self.detach(&channel, user_id).await
    }

    async fn detach(&self, channel: &Channel, user_id: ObjectId) -> ServiceResult<()> {
        if self.store.delete_member(channel.id, user_id).await? {
            self.store.adjust_member_count(channel.id, -1).await?;
            info!(channel_id = ?channel.id, ?user_id, "Member removed");
            self.publish_member(EventKind::MemberLeft, channel.id, user_id, None);
        }
        Ok(())
    }

    pub async fn update_role(
        &self,
        channel_id: ObjectId,
        actor_id: ObjectId,
        user_id: ObjectId,
        role: MemberRole,
    ) -> ServiceResult<ChannelMember> {
        let channel = self.store.get_channel(channel_id).await?;
        if channel.is_direct() {
            return Err(ServiceError::Conflict(Conflict::DirectChannelMembership));
        }
        if role == MemberRole::Owner {
            return Err(ServiceError::Conflict(Conflict::OwnerRoleImmutable));
        }
        let actor = self.require_admin(channel_id, actor_id).await?;
        let target = self.require_member(channel_id, user_id).await?;
        if target.role == MemberRole::Owner {
            return Err(ServiceError::Conflict(Conflict::OwnerRoleImmutable));
        }
        if actor.role <= target.role || actor.role <= role {
            return Err(ServiceError::InsufficientRole("role change exceeds your own role"));
        }
        if target.role == role {
            return Ok(target);
        }

        let member = self.store.update_member_role(channel_id, user_id, role).await?;
        info!(?channel_id, ?user_id, ?role, "Member role updated");
        self.publish_member(EventKind::MemberRoleChanged, channel_id, user_id, Some(role));
        Ok(member)
    }

    pub async fn mute_member(
        &self,
        channel_id: ObjectId,
        actor_id: ObjectId,
        user_id: ObjectId,
        until: Option<DateTime>,
    ) -> ServiceResult<ChannelMember> {
        let actor = self.require_admin(channel_id, actor_id).await?;
        let target = self.require_member(channel_id, user_id).await?;
        if actor.role <= target.role {
            return Err(ServiceError::InsufficientRole("cannot mute a member of equal or higher role"));
        }
        self.apply_mute(channel_id, user_id, until).await
    }

    pub async fn unmute_member(
        &self,
        channel_id: ObjectId,
        actor_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<ChannelMember> {
        self.require_admin(channel_id, actor_id).await?;
        self.require_member(channel_id, user_id).await?;
        let member = self
            .store
            .set_member_mute(channel_id, user_id, false, None)
            .await?;
        self.publish_mute(&member);
        Ok(member)
    }

    pub(crate) async fn apply_mute(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
        until: Option<DateTime>,
    ) -> ServiceResult<ChannelMember> {
        let member = match self
            .store
            .set_member_mute(channel_id, user_id, true, until)
            .await
        {
            Ok(member) => member,
            Err(StoreError::NotFound(_)) => return Err(ServiceError::NotAMember),
            Err(e) => return Err(e.into()),
        };
        info!(?channel_id, ?user_id, ?until, "Member muted");
        self.publish_mute(&member);
        Ok(member)
    }

    pub async fn is_member(&self, channel_id: ObjectId, user_id: ObjectId) -> ServiceResult<bool> {
        Ok(self.find_member(channel_id, user_id).await?.is_some())
    }

    pub async fn is_admin(&self, channel_id: ObjectId, user_id: ObjectId) -> ServiceResult<bool> {
        Ok(self
            .find_member(channel_id, user_id)
            .await?
            .is_some_and(|m| m.role.is_admin()))
    }

    pub async fn is_owner(&self, channel_id: ObjectId, user_id: ObjectId) -> ServiceResult<bool> {
        Ok(self
            .find_member(channel_id, user_id)
            .await?
            .is_some_and(|m| m.role == MemberRole::Owner))
    }

    pub async fn get_member(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<ChannelMember> {
        self.require_member(channel_id, user_id).await
    }

    async fn find_member(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<Option<ChannelMember>> {
        match self.store.get_member(channel_id, user_id).await {
            Ok(member) => Ok(Some(member)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// `NotFound` when the channel is missing, `NotAMember` when only the
    /// membership is.
    pub async fn require_member(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<ChannelMember> {
        match self.find_member(channel_id, user_id).await? {
            Some(member) => Ok(member),
            None => {
                self.store.get_channel(channel_id).await?;
                Err(ServiceError::NotAMember)
            }
        }
    }

    pub async fn require_admin(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<ChannelMember> {
        let member = self.require_member(channel_id, user_id).await?;
        if !member.role.is_admin() {
            return Err(ServiceError::InsufficientRole("admin or owner required"));
        }
        Ok(member)
    }

    /// Checks that `user_id` may write into the channel right now: the
    /// channel is live, they are a member, and they are neither muted nor
    /// banned.
    pub async fn require_writer(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<(Channel, ChannelMember)> {
        let channel = self.store.get_channel(channel_id).await?;
        let member = self.require_member(channel_id, user_id).await?;
        if channel.is_archived {
            return Err(ServiceError::InvalidState(InvalidState::ChannelArchived));
        }
        let now = DateTime::now();
        if member.is_muted_at(now) {
            return Err(ServiceError::Restricted("member is muted"));
        }
        if self.active_ban(channel.server_id, user_id).await?.is_some() {
            return Err(ServiceError::Restricted("user is banned from this server"));
        }
        Ok((channel, member))
    }

    pub async fn is_restricted(
        &self,
        channel_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<bool> {
        match self.require_writer(channel_id, user_id).await {
            Ok(_) => Ok(false),
            Err(ServiceError::Restricted(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub async fn active_ban(
        &self,
        server_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<Option<ServerBan>> {
        Ok(self
            .store
            .find_active_ban(server_id, user_id, DateTime::now())
            .await?)
    }

    pub async fn list_members(
        &self,
        channel_id: ObjectId,
        viewer_id: ObjectId,
        params: &PaginationParams,
    ) -> ServiceResult<PaginatedResult<ChannelMember>> {
        self.require_member(channel_id, viewer_id).await?;
        Ok(self
            .store
            .find_members_paginated(channel_id, params)
            .await?)
    }

    pub async fn member_ids(&self, channel_id: ObjectId) -> ServiceResult<Vec<ObjectId>> {
        let members = self.store.find_members(channel_id).await?;
        Ok(members.into_iter().map(|m| m.user_id).collect())
    }

    pub async fn list_user_channels(
        &self,
        server_id: ObjectId,
        user_id: ObjectId,
    ) -> ServiceResult<Vec<Channel>> {
        let memberships = self.store.find_memberships(user_id).await?;
        let channel_ids: Vec<ObjectId> = memberships.iter().map(|m| m.channel_id).collect();
        let channels = self.store.find_channels(&channel_ids).await?;
        Ok(channels
            .into_iter()
            .filter(|c| c.server_id == server_id)
            .collect())
    }

    fn publish_channel(&self, kind: EventKind, channel: &Channel) {
        self.publisher.publish(
            channel.id,
            kind,
            serde_json::json!({
                "channel_id": channel.id.to_hex(),
                "name": channel.name,
                "channel_type": channel.channel_type,
                "is_archived": channel.is_archived,
            }),
        );
    }

    fn publish_member(
        &self,
        kind: EventKind,
        channel_id: ObjectId,
        user_id: ObjectId,
        role: Option<MemberRole>,
    ) {
        self.publisher.publish(
            channel_id,
            kind,
            serde_json::json!({
                "channel_id": channel_id.to_hex(),
                "user_id": user_id.to_hex(),
                "role": role,
            }),
        );
    }

    fn publish_mute(&self, member: &ChannelMember) {
        self.publisher.publish(
            member.channel_id,
            EventKind::MemberMuted,
            serde_json::json!({
                "channel_id": member.channel_id.to_hex(),
                "user_id": member.user_id.to_hex(),
                "is_muted": member.is_muted,
                "muted_until": member.muted_until.map(|t| t.timestamp_millis()),
            }),
        );
    }
}

fn new_member(
    channel_id: ObjectId,
    user_id: ObjectId,
    role: MemberRole,
    now: DateTime,
) -> ChannelMember {
    ChannelMember {
        id: ObjectId::new(),
        channel_id,
        user_id,
        role,
        joined_at: now,
        is_muted: false,
        muted_until: None,
        created_at: now,
        updated_at: now,
    }
}
