use bson::oid::ObjectId;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "message:create")]
    MessageCreated,
    #[serde(rename = "message:update")]
    MessageUpdated,
    #[serde(rename = "message:delete")]
    MessageDeleted,
    #[serde(rename = "message:reaction")]
    MessageReaction,
    #[serde(rename = "member:join")]
    MemberJoined,
    #[serde(rename = "member:leave")]
    MemberLeft,
    #[serde(rename = "member:role")]
    MemberRoleChanged,
    #[serde(rename = "member:mute")]
    MemberMuted,
    #[serde(rename = "channel:create")]
    ChannelCreated,
    #[serde(rename = "channel:update")]
    ChannelUpdated,
    #[serde(rename = "moderation:action")]
    ModerationAction,
    #[serde(rename = "read:update")]
    ReadUpdated,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::MessageCreated => "message:create",
            EventKind::MessageUpdated => "message:update",
            EventKind::MessageDeleted => "message:delete",
            EventKind::MessageReaction => "message:reaction",
            EventKind::MemberJoined => "member:join",
            EventKind::MemberLeft => "member:leave",
            EventKind::MemberRoleChanged => "member:role",
            EventKind::MemberMuted => "member:mute",
            EventKind::ChannelCreated => "channel:create",
            EventKind::ChannelUpdated => "channel:update",
            EventKind::ModerationAction => "moderation:action",
            EventKind::ReadUpdated => "read:update",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelEvent {
    pub channel_id: ObjectId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
}

/// Real-time fan-out. Publishing is fire-and-forget: it never blocks and
/// never reports failure back to the write path.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, channel_id: ObjectId, kind: EventKind, payload: serde_json::Value);
}

/// In-process hub with one broadcast channel per conversation channel.
pub struct ChannelHub {
    senders: DashMap<ObjectId, broadcast::Sender<ChannelEvent>>,
    capacity: usize,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, channel_id: ObjectId) -> broadcast::Receiver<ChannelEvent> {
        self.senders
            .entry(channel_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, channel_id: &ObjectId) -> usize {
        self.senders
            .get(channel_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Drops senders whose receivers have all gone away.
    pub fn prune(&self) {
        self.senders.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl EventPublisher for ChannelHub {
    fn publish(&self, channel_id: ObjectId, kind: EventKind, payload: serde_json::Value) {
        let Some(sender) = self.senders.get(&channel_id) else {
            trace!(?channel_id, kind = kind.as_str(), "No subscribers for channel");
            return;
        };
        let event = ChannelEvent {
            channel_id,
            kind,
            data: payload,
        };
        if sender.send(event).is_err() {
            debug!(?channel_id, kind = kind.as_str(), "Event dropped, no live receivers");
        }
    }
}

/// Publisher for deployments without connected clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, channel_id: ObjectId, kind: EventKind, _payload: serde_json::Value) {
        trace!(?channel_id, kind = kind.as_str(), "Event discarded");
    }
}
