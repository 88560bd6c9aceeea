pub mod attachment;
pub mod channel;
pub mod channel_member;
pub mod message;
pub mod moderation;
pub mod reaction;
pub mod read_receipt;

pub use attachment::Attachment;
pub use channel::{Channel, ChannelType};
pub use channel_member::{ChannelMember, MemberRole};
pub use message::{Message, MessagePosition, MessageType, ReactionSummary};
pub use moderation::{
    ModerationAction, ModerationRule, ModerationViolation, ServerBan,
    ServerModerationSettings, ViolationStatus, Warning,
};
pub use reaction::Reaction;
pub use read_receipt::{ChannelReadStatus, ReadReceipt};
