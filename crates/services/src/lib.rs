pub mod conversation;
pub mod error;
pub mod events;
pub mod ledger;
pub mod message;
pub mod moderation;
pub mod reaction;
pub mod read_cursor;
pub mod store;
pub mod telemetry;

pub use conversation::{Conversation, SubmitOutcome};
pub use error::{Conflict, ErrorKind, InvalidState, ServiceError, ServiceResult};
pub use events::{ChannelEvent, ChannelHub, EventKind, EventPublisher, NoopPublisher};
pub use ledger::{CreateChannel, MembershipLedger, Removal};
pub use message::{MessageService, NewAttachment, NewMessage, Thread, ThreadSummary};
pub use moderation::{ModerationPipeline, NewRule, WarningStatus};
pub use reaction::{ReactionAggregator, ReactionCount};
pub use read_cursor::{compute_unread, MentionDetector, MentionList, ReadCursorTracker, UnreadCounts};
pub use store::{MemoryStore, MongoStore, PaginatedResult, PaginationParams, Store, StoreError};
