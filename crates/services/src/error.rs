use std::fmt;

use bson::oid::ObjectId;
use thiserror::Error;

use crate::store::StoreError;

/// Machine-distinguishable error category, stable across releases so the
/// transport layer can map it without looking at message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    NotAMember,
    InsufficientRole,
    AlreadyExists,
    InvalidState,
    Conflict,
    Restricted,
    Transient,
    EnforcementFailed,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidState {
    EmptyMessage,
    ContentTooLong,
    InvalidReplyTarget,
    MessageDeleted,
    SystemMessageImmutable,
    MessageNotInChannel,
    InvalidEmoji,
    InvalidChannelName,
    InvalidParticipants,
    ChannelArchived,
    InvalidRulePattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    DirectChannelWithSelf,
    DirectChannelMembership,
    CannotRemoveOwner,
    OwnerRoleImmutable,
    ChannelNotDissolving,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("user is not a member of the channel")]
    NotAMember,
    #[error("insufficient role: {0}")]
    InsufficientRole(&'static str),
    #[error("{0} already exists")]
    AlreadyExists(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(InvalidState),
    #[error("conflict: {0}")]
    Conflict(Conflict),
    #[error("restricted: {0}")]
    Restricted(&'static str),
    #[error("store temporarily unavailable: {0}")]
    Transient(String),
    #[error("enforcement of violation {violation_id} failed: {reason}")]
    EnforcementFailed {
        violation_id: ObjectId,
        reason: String,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::NotAMember => ErrorKind::NotAMember,
            ServiceError::InsufficientRole(_) => ErrorKind::InsufficientRole,
            ServiceError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ServiceError::InvalidState(_) => ErrorKind::InvalidState,
            ServiceError::Conflict(_) => ErrorKind::Conflict,
            ServiceError::Restricted(_) => ErrorKind::Restricted,
            ServiceError::Transient(_) => ErrorKind::Transient,
            ServiceError::EnforcementFailed { .. } => ErrorKind::EnforcementFailed,
            ServiceError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(entity) => ServiceError::NotFound(entity),
            StoreError::DuplicateKey(entity) => ServiceError::AlreadyExists(entity),
            StoreError::Transient(msg) => ServiceError::Transient(msg),
            StoreError::Backend(msg) => ServiceError::Internal(msg),
        }
    }
}

impl fmt::Display for InvalidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InvalidState::EmptyMessage => "message has neither content nor attachments",
            InvalidState::ContentTooLong => "message content exceeds the configured limit",
            InvalidState::InvalidReplyTarget => {
                "reply target is missing, deleted, or in another channel"
            }
            InvalidState::MessageDeleted => "message has been deleted",
            InvalidState::SystemMessageImmutable => "system messages cannot be edited",
            InvalidState::MessageNotInChannel => "message does not belong to the channel",
            InvalidState::InvalidEmoji => "emoji must be 1 to 8 UTF-16 code units",
            InvalidState::InvalidChannelName => "channel name must not be blank",
            InvalidState::InvalidParticipants => "direct channels need exactly two participants",
            InvalidState::ChannelArchived => "channel is archived",
            InvalidState::InvalidRulePattern => "rule pattern has no literal text",
        };
        f.write_str(text)
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Conflict::DirectChannelWithSelf => "direct channel participants must differ",
            Conflict::DirectChannelMembership => "direct channel membership is fixed",
            Conflict::CannotRemoveOwner => "the channel owner cannot be removed",
            Conflict::OwnerRoleImmutable => "the owner role cannot be granted or changed",
            Conflict::ChannelNotDissolving => "teardown removal requires an archived channel",
        };
        f.write_str(text)
    }
}
