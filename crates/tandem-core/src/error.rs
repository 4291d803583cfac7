//! Error taxonomy for conversation operations.

use crate::model::ConversationId;
use crate::store::StoreError;
use tandem_protocol::codes;
use thiserror::Error;

/// Identity verification failure.
///
/// Deliberately a single variant: callers must not learn whether a token was
/// malformed, expired or mis-signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Unauthenticated")]
    Unauthenticated,
}

/// Errors surfaced by the gateway and the message pipeline.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Unauthenticated")]
    Unauthenticated,

    /// Authenticated, but not a participant of the conversation being read.
    #[error("Not authorized to access this conversation")]
    NotAuthorized,

    /// Authenticated, but not a participant of the conversation being written.
    #[error("Not a participant of this conversation")]
    NotAParticipant,

    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Message is {len} characters, maximum is {max}")]
    MessageTooLong { len: usize, max: usize },

    #[error("Cannot create conversation with yourself")]
    SelfConversation,

    #[error("Malformed identifier: {0}")]
    MalformedId(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coarse error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthenticated,
    NotAuthorized,
    Validation,
    NotFound,
    /// The durable store failed; the caller may retry.
    Transient,
}

impl ChatError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Unauthenticated => ErrorKind::Unauthenticated,
            ChatError::NotAuthorized | ChatError::NotAParticipant => ErrorKind::NotAuthorized,
            ChatError::EmptyMessage
            | ChatError::MessageTooLong { .. }
            | ChatError::SelfConversation
            | ChatError::MalformedId(_) => ErrorKind::Validation,
            ChatError::ConversationNotFound(_) => ErrorKind::NotFound,
            ChatError::Store(StoreError::ConversationNotFound(_)) => ErrorKind::NotFound,
            ChatError::Store(_) => ErrorKind::Transient,
        }
    }

    /// Live-channel error code for this error.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Unauthenticated | ErrorKind::NotAuthorized => codes::NOT_AUTHORIZED,
            ErrorKind::Validation => codes::VALIDATION,
            ErrorKind::NotFound => codes::NOT_FOUND,
            ErrorKind::Transient => codes::UNAVAILABLE,
        }
    }
}

impl From<AuthError> for ChatError {
    fn from(_: AuthError) -> Self {
        ChatError::Unauthenticated
    }
}

impl ErrorKind {
    /// Label used for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::NotAuthorized => "not_authorized",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        assert_eq!(ChatError::EmptyMessage.kind(), ErrorKind::Validation);
        assert_eq!(ChatError::SelfConversation.kind(), ErrorKind::Validation);
        assert_eq!(ChatError::NotAParticipant.kind(), ErrorKind::NotAuthorized);
        assert_eq!(
            ChatError::ConversationNotFound(ConversationId::generate()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            ChatError::from(StoreError::Unavailable("pool closed".into())).kind(),
            ErrorKind::Transient
        );
        assert_eq!(ChatError::from(AuthError::Unauthenticated).kind(), ErrorKind::Unauthenticated);
    }

    #[test]
    fn test_codes() {
        assert_eq!(ChatError::EmptyMessage.code(), codes::VALIDATION);
        assert_eq!(ChatError::NotAParticipant.code(), codes::NOT_AUTHORIZED);
        assert_eq!(
            ChatError::from(StoreError::Unavailable("x".into())).code(),
            codes::UNAVAILABLE
        );
    }
}
