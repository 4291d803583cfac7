//! Durable conversation and message records.
//!
//! The store is the ground truth for history: live broadcasts are hints, and a
//! client that missed one recovers by listing messages.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use crate::model::{Conversation, ConversationId, Message, ParticipantPair, UserId, UserSummary};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or failed mid-operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A persisted row could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// The conversation does not exist.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),
}

/// Conversation and message persistence.
///
/// # Contract
///
/// - At most one conversation exists per [`ParticipantPair`]; concurrent
///   creators converge on the same row.
/// - [`append_message`](Self::append_message) inserts the message and updates
///   the conversation summary as one unit: no reader observes one without the
///   other.
/// - Messages are ordered by creation time, which the store assigns and never
///   lets run backwards within a conversation.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Fetch the conversation for `pair`, creating it if absent.
    ///
    /// Returns the conversation and whether this call created it.
    async fn get_or_create_conversation(
        &self,
        pair: &ParticipantPair,
    ) -> Result<(Conversation, bool), StoreError>;

    /// Fetch a conversation by id.
    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError>;

    /// All conversations `user` participates in, most recently updated first.
    async fn conversations_for(&self, user: &UserId) -> Result<Vec<Conversation>, StoreError>;

    /// Persist a message and fold it into the conversation summary.
    ///
    /// Returns the message and the updated conversation.
    async fn append_message(
        &self,
        conversation: ConversationId,
        sender: &UserId,
        text: &str,
    ) -> Result<(Message, Conversation), StoreError>;

    /// Messages of a conversation, oldest first.
    async fn messages(&self, conversation: ConversationId) -> Result<Vec<Message>, StoreError>;

    /// Add a read entry for `reader` to every message lacking one.
    ///
    /// Returns the number of messages that gained an entry.
    async fn mark_read(
        &self,
        conversation: ConversationId,
        reader: &UserId,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Read-only view of the identity subsystem's user records.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up one user.
    async fn user(&self, id: &UserId) -> Result<Option<UserSummary>, StoreError>;

    /// Every known user.
    async fn users(&self) -> Result<Vec<UserSummary>, StoreError>;
}
