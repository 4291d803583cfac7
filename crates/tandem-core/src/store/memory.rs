//! In-process store backed by concurrent maps.

use super::{ConversationStore, StoreError, UserDirectory};
use crate::model::{
    Conversation, ConversationId, Message, MessageId, ParticipantPair, UserId, UserSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// A conversation together with its messages.
///
/// Both live under one map entry, so a message insert and the summary update
/// happen under the same shard lock.
#[derive(Debug)]
struct ConversationRecord {
    conversation: Conversation,
    messages: Vec<Message>,
}

/// Volatile store for tests, demos and single-node development.
#[derive(Debug)]
pub struct MemoryStore {
    conversations: DashMap<ConversationId, ConversationRecord>,
    /// Uniqueness index: one conversation per unordered pair.
    pairs: DashMap<ParticipantPair, ConversationId>,
    users: DashMap<UserId, UserSummary>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            conversations: DashMap::new(),
            pairs: DashMap::new(),
            users: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user in the directory view.
    pub fn put_user(&self, user: UserSummary) {
        self.users.insert(user.id.clone(), user);
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_or_create_conversation(
        &self,
        pair: &ParticipantPair,
    ) -> Result<(Conversation, bool), StoreError> {
        self.check_available()?;

        let mut created = false;
        // Lock order: `pairs` then `conversations`, never the reverse.
        let id = *self.pairs.entry(pair.clone()).or_insert_with(|| {
            let conversation = Conversation::new(pair.clone(), Utc::now());
            let id = conversation.id;
            self.conversations.insert(
                id,
                ConversationRecord {
                    conversation,
                    messages: Vec::new(),
                },
            );
            created = true;
            id
        });

        let conversation = self
            .conversations
            .get(&id)
            .map(|record| record.conversation.clone())
            .ok_or(StoreError::ConversationNotFound(id))?;

        if created {
            debug!(conversation = %id, "Created conversation");
        }
        Ok((conversation, created))
    }

    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.check_available()?;
        Ok(self
            .conversations
            .get(&id)
            .map(|record| record.conversation.clone()))
    }

    async fn conversations_for(&self, user: &UserId) -> Result<Vec<Conversation>, StoreError> {
        self.check_available()?;
        let mut conversations: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|record| record.conversation.is_participant(user))
            .map(|record| record.conversation.clone())
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn append_message(
        &self,
        conversation: ConversationId,
        sender: &UserId,
        text: &str,
    ) -> Result<(Message, Conversation), StoreError> {
        self.check_available()?;

        let mut record = self
            .conversations
            .get_mut(&conversation)
            .ok_or(StoreError::ConversationNotFound(conversation))?;

        let now = Utc::now();
        let created_at = match record.conversation.last_message_at {
            Some(last) if last > now => last,
            _ => now,
        };

        let message = Message {
            id: MessageId::generate(),
            conversation_id: conversation,
            sender_id: sender.clone(),
            text: text.to_string(),
            read_by: Vec::new(),
            created_at,
        };
        record.messages.push(message.clone());
        record.conversation.apply_summary(&message);

        Ok((message, record.conversation.clone()))
    }

    async fn messages(&self, conversation: ConversationId) -> Result<Vec<Message>, StoreError> {
        self.check_available()?;
        Ok(self
            .conversations
            .get(&conversation)
            .map(|record| record.messages.clone())
            .unwrap_or_default())
    }

    async fn mark_read(
        &self,
        conversation: ConversationId,
        reader: &UserId,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.check_available()?;
        let mut record = self
            .conversations
            .get_mut(&conversation)
            .ok_or(StoreError::ConversationNotFound(conversation))?;

        let mut updated = 0;
        for message in record.messages.iter_mut() {
            if message.mark_read(reader, at) {
                updated += 1;
            }
        }
        Ok(updated)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn user(&self, id: &UserId) -> Result<Option<UserSummary>, StoreError> {
        self.check_available()?;
        Ok(self.users.get(id).map(|u| u.clone()))
    }

    async fn users(&self) -> Result<Vec<UserSummary>, StoreError> {
        self.check_available()?;
        let mut users: Vec<UserSummary> = self.users.iter().map(|u| u.clone()).collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(users)
    }
}
