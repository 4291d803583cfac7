//! The message pipeline.
//!
//! One send path shared by the request surface and the live channel:
//! validate, persist (message and summary together), clear typing, broadcast.
//! The two entry points differ only in how the result reaches the caller.

use crate::error::ChatError;
use crate::model::{ConversationId, Message, UserId};
use crate::registry::{ConnectionId, ConnectionRegistry, Delivery};
use crate::store::ConversationStore;
use crate::typing::TypingCoordinator;
use std::sync::Arc;
use tandem_protocol::Frame;
use tracing::{debug, warn};

/// Default cap on message length, in characters.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4096;

/// Outcome of a successful send.
#[derive(Debug, Clone)]
pub struct Sent {
    pub message: Message,
    /// Fan-out result of the `new-message` broadcast.
    pub delivery: Delivery,
}

pub struct MessagePipeline {
    store: Arc<dyn ConversationStore>,
    registry: Arc<ConnectionRegistry>,
    typing: Arc<TypingCoordinator>,
    max_message_len: usize,
}

impl MessagePipeline {
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        registry: Arc<ConnectionRegistry>,
        typing: Arc<TypingCoordinator>,
        max_message_len: usize,
    ) -> Self {
        Self {
            store,
            registry,
            typing,
            max_message_len,
        }
    }

    /// Persist and fan out a message.
    ///
    /// `origin` is the live connection that issued the send, if any. The
    /// `new-message` broadcast is not filtered by it: the sender's other
    /// connections, and the origin itself, learn the persisted id this way.
    ///
    /// Not idempotent: two calls persist two messages.
    ///
    /// # Errors
    ///
    /// Validation failures leave the store untouched. Store failures are
    /// surfaced as-is and never retried.
    pub async fn send(
        &self,
        conversation: ConversationId,
        sender: &UserId,
        text: &str,
        origin: Option<ConnectionId>,
    ) -> Result<Sent, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let len = text.chars().count();
        if len > self.max_message_len {
            return Err(ChatError::MessageTooLong {
                len,
                max: self.max_message_len,
            });
        }

        let existing = self
            .store
            .conversation(conversation)
            .await?
            .ok_or(ChatError::ConversationNotFound(conversation))?;
        if !existing.is_participant(sender) {
            warn!(
                conversation = %conversation,
                user = %sender,
                "Send rejected: not a participant"
            );
            return Err(ChatError::NotAParticipant);
        }

        let (message, _) = self
            .store
            .append_message(conversation, sender, text)
            .await?;

        self.typing.clear_after_send(conversation, sender, origin);

        let delivery = self.registry.broadcast(
            conversation,
            Frame::new_message(message.to_payload()),
            None,
        );

        debug!(
            conversation = %conversation,
            message = %message.id,
            user = %sender,
            delivered = delivery.delivered,
            dropped = delivery.dropped,
            "Message sent"
        );
        Ok(Sent { message, delivery })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParticipantPair;
    use crate::registry::Outbox;
    use crate::store::{MemoryStore, StoreError};
    use crate::typing::TypingConfig;
    use tandem_protocol::FrameType;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        pipeline: MessagePipeline,
        conversation: ConversationId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let typing = Arc::new(TypingCoordinator::new(
            registry.clone(),
            TypingConfig::default(),
        ));
        let pipeline = MessagePipeline::new(store.clone(), registry.clone(), typing, 16);
        let pair = ParticipantPair::new("alice".into(), "bob".into()).unwrap();
        let (conversation, _) = store.get_or_create_conversation(&pair).await.unwrap();
        Fixture {
            store,
            registry,
            pipeline,
            conversation: conversation.id,
        }
    }

    #[tokio::test]
    async fn test_send_persists_and_summarizes() {
        let f = fixture().await;
        let sent = f
            .pipeline
            .send(f.conversation, &"alice".into(), "  hi  ", None)
            .await
            .unwrap();
        assert_eq!(sent.message.text, "hi");

        let messages = f.store.messages(f.conversation).await.unwrap();
        assert_eq!(messages, vec![sent.message.clone()]);

        let conversation = f.store.conversation(f.conversation).await.unwrap().unwrap();
        assert_eq!(conversation.last_message.as_deref(), Some("hi"));
        assert_eq!(conversation.last_message_sender, Some("alice".into()));
        assert_eq!(conversation.last_message_at, Some(sent.message.created_at));
    }

    #[tokio::test]
    async fn test_blank_text_persists_nothing() {
        let f = fixture().await;
        let before = f.store.conversation(f.conversation).await.unwrap().unwrap();

        let result = f.pipeline.send(f.conversation, &"alice".into(), "   ", None).await;
        assert!(matches!(result, Err(ChatError::EmptyMessage)));

        assert!(f.store.messages(f.conversation).await.unwrap().is_empty());
        let after = f.store.conversation(f.conversation).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_too_long() {
        let f = fixture().await;
        let result = f
            .pipeline
            .send(f.conversation, &"alice".into(), &"x".repeat(17), None)
            .await;
        assert!(matches!(result, Err(ChatError::MessageTooLong { len: 17, max: 16 })));
    }

    #[tokio::test]
    async fn test_outsider_rejected() {
        let f = fixture().await;
        let result = f.pipeline.send(f.conversation, &"carol".into(), "x", None).await;
        assert!(matches!(result, Err(ChatError::NotAParticipant)));
        assert!(f.store.messages(f.conversation).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_conversation() {
        let f = fixture().await;
        let missing = ConversationId::generate();
        let result = f.pipeline.send(missing, &"alice".into(), "x", None).await;
        assert!(matches!(result, Err(ChatError::ConversationNotFound(id)) if id == missing));
    }

    #[tokio::test]
    async fn test_store_outage_is_transient() {
        let f = fixture().await;
        f.store.set_available(false);
        let result = f.pipeline.send(f.conversation, &"alice".into(), "x", None).await;
        assert!(matches!(
            result,
            Err(ChatError::Store(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_room_and_clears_typing() {
        let f = fixture().await;
        let origin = ConnectionId::generate();
        let peer = ConnectionId::generate();
        let (origin_tx, mut origin_rx): (Outbox, _) = mpsc::channel(8);
        let (peer_tx, mut peer_rx): (Outbox, _) = mpsc::channel(8);
        f.registry.admit(origin, &"alice".into(), origin_tx).unwrap();
        f.registry.admit(peer, &"bob".into(), peer_tx).unwrap();
        f.registry.subscribe(origin, f.conversation).unwrap();
        f.registry.subscribe(peer, f.conversation).unwrap();

        let sent = f
            .pipeline
            .send(f.conversation, &"alice".into(), "hello", Some(origin))
            .await
            .unwrap();
        assert_eq!(sent.delivery.delivered, 2);

        assert_eq!(peer_rx.recv().await.unwrap().frame_type(), FrameType::StopTyping);
        let frame = peer_rx.recv().await.unwrap();
        match &*frame {
            Frame::NewMessage { message, .. } => {
                assert_eq!(message.id, sent.message.id.to_string());
                assert_eq!(message.sender_id, "alice");
                assert_eq!(message.text, "hello");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // The origin gets the new message but not its own stop-typing.
        assert_eq!(origin_rx.recv().await.unwrap().frame_type(), FrameType::NewMessage);
    }
}
