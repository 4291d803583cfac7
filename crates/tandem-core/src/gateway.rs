//! Request/response conversation operations.
//!
//! Every operation takes the caller's verified identity; authorization is
//! checked here, not in the store.

use crate::error::ChatError;
use crate::identity::AuthenticatedUser;
use crate::model::{
    Conversation, ConversationId, ConversationView, Message, MessageView, ParticipantPair,
    ReachableUser, UserId, UserSummary,
};
use crate::pipeline::MessagePipeline;
use crate::registry::ConnectionRegistry;
use crate::store::{ConversationStore, UserDirectory};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Parse a client-supplied conversation id.
///
/// # Errors
///
/// Returns [`ChatError::MalformedId`] if `raw` is not a valid id.
pub fn parse_conversation_id(raw: &str) -> Result<ConversationId, ChatError> {
    raw.trim()
        .parse()
        .map_err(|_| ChatError::MalformedId(raw.to_string()))
}

pub struct ConversationGateway {
    store: Arc<dyn ConversationStore>,
    directory: Arc<dyn UserDirectory>,
    registry: Arc<ConnectionRegistry>,
    pipeline: Arc<MessagePipeline>,
}

impl ConversationGateway {
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        directory: Arc<dyn UserDirectory>,
        registry: Arc<ConnectionRegistry>,
        pipeline: Arc<MessagePipeline>,
    ) -> Self {
        Self {
            store,
            directory,
            registry,
            pipeline,
        }
    }

    /// Fetch the caller's conversation with `peer`, creating it on first contact.
    ///
    /// # Errors
    ///
    /// [`ChatError::SelfConversation`] if `peer` is the caller.
    pub async fn get_or_create(
        &self,
        caller: &AuthenticatedUser,
        peer: &UserId,
    ) -> Result<Conversation, ChatError> {
        let pair = ParticipantPair::new(caller.user_id().clone(), peer.clone())
            .ok_or(ChatError::SelfConversation)?;
        let (conversation, created) = self.store.get_or_create_conversation(&pair).await?;
        if created {
            debug!(
                conversation = %conversation.id,
                user = %caller.user_id(),
                peer = %peer,
                "Conversation started"
            );
        }
        Ok(conversation)
    }

    /// The caller's conversations, most recently updated first, each with the
    /// peer's display data.
    pub async fn list(&self, caller: &AuthenticatedUser) -> Result<Vec<ConversationView>, ChatError> {
        let user = caller.user_id();
        let conversations = self.store.conversations_for(user).await?;

        let mut views = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let peer = match conversation.participants.other(user) {
                Some(peer) => self.directory.user(peer).await?,
                None => None,
            };
            views.push(ConversationView { conversation, peer });
        }
        Ok(views)
    }

    /// Messages of a conversation, oldest first, each with the sender's
    /// display data.
    ///
    /// # Errors
    ///
    /// [`ChatError::ConversationNotFound`] if the conversation does not exist,
    /// [`ChatError::NotAuthorized`] if the caller is not a participant.
    pub async fn list_messages(
        &self,
        caller: &AuthenticatedUser,
        conversation: ConversationId,
    ) -> Result<Vec<MessageView>, ChatError> {
        self.authorize(caller, conversation).await?;
        let messages = self.store.messages(conversation).await?;

        // At most two distinct senders.
        let mut senders: HashMap<UserId, Option<UserSummary>> = HashMap::new();
        let mut views = Vec::with_capacity(messages.len());
        for message in messages {
            let sender = match senders.get(&message.sender_id) {
                Some(known) => known.clone(),
                None => {
                    let found = self.directory.user(&message.sender_id).await?;
                    senders.insert(message.sender_id.clone(), found.clone());
                    found
                }
            };
            views.push(MessageView { message, sender });
        }
        Ok(views)
    }

    /// Send through the shared pipeline.
    pub async fn send_message(
        &self,
        caller: &AuthenticatedUser,
        conversation: ConversationId,
        text: &str,
    ) -> Result<Message, ChatError> {
        let sent = self
            .pipeline
            .send(conversation, caller.user_id(), text, None)
            .await?;
        Ok(sent.message)
    }

    /// Mark every message the caller has not read yet.
    ///
    /// Returns the number of messages that gained a read entry; repeating the
    /// call returns 0.
    pub async fn mark_read(
        &self,
        caller: &AuthenticatedUser,
        conversation: ConversationId,
    ) -> Result<u64, ChatError> {
        self.authorize(caller, conversation).await?;
        let updated = self
            .store
            .mark_read(conversation, caller.user_id(), Utc::now())
            .await?;
        debug!(
            conversation = %conversation,
            user = %caller.user_id(),
            updated,
            "Marked read"
        );
        Ok(updated)
    }

    /// Every directory user other than the caller, online users first.
    pub async fn reachable_users(
        &self,
        caller: &AuthenticatedUser,
    ) -> Result<Vec<ReachableUser>, ChatError> {
        let mut users: Vec<ReachableUser> = self
            .directory
            .users()
            .await?
            .into_iter()
            .filter(|user| &user.id != caller.user_id())
            .map(|user| ReachableUser {
                online: self.registry.is_online(&user.id),
                user,
            })
            .collect();
        // Stable: directory order is kept within each group.
        users.sort_by_key(|u| !u.online);
        Ok(users)
    }

    async fn authorize(
        &self,
        caller: &AuthenticatedUser,
        conversation: ConversationId,
    ) -> Result<Conversation, ChatError> {
        let existing = self
            .store
            .conversation(conversation)
            .await?
            .ok_or(ChatError::ConversationNotFound(conversation))?;
        if !existing.is_participant(caller.user_id()) {
            return Err(ChatError::NotAuthorized);
        }
        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserSummary;
    use crate::registry::{ConnectionId, Outbox};
    use crate::store::MemoryStore;
    use crate::typing::{TypingConfig, TypingCoordinator};
    use tokio::sync::mpsc;

    fn user(id: &str) -> AuthenticatedUser {
        AuthenticatedUser::new(id.into())
    }

    fn gateway() -> (ConversationGateway, Arc<MemoryStore>, Arc<ConnectionRegistry>) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let typing = Arc::new(TypingCoordinator::new(
            registry.clone(),
            TypingConfig::default(),
        ));
        let pipeline = Arc::new(MessagePipeline::new(
            store.clone(),
            registry.clone(),
            typing,
            4096,
        ));
        let gateway =
            ConversationGateway::new(store.clone(), store.clone(), registry.clone(), pipeline);
        (gateway, store, registry)
    }

    #[tokio::test]
    async fn test_get_or_create_both_orders() {
        let (gateway, _, _) = gateway();
        let ab = gateway.get_or_create(&user("a"), &"b".into()).await.unwrap();
        let ba = gateway.get_or_create(&user("b"), &"a".into()).await.unwrap();
        assert_eq!(ab.id, ba.id);
    }

    #[tokio::test]
    async fn test_self_conversation() {
        let (gateway, _, _) = gateway();
        let result = gateway.get_or_create(&user("a"), &"a".into()).await;
        assert!(matches!(result, Err(ChatError::SelfConversation)));
    }

    #[tokio::test]
    async fn test_list_messages_requires_participant() {
        let (gateway, _, _) = gateway();
        let conversation = gateway.get_or_create(&user("a"), &"b".into()).await.unwrap();
        let sent = gateway
            .send_message(&user("a"), conversation.id, "hi")
            .await
            .unwrap();

        let messages = gateway.list_messages(&user("b"), conversation.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message.id, sent.id);
        assert_eq!(messages[0].message.sender_id, UserId::from("a"));

        let outsider = gateway.list_messages(&user("c"), conversation.id).await;
        assert!(matches!(outsider, Err(ChatError::NotAuthorized)));

        let missing = gateway
            .list_messages(&user("a"), ConversationId::generate())
            .await;
        assert!(matches!(missing, Err(ChatError::ConversationNotFound(_))));
    }

    #[tokio::test]
    async fn test_mark_read_twice() {
        let (gateway, _, _) = gateway();
        let conversation = gateway.get_or_create(&user("a"), &"b".into()).await.unwrap();
        gateway.send_message(&user("a"), conversation.id, "1").await.unwrap();
        gateway.send_message(&user("a"), conversation.id, "2").await.unwrap();

        assert_eq!(gateway.mark_read(&user("b"), conversation.id).await.unwrap(), 2);
        assert_eq!(gateway.mark_read(&user("b"), conversation.id).await.unwrap(), 0);

        for view in gateway.list_messages(&user("b"), conversation.id).await.unwrap() {
            let entries = view
                .message
                .read_by.iter().filter(|r| r.user_id == UserId::from("b")).count();
            assert_eq!(entries, 1);
        }

        let outsider = gateway.mark_read(&user("c"), conversation.id).await;
        assert!(matches!(outsider, Err(ChatError::NotAuthorized)));
    }

    #[tokio::test]
    async fn test_concurrent_mark_read() {
        let (gateway, _, _) = gateway();
        let gateway = Arc::new(gateway);
        let conversation = gateway.get_or_create(&user("a"), &"b".into()).await.unwrap();
        for i in 0..5 {
            gateway
                .send_message(&user("a"), conversation.id, &i.to_string())
                .await
                .unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gateway = gateway.clone();
                tokio::spawn(async move { gateway.mark_read(&user("b"), conversation.id).await })
            })
            .collect();
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap().unwrap();
        }
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_list_messages_enriches_sender() {
        let (gateway, store, _) = gateway();
        store.put_user(UserSummary {
            id: "a".into(),
            name: "Alice".into(),
            avatar: Some("https://img.example/a.png".into()),
        });
        let conversation = gateway.get_or_create(&user("a"), &"b".into()).await.unwrap();
        gateway.send_message(&user("a"), conversation.id, "hi").await.unwrap();
        gateway.send_message(&user("b"), conversation.id, "hey").await.unwrap();
        gateway.send_message(&user("a"), conversation.id, "again").await.unwrap();

        let views = gateway.list_messages(&user("b"), conversation.id).await.unwrap();
        let names: Vec<_> = views
            .iter()
            .map(|v| v.sender.as_ref().map(|s| s.name.as_str()))
            .collect();
        assert_eq!(names, [Some("Alice"), None, Some("Alice")]);
        assert_eq!(
            views[0].sender.as_ref().and_then(|s| s.avatar.as_deref()),
            Some("https://img.example/a.png")
        );

        let json = serde_json::to_value(&views[0]).unwrap();
        assert_eq!(json["text"], "hi");
        assert_eq!(json["sender"]["name"], "Alice");
    }

    #[tokio::test]
    async fn test_list_enriches_peer() {
        let (gateway, store, _) = gateway();
        store.put_user(UserSummary {
            id: "b".into(),
            name: "Bob".into(),
            avatar: None,
        });
        gateway.get_or_create(&user("a"), &"b".into()).await.unwrap();
        gateway.get_or_create(&user("a"), &"c".into()).await.unwrap();

        let views = gateway.list(&user("a")).await.unwrap();
        assert_eq!(views.len(), 2);
        let bob = views
            .iter()
            .find(|v| v.conversation.participants.contains(&"b".into()))
            .unwrap();
        assert_eq!(bob.peer.as_ref().map(|p| p.name.as_str()), Some("Bob"));
        let carol = views
            .iter()
            .find(|v| v.conversation.participants.contains(&"c".into()))
            .unwrap();
        assert!(carol.peer.is_none());
    }

    #[tokio::test]
    async fn test_reachable_users() {
        let (gateway, store, registry) = gateway();
        for (id, name) in [("a", "Alice"), ("b", "Bob"), ("c", "Carol")] {
            store.put_user(UserSummary {
                id: id.into(),
                name: name.into(),
                avatar: None,
            });
        }
        let (tx, _rx): (Outbox, _) = mpsc::channel(1);
        registry.admit(ConnectionId::generate(), &"c".into(), tx).unwrap();

        let users = gateway.reachable_users(&user("a")).await.unwrap();
        let listed: Vec<_> = users.iter().map(|u| (u.user.name.as_str(), u.online)).collect();
        assert_eq!(listed, [("Carol", true), ("Bob", false)]);
    }

    #[test]
    fn test_parse_conversation_id() {
        let id = ConversationId::generate();
        assert_eq!(parse_conversation_id(&id.to_string()).unwrap(), id);
        assert!(matches!(
            parse_conversation_id("nope"),
            Err(ChatError::MalformedId(_))
        ));
    }
}
