//! Live-channel sessions.
//!
//! [`ChatHub`] wires the verifier, store, registry, typing coordinator and
//! pipeline together. A [`LiveSession`] is one admitted connection: it turns
//! inbound frames into registry, typing and pipeline calls, and releases
//! everything it holds when dropped.

use crate::error::{AuthError, ChatError};
use crate::gateway::{parse_conversation_id, ConversationGateway};
use crate::identity::{AuthenticatedUser, IdentityVerifier};
use crate::model::{ConversationId, UserId};
use crate::pipeline::{MessagePipeline, DEFAULT_MAX_MESSAGE_LEN};
use crate::registry::{
    ConnectionId, ConnectionRegistry, RegistryConfig, RegistryError, RegistryStats,
};
use crate::store::{ConversationStore, UserDirectory};
use crate::typing::{TypingConfig, TypingCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::{codes, Frame, PROTOCOL_VERSION};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub registry: RegistryConfig,
    pub typing: TypingConfig,
    pub max_message_len: usize,
    /// Frames buffered per connection before events are dropped.
    pub outbox_capacity: usize,
    /// Heartbeat interval advertised in the `connected` frame.
    pub heartbeat_ms: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            typing: TypingConfig::default(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            outbox_capacity: 256,
            heartbeat_ms: 30_000,
        }
    }
}

/// Shared chat state. One per process.
pub struct ChatHub {
    verifier: Arc<dyn IdentityVerifier>,
    registry: Arc<ConnectionRegistry>,
    typing: Arc<TypingCoordinator>,
    pipeline: Arc<MessagePipeline>,
    gateway: ConversationGateway,
    config: HubConfig,
}

impl ChatHub {
    #[must_use]
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        store: Arc<dyn ConversationStore>,
        directory: Arc<dyn UserDirectory>,
        config: HubConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_config(config.registry.clone()));
        let typing = Arc::new(TypingCoordinator::new(registry.clone(), config.typing));
        let pipeline = Arc::new(MessagePipeline::new(
            store.clone(),
            registry.clone(),
            typing.clone(),
            config.max_message_len,
        ));
        let gateway = ConversationGateway::new(store, directory, registry.clone(), pipeline.clone());

        info!(
            max_message_len = config.max_message_len,
            outbox_capacity = config.outbox_capacity,
            "Chat hub ready"
        );
        Self {
            verifier,
            registry,
            typing,
            pipeline,
            gateway,
            config,
        }
    }

    /// Resolve a token. Shared by the request path and connection admission.
    ///
    /// # Errors
    ///
    /// [`AuthError::Unauthenticated`] for any unusable token.
    pub fn authenticate(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        self.verifier.verify(token)
    }

    /// Admit a verified user's new connection.
    ///
    /// Returns the session and the receiving end of its outbox.
    ///
    /// # Errors
    ///
    /// Fails if the registry refuses the connection.
    pub fn open(
        self: &Arc<Self>,
        user: AuthenticatedUser,
    ) -> Result<(LiveSession, mpsc::Receiver<Arc<Frame>>), RegistryError> {
        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::channel(self.config.outbox_capacity.max(1));
        self.registry.admit(id, user.user_id(), tx)?;

        let session = LiveSession {
            id,
            user: user.into_user_id(),
            hub: self.clone(),
        };
        Ok((session, rx))
    }

    #[must_use]
    pub fn gateway(&self) -> &ConversationGateway {
        &self.gateway
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn typing(&self) -> &Arc<TypingCoordinator> {
        &self.typing
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            registry: self.registry.stats(),
            typing_sessions: self.typing.active_sessions(),
        }
    }
}

/// Point-in-time hub statistics.
#[derive(Debug, Clone, Copy)]
pub struct HubStats {
    pub registry: RegistryStats,
    pub typing_sessions: usize,
}

/// One admitted live connection.
pub struct LiveSession {
    id: ConnectionId,
    user: UserId,
    hub: Arc<ChatHub>,
}

impl LiveSession {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The handshake frame sent right after admission.
    #[must_use]
    pub fn connected_frame(&self) -> Frame {
        Frame::connected(
            self.id.to_string(),
            self.user.as_str(),
            PROTOCOL_VERSION,
            self.hub.config.heartbeat_ms,
        )
    }

    /// Handle one inbound frame.
    ///
    /// Returns the direct reply, if any. Room events travel through the
    /// outbox instead.
    pub async fn handle(&self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::JoinConversation {
                id,
                conversation_id,
            } => self.join(id, &conversation_id),

            Frame::Typing {
                conversation_id,
                user_id: None,
                inactivity_ms,
            } => {
                let conversation = match parse_conversation_id(&conversation_id) {
                    Ok(c) => c,
                    Err(e) => return Some(error_frame(None, &e)),
                };
                self.hub.typing.signal(
                    conversation,
                    &self.user,
                    Some(self.id),
                    inactivity_ms.map(Duration::from_millis),
                );
                None
            }

            Frame::StopTyping {
                conversation_id,
                user_id: None,
            } => {
                let conversation = match parse_conversation_id(&conversation_id) {
                    Ok(c) => c,
                    Err(e) => return Some(error_frame(None, &e)),
                };
                self.hub.typing.stop(conversation, &self.user, Some(self.id));
                None
            }

            Frame::SendMessage {
                id,
                conversation_id,
                text,
            } => self.send(id, &conversation_id, &text).await,

            Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),
            Frame::Pong { .. } => None,

            other => {
                warn!(
                    connection = %self.id,
                    event = %other.frame_type(),
                    "Unexpected frame from client"
                );
                Some(Frame::error(
                    other.request_id(),
                    codes::UNEXPECTED_FRAME,
                    format!("Unexpected frame: {}", other.frame_type()),
                ))
            }
        }
    }

    fn join(&self, id: Option<u64>, raw: &str) -> Option<Frame> {
        let conversation = match parse_conversation_id(raw) {
            Ok(c) => c,
            Err(e) => return Some(error_frame(id, &e)),
        };
        match self.hub.registry.subscribe(self.id, conversation) {
            Ok(_) => id.map(Frame::ack),
            Err(e @ RegistryError::MaxRoomsReached) => {
                Some(Frame::error(id, codes::LIMIT_REACHED, e.to_string()))
            }
            Err(e) => Some(Frame::error(id, codes::UNAVAILABLE, e.to_string())),
        }
    }

    async fn send(&self, id: Option<u64>, raw: &str, text: &str) -> Option<Frame> {
        let conversation: ConversationId = match parse_conversation_id(raw) {
            Ok(c) => c,
            Err(e) => return Some(error_frame(id, &e)),
        };
        match self
            .hub
            .pipeline
            .send(conversation, &self.user, text, Some(self.id))
            .await
        {
            Ok(sent) => id.map(|id| Frame::ack_message(id, sent.message.id.to_string())),
            Err(e) => {
                debug!(
                    connection = %self.id,
                    conversation = %conversation,
                    kind = e.kind().as_str(),
                    error = %e,
                    "Live send failed"
                );
                Some(error_frame(id, &e))
            }
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.hub.typing.clear_connection(self.id);
        if let Some(released) = self.hub.registry.release(self.id) {
            debug!(
                connection = %self.id,
                user = %released.user,
                went_offline = released.went_offline,
                "Session closed"
            );
        }
    }
}

fn error_frame(id: Option<u64>, error: &ChatError) -> Frame {
    Frame::error(id, error.code(), error.to_string())
}
