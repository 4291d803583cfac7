//! Frame types for the Tandem live channel.
//!
//! Every frame is an internally tagged map (`"type": "send-message"`, ...), so the
//! same definitions serve both the MessagePack and the JSON encodings.

use serde::{Deserialize, Serialize};

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded.
    pub const MALFORMED_FRAME: u16 = 1000;
    /// Input failed validation (empty text, bad identifier, ...).
    pub const VALIDATION: u16 = 1001;
    /// The caller is not a participant of the conversation.
    pub const NOT_AUTHORIZED: u16 = 1003;
    /// The referenced conversation does not exist.
    pub const NOT_FOUND: u16 = 1004;
    /// The durable store is unavailable; the client may retry.
    pub const UNAVAILABLE: u16 = 1005;
    /// The frame is not valid in the client-to-server direction.
    pub const UNEXPECTED_FRAME: u16 = 1006;
    /// A per-connection limit was reached.
    pub const LIMIT_REACHED: u16 = 1007;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    JoinConversation,
    Typing,
    StopTyping,
    SendMessage,
    NewMessage,
    Ack,
    Error,
    Ping,
    Pong,
    Connected,
}

impl FrameType {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::JoinConversation => "join-conversation",
            FrameType::Typing => "typing",
            FrameType::StopTyping => "stop-typing",
            FrameType::SendMessage => "send-message",
            FrameType::NewMessage => "new-message",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
            FrameType::Connected => "connected",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A read entry as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMark {
    /// Reader user id.
    pub user_id: String,
    /// Read time, milliseconds since the Unix epoch.
    pub read_at: i64,
}

/// A persisted message as delivered with `new-message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default)]
    pub read_by: Vec<ReadMark>,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: i64,
}

/// A live-channel frame.
///
/// `JoinConversation`, `SendMessage` and the client form of `Typing`/`StopTyping`
/// flow client to server. `NewMessage`, `Ack`, `Error`, `Connected` and the
/// server form of `Typing`/`StopTyping` (with `user_id` filled in) flow the
/// other way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// Subscribe this connection to a conversation room.
    JoinConversation {
        /// Optional request id for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        conversation_id: String,
    },

    /// Typing started (or continues).
    Typing {
        conversation_id: String,
        /// Set by the server on outbound frames.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        /// Client-declared inactivity window in milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inactivity_ms: Option<u64>,
    },

    /// Typing stopped.
    StopTyping {
        conversation_id: String,
        /// Set by the server on outbound frames.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    /// Send a message into a conversation.
    SendMessage {
        /// Optional request id for acknowledgment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        conversation_id: String,
        text: String,
    },

    /// A message was persisted in a conversation.
    NewMessage {
        conversation_id: String,
        message: MessagePayload,
    },

    /// Acknowledgment of a request.
    Ack {
        id: u64,
        /// Persisted message id, for `send-message` acks.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    /// Error response. `id` is 0 when the failed frame carried none.
    Error { id: u64, code: u16, message: String },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Sent once after admission.
    Connected {
        connection_id: String,
        user_id: String,
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::JoinConversation { .. } => FrameType::JoinConversation,
            Frame::Typing { .. } => FrameType::Typing,
            Frame::StopTyping { .. } => FrameType::StopTyping,
            Frame::SendMessage { .. } => FrameType::SendMessage,
            Frame::NewMessage { .. } => FrameType::NewMessage,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
        }
    }

    /// Create a `join-conversation` frame.
    #[must_use]
    pub fn join(id: Option<u64>, conversation_id: impl Into<String>) -> Self {
        Frame::JoinConversation {
            id,
            conversation_id: conversation_id.into(),
        }
    }

    /// Create a client `typing` frame.
    #[must_use]
    pub fn typing(conversation_id: impl Into<String>) -> Self {
        Frame::Typing {
            conversation_id: conversation_id.into(),
            user_id: None,
            inactivity_ms: None,
        }
    }

    /// Create a server `typing` notification for `user_id`.
    #[must_use]
    pub fn user_typing(conversation_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Frame::Typing {
            conversation_id: conversation_id.into(),
            user_id: Some(user_id.into()),
            inactivity_ms: None,
        }
    }

    /// Create a client `stop-typing` frame.
    #[must_use]
    pub fn stop_typing(conversation_id: impl Into<String>) -> Self {
        Frame::StopTyping {
            conversation_id: conversation_id.into(),
            user_id: None,
        }
    }

    /// Create a server `stop-typing` notification for `user_id`.
    #[must_use]
    pub fn user_stopped_typing(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Frame::StopTyping {
            conversation_id: conversation_id.into(),
            user_id: Some(user_id.into()),
        }
    }

    /// Create a `send-message` frame.
    #[must_use]
    pub fn send_message(
        id: Option<u64>,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Frame::SendMessage {
            id,
            conversation_id: conversation_id.into(),
            text: text.into(),
        }
    }

    /// Create a `new-message` frame.
    #[must_use]
    pub fn new_message(message: MessagePayload) -> Self {
        Frame::NewMessage {
            conversation_id: message.conversation_id.clone(),
            message,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack {
            id,
            message_id: None,
        }
    }

    /// Create an Ack frame carrying the persisted message id.
    #[must_use]
    pub fn ack_message(id: u64, message_id: impl Into<String>) -> Self {
        Frame::Ack {
            id,
            message_id: Some(message_id.into()),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: Option<u64>, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id: id.unwrap_or(0),
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        version: u8,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            version,
            heartbeat,
        }
    }

    /// Whether a client may send this frame.
    #[must_use]
    pub fn is_client_frame(&self) -> bool {
        match self {
            Frame::JoinConversation { .. }
            | Frame::SendMessage { .. }
            | Frame::Ping { .. }
            | Frame::Pong { .. } => true,
            Frame::Typing { user_id, .. } | Frame::StopTyping { user_id, .. } => user_id.is_none(),
            Frame::NewMessage { .. }
            | Frame::Ack { .. }
            | Frame::Error { .. }
            | Frame::Connected { .. } => false,
        }
    }

    /// The request id carried by the frame, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::JoinConversation { id, .. } | Frame::SendMessage { id, .. } => *id,
            _ => None,
        }
    }
}
