//! # tandem-core
//!
//! Two-party conversation delivery for the Tandem chat server.
//!
//! - **Identity** - resolve opaque tokens to users
//! - **Store** - durable conversations and messages (in-memory or SQLite)
//! - **Registry** - live connections, their users and their rooms
//! - **Typing** - self-expiring typing indicators
//! - **Pipeline** - the single validate/persist/broadcast send path
//! - **Gateway** - request/response conversation operations
//! - **Hub** - live-session dispatch tying the above together
//!
//! ## Architecture
//!
//! ```text
//!  request path ──▶ ┌───────────┐
//!                   │  Gateway  │──┐
//!                   └───────────┘  │   ┌──────────┐     ┌─────────┐
//!                                  ├──▶│ Pipeline │────▶│  Store  │
//!                   ┌───────────┐  │   └──────────┘     └─────────┘
//!  live channel ──▶ │    Hub    │──┘        │
//!                   └───────────┘           ▼
//!                         │          ┌────────────┐     ┌──────────┐
//!                         └─────────▶│  Registry  │◀────│  Typing  │
//!                                    └────────────┘     └──────────┘
//! ```

pub mod error;
pub mod gateway;
pub mod hub;
pub mod identity;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod store;
pub mod typing;

pub use error::{AuthError, ChatError, ErrorKind};
pub use gateway::{parse_conversation_id, ConversationGateway};
pub use hub::{ChatHub, HubConfig, HubStats, LiveSession};
pub use identity::{AuthenticatedUser, IdentityVerifier, JwtVerifier, StaticVerifier};
pub use model::{
    Conversation, ConversationId, ConversationView, Message, MessageId, MessageView,
    ParticipantPair, ReachableUser, ReadEntry, UserId, UserSummary,
};
pub use pipeline::{MessagePipeline, Sent};
pub use registry::{
    ConnectionId, ConnectionRegistry, Delivery, Outbox, RegistryConfig, RegistryError,
    RegistryStats,
};
pub use store::{ConversationStore, MemoryStore, StoreError, UserDirectory};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use typing::{TypingConfig, TypingCoordinator};
