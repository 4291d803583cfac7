//! Connection registry.
//!
//! Tracks which users are reachable on which live connections, and which
//! connections are subscribed to which conversation rooms. `admit`,
//! `subscribe`, `broadcast` and `release` are the only entry points that touch
//! the indices.
//!
//! ```text
//!  users: UserId ──▶ {ConnectionId}        rooms: ConversationId ──▶ {ConnectionId}
//!                          │                                │
//!                          ▼                                ▼
//!           connections: ConnectionId ──▶ ConnectionRecord { user, rooms, outbox }
//! ```
//!
//! Shard locks are never held across an `.await`: broadcast snapshots the
//! target outboxes, drops every guard, then delivers.

use crate::model::{ConversationId, UserId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tandem_protocol::Frame;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Outbound half of a connection: frames queued here are written to the socket.
pub type Outbox = mpsc::Sender<Arc<Frame>>;

/// Opaque identifier for a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection was never admitted, or has been released.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection is already bound to a user.
    #[error("Connection already admitted: {0}")]
    AlreadyAdmitted(ConnectionId),

    /// Too many live connections.
    #[error("Maximum connections reached")]
    MaxConnectionsReached,

    /// Per-connection room limit reached.
    #[error("Maximum rooms per connection reached")]
    MaxRoomsReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of live connections.
    pub max_connections: usize,
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_rooms_per_connection: 256,
        }
    }
}

/// Per-connection arena entry.
#[derive(Debug)]
struct ConnectionRecord {
    /// Set once at admission.
    user: UserId,
    rooms: HashSet<ConversationId>,
    outbox: Outbox,
}

/// What `release` tore down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub user: UserId,
    pub rooms: Vec<ConversationId>,
    /// `true` if this was the user's last connection.
    pub went_offline: bool,
}

/// Result of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Frames queued on a connection's outbox.
    pub delivered: usize,
    /// Connections whose outbox was full or closed.
    pub dropped: usize,
}

/// The live connection registry.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionRecord>,
    users: DashMap<UserId, HashSet<ConnectionId>>,
    rooms: DashMap<ConversationId, HashSet<ConnectionId>>,
    /// Reserved connection slots; taken before insert so the cap holds under
    /// concurrent admission.
    slots: AtomicUsize,
    delivered: AtomicU64,
    dropped: AtomicU64,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating connection registry with config: {:?}", config);
        Self {
            connections: DashMap::new(),
            users: DashMap::new(),
            rooms: DashMap::new(),
            slots: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            config,
        }
    }

    /// Bind a connection to an authenticated user.
    ///
    /// Callers obtain `user` from an identity verifier; there is no path that
    /// admits a connection without one.
    ///
    /// # Errors
    ///
    /// Fails if the connection id is already admitted or the connection limit
    /// is reached.
    pub fn admit(
        &self,
        connection: ConnectionId,
        user: &UserId,
        outbox: Outbox,
    ) -> Result<(), RegistryError> {
        let max = self.config.max_connections;
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .map_err(|_| RegistryError::MaxConnectionsReached)?;

        match self.connections.entry(connection) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                self.slots.fetch_sub(1, Ordering::AcqRel);
                return Err(RegistryError::AlreadyAdmitted(connection));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ConnectionRecord {
                    user: user.clone(),
                    rooms: HashSet::new(),
                    outbox,
                });
            }
        }
        self.users.entry(user.clone()).or_default().insert(connection);

        debug!(connection = %connection, user = %user, "Connection admitted");
        Ok(())
    }

    /// Add a connection to a conversation room. Idempotent.
    ///
    /// No membership check happens here; rooms only steer fan-out.
    ///
    /// Returns `true` if the connection was not already in the room.
    ///
    /// # Errors
    ///
    /// Fails if the connection is unknown or has hit its room limit.
    pub fn subscribe(
        &self,
        connection: ConnectionId,
        conversation: ConversationId,
    ) -> Result<bool, RegistryError> {
        let mut record = self
            .connections
            .get_mut(&connection)
            .ok_or(RegistryError::UnknownConnection(connection))?;

        if record.rooms.contains(&conversation) {
            return Ok(false);
        }
        if record.rooms.len() >= self.config.max_rooms_per_connection {
            return Err(RegistryError::MaxRoomsReached);
        }
        record.rooms.insert(conversation);

        // Lock order: connection record, then room. `release` follows the same order.
        self.rooms.entry(conversation).or_default().insert(connection);

        debug!(
            connection = %connection,
            conversation = %conversation,
            "Joined room"
        );
        Ok(true)
    }

    /// Queue `frame` on every connection in the room except `exclude`.
    ///
    /// Delivery is fire-and-forget: a full or closed outbox is logged and
    /// skipped without affecting the other recipients.
    pub fn broadcast(
        &self,
        conversation: ConversationId,
        frame: Frame,
        exclude: Option<ConnectionId>,
    ) -> Delivery {
        let targets: Vec<(ConnectionId, Outbox)> = {
            let Some(room) = self.rooms.get(&conversation) else {
                trace!(conversation = %conversation, "Broadcast to empty room");
                return Delivery::default();
            };
            let members: Vec<ConnectionId> = room
                .iter()
                .copied()
                .filter(|id| Some(*id) != exclude)
                .collect();
            drop(room);

            members
                .into_iter()
                .filter_map(|id| {
                    self.connections
                        .get(&id)
                        .map(|record| (id, record.outbox.clone()))
                })
                .collect()
        };

        let frame = Arc::new(frame);
        let mut delivery = Delivery::default();
        for (id, outbox) in targets {
            match outbox.try_send(frame.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    warn!(
                        connection = %id,
                        conversation = %conversation,
                        event = %frame.frame_type(),
                        error = %e,
                        "Dropped broadcast frame"
                    );
                    delivery.dropped += 1;
                }
            }
        }

        self.delivered
            .fetch_add(delivery.delivered as u64, Ordering::Relaxed);
        self.dropped
            .fetch_add(delivery.dropped as u64, Ordering::Relaxed);
        trace!(
            conversation = %conversation,
            event = %frame.frame_type(),
            recipients = delivery.delivered,
            "Broadcast"
        );
        delivery
    }

    /// Queue `frame` on a single connection.
    ///
    /// # Errors
    ///
    /// Fails if the connection is unknown. A full outbox is reported as
    /// `Ok(false)`.
    pub fn send_to(&self, connection: ConnectionId, frame: Frame) -> Result<bool, RegistryError> {
        let outbox = self
            .connections
            .get(&connection)
            .map(|record| record.outbox.clone())
            .ok_or(RegistryError::UnknownConnection(connection))?;
        Ok(outbox.try_send(Arc::new(frame)).is_ok())
    }

    /// Remove a connection from every index.
    ///
    /// Returns `None` if the connection was already released.
    pub fn release(&self, connection: ConnectionId) -> Option<Released> {
        let (_, record) = self.connections.remove(&connection)?;
        self.slots.fetch_sub(1, Ordering::AcqRel);

        for conversation in &record.rooms {
            self.rooms.remove_if_mut(conversation, |_, members| {
                members.remove(&connection);
                members.is_empty()
            });
        }

        let mut went_offline = false;
        self.users.remove_if_mut(&record.user, |_, connections| {
            connections.remove(&connection);
            went_offline = connections.is_empty();
            went_offline
        });

        debug!(
            connection = %connection,
            user = %record.user,
            rooms = record.rooms.len(),
            went_offline,
            "Connection released"
        );

        Some(Released {
            user: record.user,
            rooms: record.rooms.into_iter().collect(),
            went_offline,
        })
    }

    /// The user bound to a live connection.
    #[must_use]
    pub fn user_of(&self, connection: ConnectionId) -> Option<UserId> {
        self.connections
            .get(&connection)
            .map(|record| record.user.clone())
    }

    /// Whether `user` holds at least one live connection.
    ///
    /// A best-effort snapshot; it may be stale by the time it is acted on.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.users.contains_key(user)
    }

    /// Users holding at least one live connection.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.users.iter().map(|e| e.key().clone()).collect()
    }

    /// Live connections of a user.
    #[must_use]
    pub fn connections_of(&self, user: &UserId) -> Vec<ConnectionId> {
        self.users
            .get(user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of connections in a room.
    #[must_use]
    pub fn room_size(&self, conversation: ConversationId) -> usize {
        self.rooms.get(&conversation).map(|r| r.len()).unwrap_or(0)
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connection_count: self.connections.len(),
            user_count: self.users.len(),
            room_count: self.rooms.len(),
            total_subscriptions: self.rooms.iter().map(|r| r.len()).sum(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of live connections.
    pub connection_count: usize,
    /// Number of users with at least one connection.
    pub user_count: usize,
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Total number of room subscriptions.
    pub total_subscriptions: usize,
    /// Frames queued by broadcasts since start.
    pub delivered: u64,
    /// Broadcast frames dropped on full or closed outboxes since start.
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> (Outbox, mpsc::Receiver<Arc<Frame>>) {
        mpsc::channel(16)
    }

    #[test]
    fn test_admit_and_release() {
        let registry = ConnectionRegistry::new();
        let alice: UserId = "alice".into();
        let c1 = ConnectionId::generate();
        let c2 = ConnectionId::generate();
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();

        registry.admit(c1, &alice, tx1).unwrap();
        registry.admit(c2, &alice, tx2).unwrap();
        assert!(registry.is_online(&alice));
        assert_eq!(registry.connections_of(&alice).len(), 2);

        let released = registry.release(c1).unwrap();
        assert!(!released.went_offline);
        assert!(registry.is_online(&alice));

        let released = registry.release(c2).unwrap();
        assert!(released.went_offline);
        assert!(!registry.is_online(&alice));
        assert!(registry.online_users().is_empty());

        // Second release is a no-op.
        assert!(registry.release(c2).is_none());
    }

    #[test]
    fn test_admit_twice_rejected() {
        let registry = ConnectionRegistry::new();
        let c1 = ConnectionId::generate();
        let (tx, _rx) = outbox();
        registry.admit(c1, &"a".into(), tx.clone()).unwrap();
        assert_eq!(
            registry.admit(c1, &"b".into(), tx),
            Err(RegistryError::AlreadyAdmitted(c1))
        );
        assert_eq!(registry.user_of(c1), Some("a".into()));
    }

    #[test]
    fn test_connection_limit() {
        let registry = ConnectionRegistry::with_config(RegistryConfig {
            max_connections: 1,
            ..RegistryConfig::default()
        });
        let (tx, _rx) = outbox();
        registry.admit(ConnectionId::generate(), &"a".into(), tx.clone()).unwrap();
        assert_eq!(
            registry.admit(ConnectionId::generate(), &"b".into(), tx),
            Err(RegistryError::MaxConnectionsReached)
        );
    }

    #[test]
    fn test_connection_limit_under_concurrent_admission() {
        let registry = ConnectionRegistry::with_config(RegistryConfig {
            max_connections: 8,
            ..RegistryConfig::default()
        });
        let (tx, _rx) = outbox();
        let barrier = std::sync::Barrier::new(16);

        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let (registry, barrier, tx) = (&registry, &barrier, tx.clone());
                    scope.spawn(move || {
                        barrier.wait();
                        (0..4)
                            .filter(|_| {
                                let user = UserId::from(format!("user-{i}"));
                                registry
                                    .admit(ConnectionId::generate(), &user, tx.clone())
                                    .is_ok()
                            })
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(admitted, 8);
        assert_eq!(registry.stats().connection_count, 8);

        // Releasing frees a slot.
        let user = registry.online_users()[0].clone();
        let connection = registry.connections_of(&user)[0];
        registry.release(connection).unwrap();
        registry.admit(ConnectionId::generate(), &"late".into(), tx).unwrap();
        assert_eq!(registry.stats().connection_count, 8);
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let c1 = ConnectionId::generate();
        let conv = ConversationId::generate();
        let (tx, _rx) = outbox();
        registry.admit(c1, &"a".into(), tx).unwrap();

        assert!(registry.subscribe(c1, conv).unwrap());
        assert!(!registry.subscribe(c1, conv).unwrap());
        assert_eq!(registry.room_size(conv), 1);

        let unknown = ConnectionId::generate();
        assert_eq!(
            registry.subscribe(unknown, conv),
            Err(RegistryError::UnknownConnection(unknown))
        );
    }

    #[test]
    fn test_room_limit() {
        let registry = ConnectionRegistry::with_config(RegistryConfig {
            max_rooms_per_connection: 1,
            ..RegistryConfig::default()
        });
        let c1 = ConnectionId::generate();
        let (tx, _rx) = outbox();
        registry.admit(c1, &"a".into(), tx).unwrap();
        registry.subscribe(c1, ConversationId::generate()).unwrap();
        assert_eq!(
            registry.subscribe(c1, ConversationId::generate()),
            Err(RegistryError::MaxRoomsReached)
        );
    }

    #[test]
    fn test_broadcast_excludes_origin() {
        let registry = ConnectionRegistry::new();
        let conv = ConversationId::generate();
        let c1 = ConnectionId::generate();
        let c2 = ConnectionId::generate();
        let (tx1, mut rx1) = outbox();
        let (tx2, mut rx2) = outbox();
        registry.admit(c1, &"a".into(), tx1).unwrap();
        registry.admit(c2, &"b".into(), tx2).unwrap();
        registry.subscribe(c1, conv).unwrap();
        registry.subscribe(c2, conv).unwrap();

        let delivery = registry.broadcast(conv, Frame::user_typing(conv.to_string(), "a"), Some(c1));
        assert_eq!(delivery.delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().frame_type(), tandem_protocol::FrameType::Typing);
    }

    #[test]
    fn test_broadcast_survives_failed_recipient() {
        let registry = ConnectionRegistry::new();
        let conv = ConversationId::generate();
        let c1 = ConnectionId::generate();
        let c2 = ConnectionId::generate();
        let (tx1, rx1) = outbox();
        let (tx2, mut rx2) = outbox();
        registry.admit(c1, &"a".into(), tx1).unwrap();
        registry.admit(c2, &"b".into(), tx2).unwrap();
        registry.subscribe(c1, conv).unwrap();
        registry.subscribe(c2, conv).unwrap();

        // c1's socket task is gone but it has not been released yet.
        drop(rx1);

        let delivery = registry.broadcast(conv, Frame::user_typing(conv.to_string(), "a"), None);
        assert_eq!(delivery, Delivery { delivered: 1, dropped: 1 });
        assert!(rx2.try_recv().is_ok());
        assert_eq!(registry.stats().dropped, 1);
    }

    #[test]
    fn test_release_prunes_rooms() {
        let registry = ConnectionRegistry::new();
        let conv = ConversationId::generate();
        let c1 = ConnectionId::generate();
        let c2 = ConnectionId::generate();
        let (tx1, _rx1) = outbox();
        let (tx2, mut rx2) = outbox();
        registry.admit(c1, &"a".into(), tx1).unwrap();
        registry.admit(c2, &"b".into(), tx2).unwrap();
        registry.subscribe(c1, conv).unwrap();
        registry.subscribe(c2, conv).unwrap();

        let released = registry.release(c1).unwrap();
        assert_eq!(released.rooms, vec![conv]);
        assert_eq!(registry.room_size(conv), 1);

        // Broadcasting after c1 left still reaches c2.
        let delivery = registry.broadcast(conv, Frame::user_stopped_typing(conv.to_string(), "a"), None);
        assert_eq!(delivery, Delivery { delivered: 1, dropped: 0 });
        assert!(rx2.try_recv().is_ok());

        registry.release(c2).unwrap();
        assert_eq!(registry.stats().room_count, 0);
    }

    #[test]
    fn test_stats() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = outbox();
        let c1 = ConnectionId::generate();
        let c2 = ConnectionId::generate();
        registry.admit(c1, &"a".into(), tx.clone()).unwrap();
        registry.admit(c2, &"a".into(), tx).unwrap();
        registry.subscribe(c1, ConversationId::generate()).unwrap();
        registry.subscribe(c2, ConversationId::generate()).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.user_count, 1);
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.total_subscriptions, 2);
    }

    #[test]
    fn test_send_to() {
        let registry = ConnectionRegistry::new();
        let c1 = ConnectionId::generate();
        let (tx, mut rx) = outbox();
        registry.admit(c1, &"a".into(), tx).unwrap();
        assert!(registry.send_to(c1, Frame::ack(1)).unwrap());
        assert_eq!(*rx.try_recv().unwrap(), Frame::ack(1));
        registry.release(c1);
        assert!(registry.send_to(c1, Frame::ack(2)).is_err());
    }
}
