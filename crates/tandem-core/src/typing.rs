//! Typing indicators.
//!
//! Each (conversation, user) key is either idle (no entry) or typing (an entry
//! holding a countdown). Every arm or reset stamps the session with a fresh
//! generation; an expiry only acts if its generation is still current, so a
//! timer that fires concurrently with a reset or a stop is a no-op.

use crate::model::{ConversationId, UserId};
use crate::registry::{ConnectionId, ConnectionRegistry};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_protocol::Frame;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

type TypingKey = (ConversationId, UserId);

/// Typing window configuration.
#[derive(Debug, Clone, Copy)]
pub struct TypingConfig {
    /// Safety timeout when the client declares no window.
    pub timeout: Duration,
    /// Floor for client-declared windows.
    pub min_window: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            min_window: Duration::from_millis(500),
        }
    }
}

impl TypingConfig {
    /// Effective countdown for an optional client-declared inactivity window.
    #[must_use]
    pub fn window(&self, declared: Option<Duration>) -> Duration {
        match declared {
            Some(d) => d.max(self.min_window).min(self.timeout),
            None => self.timeout,
        }
    }
}

#[derive(Debug)]
struct Session {
    generation: u64,
    origin: Option<ConnectionId>,
    timer: JoinHandle<()>,
}

/// Per-key typing state machine with self-expiring countdowns.
pub struct TypingCoordinator {
    sessions: Arc<DashMap<TypingKey, Session>>,
    generation: AtomicU64,
    registry: Arc<ConnectionRegistry>,
    config: TypingConfig,
}

impl TypingCoordinator {
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, config: TypingConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            generation: AtomicU64::new(1),
            registry,
            config,
        }
    }

    /// Typing started or continues.
    ///
    /// Broadcasts `typing` to the room (excluding `origin`) and arms or resets
    /// the countdown. Must be called from within a Tokio runtime.
    pub fn signal(
        &self,
        conversation: ConversationId,
        user: &UserId,
        origin: Option<ConnectionId>,
        inactivity: Option<Duration>,
    ) {
        self.registry.broadcast(
            conversation,
            Frame::user_typing(conversation.to_string(), user.as_str()),
            origin,
        );

        let key = (conversation, user.clone());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let window = self.config.window(inactivity);

        let timer = tokio::spawn(expire(
            self.sessions.clone(),
            self.registry.clone(),
            key.clone(),
            generation,
            Instant::now() + window,
        ));

        let previous = self.sessions.insert(
            key,
            Session {
                generation,
                origin,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
        }

        trace!(
            conversation = %conversation,
            user = %user,
            generation,
            window_ms = window.as_millis() as u64,
            "Typing armed"
        );
    }

    /// Explicit stop. Broadcasts `stop-typing` if the key was typing.
    ///
    /// Returns `true` if a live session was cleared.
    pub fn stop(
        &self,
        conversation: ConversationId,
        user: &UserId,
        origin: Option<ConnectionId>,
    ) -> bool {
        let Some((_, session)) = self.sessions.remove(&(conversation, user.clone())) else {
            return false;
        };
        session.timer.abort();
        self.registry.broadcast(
            conversation,
            Frame::user_stopped_typing(conversation.to_string(), user.as_str()),
            origin,
        );
        true
    }

    /// Force the key idle after a successful send.
    ///
    /// Always broadcasts `stop-typing`, whether or not a session was live.
    pub fn clear_after_send(
        &self,
        conversation: ConversationId,
        user: &UserId,
        origin: Option<ConnectionId>,
    ) {
        if let Some((_, session)) = self.sessions.remove(&(conversation, user.clone())) {
            session.timer.abort();
        }
        self.registry.broadcast(
            conversation,
            Frame::user_stopped_typing(conversation.to_string(), user.as_str()),
            origin,
        );
    }

    /// Stop every session armed by a connection that is going away.
    ///
    /// Returns the number of sessions cleared.
    pub fn clear_connection(&self, connection: ConnectionId) -> usize {
        let keys: Vec<TypingKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.origin == Some(connection))
            .map(|entry| entry.key().clone())
            .collect();

        let mut cleared = 0;
        for key in keys {
            let removed = self
                .sessions
                .remove_if(&key, |_, session| session.origin == Some(connection));
            if let Some(((conversation, user), session)) = removed {
                session.timer.abort();
                self.registry.broadcast(
                    conversation,
                    Frame::user_stopped_typing(conversation.to_string(), user.as_str()),
                    Some(connection),
                );
                cleared += 1;
            }
        }
        if cleared > 0 {
            debug!(connection = %connection, cleared, "Cleared typing sessions");
        }
        cleared
    }

    /// Whether `user` is currently typing in `conversation`.
    #[must_use]
    pub fn is_typing(&self, conversation: ConversationId, user: &UserId) -> bool {
        self.sessions.contains_key(&(conversation, user.clone()))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

impl Drop for TypingCoordinator {
    fn drop(&mut self) {
        for entry in self.sessions.iter() {
            entry.timer.abort();
        }
    }
}

async fn expire(
    sessions: Arc<DashMap<TypingKey, Session>>,
    registry: Arc<ConnectionRegistry>,
    key: TypingKey,
    generation: u64,
    deadline: Instant,
) {
    tokio::time::sleep_until(deadline).await;

    // A reset or stop that won the race already replaced or removed the entry.
    let Some(((conversation, user), session)) =
        sessions.remove_if(&key, |_, session| session.generation == generation)
    else {
        return;
    };

    debug!(conversation = %conversation, user = %user, "Typing expired");
    registry.broadcast(
        conversation,
        Frame::user_stopped_typing(conversation.to_string(), user.as_str()),
        session.origin,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Outbox;
    use tandem_protocol::FrameType;
    use tokio::sync::mpsc;

    struct Room {
        registry: Arc<ConnectionRegistry>,
        conversation: ConversationId,
        typist: ConnectionId,
        peer_rx: mpsc::Receiver<Arc<Frame>>,
        _typist_rx: mpsc::Receiver<Arc<Frame>>,
    }

    fn room() -> Room {
        let registry = Arc::new(ConnectionRegistry::new());
        let conversation = ConversationId::generate();
        let typist = ConnectionId::generate();
        let peer = ConnectionId::generate();
        let (typist_tx, typist_rx): (Outbox, _) = mpsc::channel(64);
        let (peer_tx, peer_rx): (Outbox, _) = mpsc::channel(64);
        registry.admit(typist, &"alice".into(), typist_tx).unwrap();
        registry.admit(peer, &"bob".into(), peer_tx).unwrap();
        registry.subscribe(typist, conversation).unwrap();
        registry.subscribe(peer, conversation).unwrap();
        Room {
            registry,
            conversation,
            typist,
            peer_rx,
            _typist_rx: typist_rx,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<Frame>>) -> Vec<FrameType> {
        let mut seen = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            seen.push(frame.frame_type());
        }
        seen
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_window_clamp() {
        let config = TypingConfig::default();
        assert_eq!(config.window(None), Duration::from_secs(60));
        assert_eq!(config.window(Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(config.window(Some(Duration::from_millis(10))), Duration::from_millis(500));
        assert_eq!(config.window(Some(Duration::from_secs(600))), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_emits_single_stop() {
        let mut room = room();
        let typing = TypingCoordinator::new(room.registry.clone(), TypingConfig::default());
        let alice: UserId = "alice".into();

        typing.signal(room.conversation, &alice, Some(room.typist), None);
        assert_eq!(drain(&mut room.peer_rx), [FrameType::Typing]);
        assert!(typing.is_typing(room.conversation, &alice));

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;

        assert_eq!(drain(&mut room.peer_rx), [FrameType::StopTyping]);
        assert!(!typing.is_typing(room.conversation, &alice));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_does_not_stack() {
        let mut room = room();
        let typing = TypingCoordinator::new(room.registry.clone(), TypingConfig::default());
        let alice: UserId = "alice".into();

        typing.signal(room.conversation, &alice, Some(room.typist), None);
        tokio::time::sleep(Duration::from_secs(30)).await;
        typing.signal(room.conversation, &alice, Some(room.typist), None);
        assert_eq!(drain(&mut room.peer_rx), [FrameType::Typing, FrameType::Typing]);

        // The first countdown would have fired at t=60.
        tokio::time::sleep(Duration::from_secs(35)).await;
        settle().await;
        assert!(drain(&mut room.peer_rx).is_empty());
        assert!(typing.is_typing(room.conversation, &alice));

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(drain(&mut room.peer_rx), [FrameType::StopTyping]);
        assert_eq!(typing.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expiry_is_noop() {
        let mut room = room();
        let typing = TypingCoordinator::new(room.registry.clone(), TypingConfig::default());
        let alice: UserId = "alice".into();
        let key = (room.conversation, alice.clone());

        typing.signal(room.conversation, &alice, Some(room.typist), None);
        let stale = typing.sessions.get(&key).unwrap().generation;
        typing.signal(room.conversation, &alice, Some(room.typist), None);
        drain(&mut room.peer_rx);

        // An expiry for the replaced generation fires after the reset.
        expire(
            typing.sessions.clone(),
            room.registry.clone(),
            key.clone(),
            stale,
            Instant::now(),
        )
        .await;

        assert!(drain(&mut room.peer_rx).is_empty());
        assert!(typing.is_typing(room.conversation, &alice));
        assert_ne!(typing.sessions.get(&key).unwrap().generation, stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_cancels_timer() {
        let mut room = room();
        let typing = TypingCoordinator::new(room.registry.clone(), TypingConfig::default());
        let alice: UserId = "alice".into();

        typing.signal(
            room.conversation,
            &alice,
            Some(room.typist),
            Some(Duration::from_secs(2)),
        );
        assert!(typing.stop(room.conversation, &alice, Some(room.typist)));
        assert!(!typing.stop(room.conversation, &alice, Some(room.typist)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(drain(&mut room.peer_rx), [FrameType::Typing, FrameType::StopTyping]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_clears_typing() {
        let mut room = room();
        let typing = TypingCoordinator::new(room.registry.clone(), TypingConfig::default());
        let alice: UserId = "alice".into();

        typing.signal(room.conversation, &alice, Some(room.typist), None);
        typing.clear_after_send(room.conversation, &alice, Some(room.typist));
        assert!(!typing.is_typing(room.conversation, &alice));

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(drain(&mut room.peer_rx), [FrameType::Typing, FrameType::StopTyping]);

        // No live session: the stop is still announced.
        typing.clear_after_send(room.conversation, &alice, None);
        assert_eq!(drain(&mut room.peer_rx), [FrameType::StopTyping]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_connection() {
        let mut room = room();
        let typing = TypingCoordinator::new(room.registry.clone(), TypingConfig::default());
        let alice: UserId = "alice".into();

        typing.signal(room.conversation, &alice, Some(room.typist), None);
        room.registry.release(room.typist);
        assert_eq!(typing.clear_connection(room.typist), 1);
        assert_eq!(drain(&mut room.peer_rx), [FrameType::Typing, FrameType::StopTyping]);

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert!(drain(&mut room.peer_rx).is_empty());
    }
}
