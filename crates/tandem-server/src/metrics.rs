//! Metrics collection and export for Tandem.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{ChatHub, HubStats};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// How often hub statistics are republished while connections stay open.
pub const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "tandem_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "tandem_connections_active";
    pub const ADMISSIONS_REJECTED: &str = "tandem_admissions_rejected_total";
    pub const FRAMES_TOTAL: &str = "tandem_frames_total";
    pub const FRAMES_BYTES: &str = "tandem_frames_bytes";
    pub const MESSAGES_SENT: &str = "tandem_messages_sent_total";
    pub const DELIVERIES_TOTAL: &str = "tandem_deliveries_total";
    pub const DELIVERIES_DROPPED: &str = "tandem_deliveries_dropped_total";
    pub const TYPING_SIGNALS: &str = "tandem_typing_signals_total";
    pub const ROOMS_ACTIVE: &str = "tandem_rooms_active";
    pub const USERS_ONLINE: &str = "tandem_users_online";
    pub const TYPING_ACTIVE: &str = "tandem_typing_sessions_active";
    pub const LATENCY_SECONDS: &str = "tandem_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "tandem_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of admitted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of live connections"
    );
    metrics::describe_counter!(
        names::ADMISSIONS_REJECTED,
        "Connections refused before upgrade"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of live-channel frames");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of live-channel frames");
    metrics::describe_counter!(names::MESSAGES_SENT, "Messages persisted");
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Broadcast frames queued on connections"
    );
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED,
        "Broadcast frames dropped on full or closed outboxes"
    );
    metrics::describe_counter!(names::TYPING_SIGNALS, "Typing signals received");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Conversation rooms with subscribers");
    metrics::describe_gauge!(names::USERS_ONLINE, "Users with at least one connection");
    metrics::describe_gauge!(names::TYPING_ACTIVE, "Live typing sessions");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a refused admission.
pub fn record_rejected(reason: &'static str) {
    counter!(names::ADMISSIONS_REJECTED, "reason" => reason).increment(1);
}

/// Record a live-channel frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a persisted message.
pub fn record_message_sent(path: &'static str) {
    counter!(names::MESSAGES_SENT, "path" => path).increment(1);
}

/// Record a typing signal.
pub fn record_typing() {
    counter!(names::TYPING_SIGNALS).increment(1);
}

/// Record frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Publish registry statistics.
pub fn set_hub_gauges(stats: &HubStats) {
    counter!(names::DELIVERIES_TOTAL).absolute(stats.registry.delivered);
    counter!(names::DELIVERIES_DROPPED).absolute(stats.registry.dropped);
    gauge!(names::ROOMS_ACTIVE).set(stats.registry.room_count as f64);
    gauge!(names::USERS_ONLINE).set(stats.registry.user_count as f64);
    gauge!(names::TYPING_ACTIVE).set(stats.typing_sessions as f64);
}

/// Republish hub statistics every `period` until the task is aborted.
pub fn spawn_gauge_refresh(hub: Arc<ChatHub>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            set_hub_gauges(&hub.stats());
        }
    })
}

/// Record an error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tandem_core::{
        AuthenticatedUser, ConversationId, HubConfig, MemoryStore, StaticVerifier, UserId,
    };

    fn hub() -> Arc<ChatHub> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(ChatHub::new(
            Arc::new(StaticVerifier::new()),
            store.clone(),
            store,
            HubConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_hub_gauges_track_live_state() {
        let hub = hub();
        let (_session, _outbox) = hub
            .open(AuthenticatedUser::new(UserId::from("alice")))
            .unwrap();
        hub.typing()
            .signal(ConversationId::generate(), &UserId::from("alice"), None, None);

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || set_hub_gauges(&hub.stats()));

        let rendered = handle.render();
        assert!(rendered.contains("tandem_users_online 1"), "{rendered}");
        assert!(rendered.contains("tandem_typing_sessions_active 1"), "{rendered}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gauge_refresh_keeps_running() {
        let task = spawn_gauge_refresh(hub(), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(!task.is_finished());
        task.abort();
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every call is a no-op.
        let guard = ConnectionMetricsGuard::new();
        record_frame(12, "inbound");
        record_message_sent("live");
        record_error("validation");
        drop(guard);
    }
}
