//! Activity event emission.
//!
//! The pipeline emits exactly one [`ActivityEvent`] per served query as a
//! one-way, fire-and-forget call through [`ActivitySink`]. The sink must
//! never block query completion and the core never reads events back;
//! downstream storage and analytics belong to the recorder service.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

/// How a query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Answered,
    InsufficientContext,
    Failed,
}

impl QueryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryOutcome::Answered => "answered",
            QueryOutcome::InsufficientContext => "insufficient_context",
            QueryOutcome::Failed => "failed",
        }
    }
}

/// Append-only record of one served query. Never mutated after emission.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub user_id: String,
    pub fingerprint: String,
    pub cache_hit: bool,
    pub outcome: QueryOutcome,
    pub latency_ms: u64,
    pub timestamp: i64,
}

/// One-way sink for activity events.
pub trait ActivitySink: Send + Sync {
    /// Must return promptly; dropping the event on a full or closed
    /// downstream is acceptable, blocking the query is not.
    fn record(&self, event: ActivityEvent);
}

/// Sink that writes events to the operational log.
pub struct TracingSink;

impl ActivitySink for TracingSink {
    fn record(&self, event: ActivityEvent) {
        info!(
            user_id = %event.user_id,
            fingerprint = %event.fingerprint,
            cache_hit = event.cache_hit,
            outcome = event.outcome.as_str(),
            latency_ms = event.latency_ms,
            "query served"
        );
    }
}

/// Sink that forwards events over an unbounded channel to an external
/// recorder task. Send failures (receiver gone) drop the event.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ActivityEvent>,
}

impl ChannelSink {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<ActivityEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ActivitySink for ChannelSink {
    fn record(&self, event: ActivityEvent) {
        let _ = self.tx.send(event);
    }
}

/// Sink that buffers events in memory; used by tests to assert emission.
#[derive(Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<ActivityEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.lock().expect("sink lock poisoned").clone()
    }
}

impl ActivitySink for MemorySink {
    fn record(&self, event: ActivityEvent) {
        self.events.lock().expect("sink lock poisoned").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(outcome: QueryOutcome) -> ActivityEvent {
        ActivityEvent {
            user_id: "u1".to_string(),
            fingerprint: "f1".to_string(),
            cache_hit: false,
            outcome,
            latency_ms: 12,
            timestamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::pair();
        sink.record(event(QueryOutcome::Answered));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.outcome, QueryOutcome::Answered);
    }

    #[tokio::test]
    async fn test_channel_sink_survives_closed_receiver() {
        let (sink, rx) = ChannelSink::pair();
        drop(rx);
        // Must not panic or block.
        sink.record(event(QueryOutcome::Failed));
    }

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemorySink::new();
        sink.record(event(QueryOutcome::Answered));
        sink.record(event(QueryOutcome::InsufficientContext));
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].outcome, QueryOutcome::InsufficientContext);
    }
}
