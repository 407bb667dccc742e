//! Audit events for executions
//!
//! One [`ExecutionEvent`] is emitted per candidate outcome. Sinks must not
//! block the coordinator and cannot fail it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::registry::BackendId;
use crate::router::TaskProfile;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Outcome of one candidate backend within an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    pub task: TaskProfile,
    pub backend: BackendId,
    pub success: bool,
    pub attempts: u32,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Receives execution events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &ExecutionEvent);
}

/// Shared reference to an audit sink
pub type SharedAuditSink = Arc<dyn AuditSink>;

/// Audit sink that publishes events on a broadcast channel
pub struct BroadcastAuditSink {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastAuditSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for BroadcastAuditSink {
    fn record(&self, event: &ExecutionEvent) {
        // No receivers is fine
        match self.sender.send(event.clone()) {
            Ok(count) => debug!(
                execution_id = %event.execution_id,
                receivers = count,
                "Audit event published"
            ),
            Err(_) => debug!(
                execution_id = %event.execution_id,
                "Audit event dropped (no receivers)"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(success: bool) -> ExecutionEvent {
        ExecutionEvent {
            execution_id: Uuid::new_v4(),
            task: TaskProfile::default(),
            backend: "fast".into(),
            success,
            attempts: 1,
            latency_ms: 12,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_record_without_subscribers_is_silent() {
        let sink = BroadcastAuditSink::new();
        assert_eq!(sink.subscriber_count(), 0);
        sink.record(&event(true));
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let sink = BroadcastAuditSink::new();
        let mut rx = sink.subscribe();
        let sent = event(false);
        sink.record(&sent);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.execution_id, sent.execution_id);
        assert!(!got.success);
    }
}
