//! Event system for dedup operations
//!
//! Services emit a [`DedupEvent`] after each committed ledger change so audit
//! listeners can follow blob and link lifecycles without polling.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Dedup events emitted by services
#[derive(Debug, Clone)]
pub enum DedupEvent {
    /// First ingest of a hash wrote the object and its ledger row
    BlobStored {
        content_id: String,
        hash: String,
        size: u64,
    },
    LinkCreated {
        content_id: String,
        user_id: String,
        is_owner: bool,
        ref_count: i64,
    },
    LinkRemoved {
        content_id: String,
        user_id: String,
        ref_count: i64,
    },
    /// Last link went away; ledger row deleted and object removed
    BlobCollected {
        content_id: String,
        object_key: String,
    },
    /// Ledger row deleted but the object store refused the delete
    BlobCleanupFailed {
        content_id: String,
        object_key: String,
        error: String,
    },
}

/// Event bus for broadcasting dedup events
pub struct EventBus {
    sender: broadcast::Sender<DedupEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: DedupEvent) {
        trace!(event = ?event, "Emitting dedup event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<DedupEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Audit-trail log line for one event
fn log_event(event: &DedupEvent) {
    match event {
        DedupEvent::BlobStored { content_id, hash, size } => {
            debug!(content_id = %content_id, hash = %hash, size, "Blob stored");
        }
        DedupEvent::BlobCollected { content_id, object_key } => {
            debug!(content_id = %content_id, object_key = %object_key, "Blob collected");
        }
        DedupEvent::BlobCleanupFailed { content_id, object_key, error } => {
            warn!(
                content_id = %content_id,
                object_key = %object_key,
                error = %error,
                "Orphaned blob object"
            );
        }
        _ => {
            trace!(event = ?event, "Dedup event");
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(DedupEvent::BlobCollected {
            content_id: "c1".into(),
            object_key: "sha256-00".into(),
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");

        match event {
            DedupEvent::BlobCollected { content_id, object_key } => {
                assert_eq!(content_id, "c1");
                assert_eq!(object_key, "sha256-00");
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[tokio::test]
    async fn test_logging_listener_stops_when_bus_dropped() {
        let bus = Arc::new(EventBus::new());
        let handle = spawn_logging_listener(bus.clone());
        bus.emit(DedupEvent::BlobCleanupFailed {
            content_id: "c1".into(),
            object_key: "sha256-00".into(),
            error: "refused".into(),
        });
        drop(bus);

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener did not stop")
            .expect("listener panicked");
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        // Should not panic even with no subscribers
        bus.emit(DedupEvent::LinkRemoved {
            content_id: "c1".into(),
            user_id: "u1".into(),
            ref_count: 0,
        });
    }
}
