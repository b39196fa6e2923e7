//! Event hub: broadcast fan-out to external consumers.
//!
//! The hub is a thin wrapper over `tokio::sync::broadcast`. Emission
//! never blocks the pipeline; subscribers that fall behind lose the
//! oldest events (broadcast semantics), which is the right trade-off
//! for dashboard traffic.

use tokio::sync::broadcast;
use tracing::trace;

use crate::types::IndexerEvent;

/// Default ring capacity per subscriber.
const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast hub for [`IndexerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<IndexerEvent>,
}

impl EventHub {
    /// Create a hub with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a hub with an explicit ring capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<IndexerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A hub with no subscribers swallows it.
    pub fn emit(&self, event: IndexerEvent) {
        // send() only errs when there are no receivers, which is fine.
        if self.tx.send(event).is_err() {
            trace!("event emitted with no subscribers");
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{HealingEvent, LazyStatus};
    use crate::types::BlockNumber;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        hub.emit(IndexerEvent::LazyStatus(LazyStatus {
            state: "active".into(),
            idle_secs: 0,
        }));

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, IndexerEvent::LazyStatus(_)));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let hub = EventHub::new();
        // Must not panic or error.
        hub.emit(IndexerEvent::SystemHealing(HealingEvent {
            reason: "test".into(),
            before: BlockNumber::new(0),
            after: BlockNumber::new(1),
        }));
        assert_eq!(hub.subscriber_count(), 0);
    }
}
