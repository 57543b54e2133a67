use tokio::sync::broadcast;

use crate::types::EngineEvent;

/// Events buffered per subscriber before a slow one starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fan-out of [`EngineEvent`]s to the execution logger and to whoever
/// flushes metric points to storage.
///
/// Publishing never blocks a worker. A subscriber that falls more than the
/// channel capacity behind sees `RecvError::Lagged` and skips ahead.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers the event was delivered to; zero when
    /// nobody is listening.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Only events published after this call are received.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
