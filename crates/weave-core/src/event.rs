//! Broadcast of [`EngineEvent`]s to observers of chain executions.

use tokio::sync::broadcast;

use crate::types::EngineEvent;

/// Events kept per subscriber before it starts to lag.
const DEFAULT_CAPACITY: usize = 256;

/// Fan-out of engine events.
///
/// One bus may be shared by several engines; every event carries the
/// `execution_id` of the chain run it belongs to. Publishing never waits: a
/// subscriber that falls more than `capacity` events behind loses the oldest
/// ones and sees `RecvError::Lagged` instead of stalling a chain.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Events published while nobody is subscribed are dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skipped(index: usize) -> EngineEvent {
        EngineEvent::StepSkipped {
            execution_id: "e1".into(),
            index,
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(skipped(0));
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(EngineEvent::ChainCompleted {
            execution_id: "e1".into(),
            success: true,
            elapsed_ms: 3,
        });

        match rx.recv().await.unwrap() {
            EngineEvent::ChainCompleted { success, .. } => assert!(success),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe();
        bus.publish(skipped(0));
        bus.publish(skipped(1));

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        match rx.recv().await.unwrap() {
            EngineEvent::StepSkipped { index, .. } => assert_eq!(index, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
