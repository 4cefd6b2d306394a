//! Domain event bus.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::DigestionEvent;

/// Default channel capacity
pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("Event bus closed")]
    Closed,
}

/// Publishes `digestion.completed` / `digestion.failed` events
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: DigestionEvent) -> Result<(), EventBusError>;
}

/// In-process bus on a broadcast channel. Publishing with no subscribers
/// is not an error.
#[derive(Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<DigestionEvent>,
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DigestionEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: DigestionEvent) -> Result<(), EventBusError> {
        debug!(topic = event.topic(), capture_id = event.capture_id(), "Publishing event");
        // send only errors when there are no receivers
        let _ = self.tx.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = BroadcastEventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(DigestionEvent::Failed {
            capture_id: "cap-1".to_string(),
            user_id: "user-1".to_string(),
            category: "extraction_failed".to_string(),
            message: "Nothing to digest".to_string(),
            retry_count: 0,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic(), "digestion.failed");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = BroadcastEventBus::new(4);
        let result = bus
            .publish(DigestionEvent::Failed {
                capture_id: "cap-1".to_string(),
                user_id: "user-1".to_string(),
                category: "cancelled".to_string(),
                message: "Cancelled".to_string(),
                retry_count: 0,
                timestamp: Utc::now(),
            })
            .await;
        assert!(result.is_ok());
    }
}
