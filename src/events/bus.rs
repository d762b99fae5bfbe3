//! Event bus for pub/sub messaging
//!
//! Single in-process bus. Publishing broadcasts to in-process
//! subscribers (the bridge tests, the consumer plumbing) and fans out
//! to the durable sink and the live stream hub when attached. The
//! durable path is a bounded queue: when it is full the event is
//! dropped and logged rather than blocking the publisher.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{InfrastructureEvent, LiveStreamHub, StatusUpdate};

/// Event bus broadcasting [`InfrastructureEvent`]s to subscribers and
/// fanning out to the durable and live paths.
pub struct EventBus {
    sender: broadcast::Sender<InfrastructureEvent>,
    // Keep a receiver to prevent the channel from closing
    _receiver: broadcast::Receiver<InfrastructureEvent>,

    /// Durable path; bounded, drop-on-full
    durable_tx: RwLock<Option<mpsc::Sender<InfrastructureEvent>>>,

    /// Live push path; best-effort
    hub: RwLock<Option<Arc<LiveStreamHub>>>,
}

impl EventBus {
    /// Create a new event bus with default capacity (1024 events)
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new event bus with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self {
            sender,
            _receiver,
            durable_tx: RwLock::new(None),
            hub: RwLock::new(None),
        }
    }

    /// Attach the durable sink's intake queue
    pub fn attach_durable(&self, tx: mpsc::Sender<InfrastructureEvent>) {
        *self.durable_tx.write() = Some(tx);
    }

    /// Attach the live stream hub
    pub fn attach_live(&self, hub: Arc<LiveStreamHub>) {
        *self.hub.write() = Some(hub);
    }

    /// Subscribe to the event bus.
    ///
    /// Returns a receiver that will receive all events published after
    /// subscribing. A subscriber that falls behind sees `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<InfrastructureEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers and both fan-out sinks.
    ///
    /// Never blocks: the durable queue is `try_send` and the live hub
    /// drops on overflow internally.
    pub fn publish(&self, event: InfrastructureEvent) {
        debug!(
            instance = %event.instance_id,
            action = %event.action,
            "publishing event"
        );

        if let Some(tx) = self.durable_tx.read().as_ref() {
            if let Err(e) = tx.try_send(event.clone()) {
                warn!(
                    instance = %event.instance_id,
                    action = %event.action,
                    "durable queue full, dropping event: {}", e
                );
            }
        }

        if let Some(hub) = self.hub.read().as_ref() {
            hub.broadcast(StatusUpdate::from(&event));
        }

        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
            durable_tx: RwLock::new(self.durable_tx.read().clone()),
            hub: RwLock::new(self.hub.read().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventAction;
    use crate::resource::ResourceKind;

    fn event(instance: &str, action: EventAction) -> InfrastructureEvent {
        InfrastructureEvent::new(instance, "owner", ResourceKind::DockerService, action)
    }

    #[tokio::test]
    async fn test_pubsub() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(event("i-1", EventAction::ResourceCreated));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.instance_id, "i-1");
        assert_eq!(received.action, EventAction::ResourceCreated);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_same_order() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(event("i-1", EventAction::StopRequested));
        bus.publish(event("i-1", EventAction::Die));

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap().action, EventAction::StopRequested);
            assert_eq!(rx.recv().await.unwrap().action, EventAction::Die);
        }
    }

    #[tokio::test]
    async fn test_full_durable_queue_drops_without_blocking() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::channel(1);
        bus.attach_durable(tx);

        bus.publish(event("i-1", EventAction::Start));
        // Queue of 1 is now full; this publish must not block
        bus.publish(event("i-1", EventAction::Die));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.action, EventAction::Start);
        assert!(rx.try_recv().is_err());
    }
}
