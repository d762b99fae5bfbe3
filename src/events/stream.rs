//! Live stream hub
//!
//! Fans status updates out to connected clients. Each client owns a
//! bounded queue: on overflow the oldest update is dropped, never the
//! newest, and the client is expected to reconcile with a full read on
//! reconnect. Registration is cleaned up when the transport reports a
//! write error or close.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::StatusUpdate;

struct ClientQueue {
    queue: Arc<Mutex<VecDeque<StatusUpdate>>>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
}

/// Hub holding every connected live stream client.
pub struct LiveStreamHub {
    clients: DashMap<u64, ClientQueue>,
    next_id: AtomicU64,
    depth: usize,
}

impl LiveStreamHub {
    pub fn new(depth: usize) -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
            depth: depth.max(1),
        }
    }

    /// Register a new client and hand back its receive handle.
    pub fn register(self: &Arc<Self>) -> LiveStreamClient {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(self.depth)));
        let notify = Arc::new(Notify::new());
        let dropped = Arc::new(AtomicU64::new(0));

        self.clients.insert(
            id,
            ClientQueue {
                queue: queue.clone(),
                notify: notify.clone(),
                dropped: dropped.clone(),
            },
        );

        info!(client = id, total = self.clients.len(), "live stream client connected");

        LiveStreamClient {
            id,
            hub: self.clone(),
            queue,
            notify,
            dropped,
        }
    }

    /// Remove a client registration.
    pub fn disconnect(&self, id: u64) {
        if self.clients.remove(&id).is_some() {
            debug!(client = id, "live stream client disconnected");
        }
    }

    /// Push an update to every connected client, dropping each client's
    /// oldest queued update when its queue is full.
    pub fn broadcast(&self, update: StatusUpdate) {
        for entry in self.clients.iter() {
            let client = entry.value();
            {
                let mut queue = client.queue.lock();
                if queue.len() >= self.depth {
                    queue.pop_front();
                    client.dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(update.clone());
            }
            client.notify.notify_one();
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

/// Receive handle held by one websocket connection.
pub struct LiveStreamClient {
    id: u64,
    hub: Arc<LiveStreamHub>,
    queue: Arc<Mutex<VecDeque<StatusUpdate>>>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
}

impl LiveStreamClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of updates this client lost to overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait for the next queued update.
    pub async fn recv(&self) -> StatusUpdate {
        loop {
            if let Some(update) = self.queue.lock().pop_front() {
                return update;
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop, for drain-style writers.
    pub fn try_recv(&self) -> Option<StatusUpdate> {
        self.queue.lock().pop_front()
    }

    /// Unregister from the hub.
    pub fn disconnect(self) {
        self.hub.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventAction;
    use chrono::Utc;

    fn update(n: u32) -> StatusUpdate {
        StatusUpdate {
            infrastructure_id: format!("infra-{}", n),
            container_id: None,
            status: "running".to_string(),
            action: EventAction::Start,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let hub = Arc::new(LiveStreamHub::new(256));
        let a = hub.register();
        let b = hub.register();

        hub.broadcast(update(1));

        assert_eq!(a.recv().await.infrastructure_id, "infra-1");
        assert_eq!(b.recv().await.infrastructure_id, "infra-1");
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_not_newest() {
        let hub = Arc::new(LiveStreamHub::new(256));
        let client = hub.register();

        for n in 0..257 {
            hub.broadcast(update(n));
        }

        // infra-0 was the oldest and must be gone; the queue starts at
        // infra-1 and ends with the newest
        let first = client.recv().await;
        assert_eq!(first.infrastructure_id, "infra-1");
        assert_eq!(client.dropped(), 1);

        let mut last = first;
        while let Some(update) = client.try_recv() {
            last = update;
        }
        assert_eq!(last.infrastructure_id, "infra-256");
    }

    #[tokio::test]
    async fn test_disconnect_cleans_registration() {
        let hub = Arc::new(LiveStreamHub::new(16));
        let client = hub.register();
        assert_eq!(hub.client_count(), 1);

        client.disconnect();
        assert_eq!(hub.client_count(), 0);

        // Broadcasting to an empty hub is a no-op
        hub.broadcast(update(1));
    }

    #[tokio::test]
    async fn test_slow_client_does_not_affect_others() {
        let hub = Arc::new(LiveStreamHub::new(2));
        let slow = hub.register();
        let fast = hub.register();

        for n in 0..10 {
            hub.broadcast(update(n));
        }

        // Fast client drains everything it still has
        let mut fast_seen = 0;
        while fast.try_recv().is_some() {
            fast_seen += 1;
        }
        assert_eq!(fast_seen, 2);

        // Slow client retains only the newest two as well
        assert_eq!(slow.recv().await.infrastructure_id, "infra-8");
        assert_eq!(slow.recv().await.infrastructure_id, "infra-9");
    }
}
