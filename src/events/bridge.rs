//! Runtime event bridge
//!
//! Subscribes to the container engine's event stream, resolves
//! container ids to the owning infrastructure record, and republishes
//! lifecycle events onto the bus. The bridge is the only component
//! besides a resource's own controller allowed to touch its status, and
//! it touches status only.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::runtime::{ContainerRuntime, RuntimeEvent};
use crate::store::{ContainerBinding, Database, InfraStatus};

use super::{EventAction, EventBus, InfrastructureEvent};

/// Delay before reconnecting after the engine stream drops
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct RuntimeEventBridge {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<Database>,
    bus: EventBus,
}

impl RuntimeEventBridge {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, db: Arc<Database>, bus: EventBus) -> Self {
        Self { runtime, db, bus }
    }

    /// Run until shutdown, reconnecting on stream errors.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("runtime event bridge started");

            loop {
                let mut stream = self.runtime.events();

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("runtime event bridge stopped");
                            return;
                        }
                        item = stream.next() => match item {
                            Some(Ok(event)) => self.handle(event).await,
                            Some(Err(e)) => {
                                warn!("engine event stream error: {}", e);
                                break;
                            }
                            None => {
                                warn!("engine event stream ended");
                                break;
                            }
                        },
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {
                        debug!("reconnecting engine event stream");
                    }
                }
            }
        })
    }

    async fn handle(&self, event: RuntimeEvent) {
        let Some(action) = map_action(&event.action) else {
            return;
        };

        let binding = match self.db.resolve_container(&event.container_id).await {
            Ok(Some(binding)) => binding,
            Ok(None) => {
                // Not one of ours
                return;
            }
            Err(e) => {
                warn!(
                    container = %event.container_id,
                    "failed to resolve container binding: {}", e
                );
                return;
            }
        };

        self.apply_status(&binding, action).await;

        let mut metadata = serde_json::json!({
            "container_id": event.container_id,
        });
        if let Some(cluster_id) = &binding.cluster_id {
            metadata["cluster_id"] = serde_json::Value::String(cluster_id.clone());
        }
        if action == EventAction::HealthStatus {
            // Docker reports "health_status: healthy" / ": unhealthy"
            let healthy = event.action.contains("healthy") && !event.action.contains("unhealthy");
            metadata["healthy"] = serde_json::Value::Bool(healthy);
        }

        self.bus.publish(
            InfrastructureEvent::new(&binding.instance_id, &binding.owner_id, binding.kind, action)
                .with_metadata(metadata),
        );
    }

    /// Status-only mutation: crash-stops and out-of-band starts are
    /// reflected; everything else belongs to the owning controller.
    async fn apply_status(&self, binding: &ContainerBinding, action: EventAction) {
        let transition = match action {
            EventAction::Die => Some((InfraStatus::Running, InfraStatus::Stopped)),
            EventAction::Start => Some((InfraStatus::Stopped, InfraStatus::Running)),
            _ => None,
        };

        let Some((expected, next)) = transition else {
            return;
        };

        match self
            .db
            .infrastructure_status_cas(&binding.instance_id, expected, next)
            .await
        {
            Ok(changed) => {
                if changed {
                    debug!(
                        instance = %binding.instance_id,
                        from = %expected,
                        to = %next,
                        "bridge applied status transition"
                    );
                }
            }
            Err(e) => warn!(
                instance = %binding.instance_id,
                "failed to apply status transition: {}", e
            ),
        }
    }
}

fn map_action(engine_action: &str) -> Option<EventAction> {
    if engine_action.starts_with("health_status") {
        return Some(EventAction::HealthStatus);
    }
    match engine_action {
        "start" => Some(EventAction::Start),
        "die" => Some(EventAction::Die),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceKind;
    use crate::runtime::fake::FakeRuntime;

    #[test]
    fn test_action_mapping() {
        assert_eq!(map_action("start"), Some(EventAction::Start));
        assert_eq!(map_action("die"), Some(EventAction::Die));
        assert_eq!(
            map_action("health_status: healthy"),
            Some(EventAction::HealthStatus)
        );
        assert_eq!(map_action("exec_create"), None);
        assert_eq!(map_action("attach"), None);
    }

    #[tokio::test]
    async fn test_bridge_republishes_bound_container_events() {
        let runtime = Arc::new(FakeRuntime::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        db.infrastructure()
            .insert_for_tests("infra-1", "owner-1", ResourceKind::DockerService, "cont-1")
            .await
            .unwrap();

        let bridge =
            RuntimeEventBridge::new(runtime.clone(), db.clone(), bus.clone());
        let shutdown = CancellationToken::new();
        let handle = bridge.spawn(shutdown.clone());

        // Give the bridge a moment to subscribe before emitting
        tokio::time::sleep(Duration::from_millis(20)).await;

        runtime.emit_event(RuntimeEvent {
            container_id: "cont-1".to_string(),
            action: "die".to_string(),
            attributes: Default::default(),
            timestamp: 1,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.instance_id, "infra-1");
        assert_eq!(event.action, EventAction::Die);

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_unbound_containers_are_ignored() {
        let runtime = Arc::new(FakeRuntime::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let bridge = RuntimeEventBridge::new(runtime.clone(), db, bus.clone());
        let shutdown = CancellationToken::new();
        let handle = bridge.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        runtime.emit_event(RuntimeEvent {
            container_id: "someone-elses".to_string(),
            action: "die".to_string(),
            attributes: Default::default(),
            timestamp: 1,
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        shutdown.cancel();
        let _ = handle.await;
    }
}
