//! Event consumer
//!
//! Single consumer group over the durable log's committed stream. Maps
//! each event to a cache-invalidation effect on the relevant read
//! models. All effects are idempotent: replaying a partition after a
//! restart converges to the same cache state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::Cache;

use super::{EventAction, EventKind, InfrastructureEvent};

pub struct EventConsumer {
    cache: Arc<Cache>,
}

impl EventConsumer {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    /// Start consuming committed events until shutdown.
    pub fn spawn(
        self,
        mut committed_rx: mpsc::Receiver<InfrastructureEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("event consumer started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = committed_rx.recv() => match event {
                        Some(event) => self.apply(&event).await,
                        None => break,
                    },
                }
            }
            info!("event consumer stopped");
        })
    }

    /// Invalidate the read models the event makes stale.
    pub async fn apply(&self, event: &InfrastructureEvent) {
        let keys = Self::invalidation_keys(event);
        if keys.is_empty() {
            return;
        }

        debug!(
            instance = %event.instance_id,
            action = %event.action,
            count = keys.len(),
            "invalidating read models"
        );
        self.cache.invalidate_many(&keys).await;
    }

    fn invalidation_keys(event: &InfrastructureEvent) -> Vec<String> {
        let id = &event.instance_id;
        let mut keys = vec![format!("infra:{}", id)];

        match event.kind {
            EventKind::PostgresCluster => {
                // Cluster read models are keyed by the cluster id the
                // publisher recorded, not the infrastructure id
                let cluster_id = event
                    .metadata
                    .get("cluster_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(id);
                keys.push(format!("cluster:{}", cluster_id));
                keys.push(format!("cluster:{}:endpoints", cluster_id));
                keys.push(format!("cluster:{}:replication", cluster_id));
            }
            EventKind::NginxGateway | EventKind::DockerService | EventKind::Stack => {}
        }

        match event.action {
            EventAction::StackCreated | EventAction::StackDeleted => {
                keys.push(format!("stack:{}", id));
                keys.push(format!("stacks:{}", event.owner_id));
            }
            _ => {
                // Resource-level events stale the owning stack's read
                // model when the publisher recorded it
                if let Some(stack_id) = event.metadata.get("stack_id").and_then(|v| v.as_str()) {
                    keys.push(format!("stack:{}", stack_id));
                }
                keys.push(format!("stacks:{}", event.owner_id));
            }
        }

        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, action: EventAction) -> InfrastructureEvent {
        InfrastructureEvent::new("i-1", "u-1", kind, action)
    }

    #[test]
    fn test_cluster_events_touch_cluster_models() {
        let keys = EventConsumer::invalidation_keys(&event(
            EventKind::PostgresCluster,
            EventAction::ClusterFailover,
        ));

        assert!(keys.contains(&"cluster:i-1".to_string()));
        assert!(keys.contains(&"cluster:i-1:endpoints".to_string()));
        assert!(keys.contains(&"cluster:i-1:replication".to_string()));
    }

    #[test]
    fn test_resource_event_with_stack_metadata_invalidates_stack() {
        let event = event(EventKind::DockerService, EventAction::ResourceCreated)
            .with_metadata(serde_json::json!({ "stack_id": "s-7" }));

        let keys = EventConsumer::invalidation_keys(&event);
        assert!(keys.contains(&"stack:s-7".to_string()));
        assert!(keys.contains(&"infra:i-1".to_string()));
    }

    #[test]
    fn test_idempotent_key_derivation() {
        let e = event(EventKind::PostgresCluster, EventAction::Die);
        assert_eq!(
            EventConsumer::invalidation_keys(&e),
            EventConsumer::invalidation_keys(&e)
        );
    }
}
