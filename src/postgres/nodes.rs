//! Scale, add-node and remove-node operations

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::{EventAction, InfrastructureEvent};
use crate::resource::{ControllerError, ControllerResult, ResourceKind};
use crate::store::{ClusterNodeRow, NodeRole};

use super::bootstrap::{self, NodeLaunch};
use super::haproxy;
use super::PgClusterController;

const REPLICA_READY_ATTEMPTS: u32 = 60;

impl PgClusterController {
    /// Bring the cluster to `target` nodes by adding or removing
    /// replicas. Matching the current count is a no-op success.
    pub async fn scale(
        &self,
        ctx: CancellationToken,
        cluster_id: &str,
        target: u32,
    ) -> ControllerResult<()> {
        if target == 0 || target > 8 {
            return Err(ControllerError::Validation(
                "target node count must be between 1 and 8".to_string(),
            ));
        }

        loop {
            let current = self.db.clusters().nodes(cluster_id).await?.len() as u32;
            if current == target {
                return Ok(());
            }

            if current < target {
                self.add_node(ctx.clone(), cluster_id).await?;
            } else {
                // Remove the highest-index replica
                let nodes = self.db.clusters().nodes(cluster_id).await?;
                let victim = nodes
                    .into_iter()
                    .filter(|n| n.role == NodeRole::Replica)
                    .max_by_key(|n| node_index(&n.name))
                    .ok_or_else(|| {
                        ControllerError::Validation(
                            "cannot scale below one node: only the primary remains".to_string(),
                        )
                    })?;
                self.remove_node(cluster_id, &victim.id, false).await?;
            }
        }
    }

    /// Add one replica to a running cluster.
    pub async fn add_node(
        &self,
        ctx: CancellationToken,
        cluster_id: &str,
    ) -> ControllerResult<ClusterNodeRow> {
        let lock = self.lock_for(cluster_id);
        let _guard = lock.lock().await;

        let cluster = self.db.clusters().require(cluster_id).await?;
        let nodes = self.db.clusters().nodes(cluster_id).await?;

        let next_index = nodes
            .iter()
            .map(|n| node_index(&n.name))
            .max()
            .map(|i| i + 1)
            .unwrap_or(0);

        let node = bootstrap::launch_node(
            self,
            NodeLaunch {
                cluster_id,
                infra_id: &cluster.infrastructure_id,
                scope: &cluster.scope,
                network: &cluster.network_id,
                index: next_index,
                is_leader: false,
                version: &cluster.version,
                replication_mode: cluster.replication_mode,
                postgres_password: &cluster.postgres_password,
                replicator_password: &cluster.replicator_password,
                dcs_endpoints: &cluster.dcs_endpoints,
            },
        )
        .await?;

        if let Err(e) = bootstrap::wait_for_role(
            self,
            &ctx,
            node.supervisor_port,
            NodeRole::Replica,
            REPLICA_READY_ATTEMPTS,
        )
        .await
        {
            // Replica never joined; undo the launch
            self.remove_container_tolerant(&node.container_id).await;
            let _ = self.runtime.remove_volume(&node.volume_id, true).await;
            return Err(e);
        }

        self.db.clusters().insert_node(&node).await?;
        self.db
            .clusters()
            .set_node_count(cluster_id, nodes.len() as u32 + 1)
            .await?;

        haproxy::refresh(self, cluster_id).await?;

        let owner = self.owner_of(&cluster.infrastructure_id).await;
        self.bus.publish(
            InfrastructureEvent::new(
                &cluster.infrastructure_id,
                owner,
                ResourceKind::PostgresCluster,
                EventAction::NodeAdded,
            )
            .with_metadata(serde_json::json!({
                "cluster_id": cluster_id,
                "node_id": node.id,
                "node_name": node.name,
            })),
        );

        info!(cluster = %cluster_id, node = %node.name, "replica added");
        Ok(node)
    }

    /// Remove a node. Removing the primary switches the role over to
    /// the most caught-up replica first; with no eligible replica the
    /// call is rejected unless `force`.
    pub async fn remove_node(
        &self,
        cluster_id: &str,
        node_id: &str,
        force: bool,
    ) -> ControllerResult<()> {
        let lock = self.lock_for(cluster_id);
        let _guard = lock.lock().await;

        let cluster = self.db.clusters().require(cluster_id).await?;
        let node = self.db.clusters().require_node(node_id).await?;

        if node.cluster_id != cluster_id {
            return Err(ControllerError::Validation(format!(
                "node {} does not belong to cluster {}",
                node_id, cluster_id
            )));
        }

        if node.role == NodeRole::Primary {
            match self.switchover_to_best(&cluster, None).await {
                Ok(new_primary) => {
                    info!(
                        cluster = %cluster_id,
                        new_primary = %new_primary.name,
                        "switched over before removing old primary"
                    );
                }
                Err(e) if force => {
                    warn!(
                        cluster = %cluster_id,
                        "removing primary without switchover (forced): {}", e
                    );
                    self.db.clusters().set_primary(cluster_id, None).await?;
                }
                Err(e) => return Err(e),
            }
        }

        self.remove_container_tolerant(&node.container_id).await;
        if let Err(e) = self.runtime.remove_volume(&node.volume_id, true).await {
            warn!(node = %node.name, "volume removal failed: {}", e);
        }

        // Drop the replication slot the departed member held on the
        // primary; slot names use underscores
        if let Ok(primary) = self.primary_node(cluster_id).await {
            if primary.id != node.id {
                let slot = node.name.replace('-', "_");
                let sql = format!(
                    "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = '{}'",
                    slot
                );
                if let Err(e) = self
                    .runtime
                    .exec(
                        &primary.container_id,
                        vec![
                            "psql".to_string(),
                            "-U".to_string(),
                            "postgres".to_string(),
                            "-c".to_string(),
                            sql,
                        ],
                    )
                    .await
                {
                    warn!(node = %node.name, "replication slot cleanup failed: {}", e);
                }
            }
        }

        self.db.clusters().delete_node(node_id).await?;
        let remaining = self.db.clusters().nodes(cluster_id).await?.len() as u32;
        self.db
            .clusters()
            .set_node_count(cluster_id, remaining)
            .await?;

        haproxy::refresh(self, cluster_id).await?;

        let owner = self.owner_of(&cluster.infrastructure_id).await;
        self.bus.publish(
            InfrastructureEvent::new(
                &cluster.infrastructure_id,
                owner,
                ResourceKind::PostgresCluster,
                EventAction::NodeRemoved,
            )
            .with_metadata(serde_json::json!({
                "cluster_id": cluster_id,
                "node_id": node_id,
                "node_name": node.name,
                "forced": force,
            })),
        );

        info!(cluster = %cluster_id, node = %node.name, "node removed");
        Ok(())
    }

    /// Stop one node. Stopping the primary first switches the role to
    /// the most caught-up healthy replica; with none eligible the stop
    /// is rejected unless `force`.
    pub async fn stop_node(
        &self,
        cluster_id: &str,
        node_id: &str,
        force: bool,
    ) -> ControllerResult<()> {
        let lock = self.lock_for(cluster_id);
        let _guard = lock.lock().await;

        let cluster = self.db.clusters().require(cluster_id).await?;
        let node = self.db.clusters().require_node(node_id).await?;

        if node.cluster_id != cluster_id {
            return Err(ControllerError::Validation(format!(
                "node {} does not belong to cluster {}",
                node_id, cluster_id
            )));
        }

        if node.role == NodeRole::Primary {
            match self.switchover_to_best(&cluster, None).await {
                Ok(new_primary) => {
                    info!(
                        cluster = %cluster_id,
                        new_primary = %new_primary.name,
                        "switched over before stopping old primary"
                    );
                }
                Err(e) if force => {
                    warn!(
                        cluster = %cluster_id,
                        "stopping primary without switchover (forced): {}", e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.runtime
            .stop_container(&node.container_id, self.provisioning.stop_timeout())
            .await?;
        self.db
            .clusters()
            .update_node_health(node_id, false, node.replication_lag_bytes)
            .await?;

        info!(cluster = %cluster_id, node = %node.name, "node stopped");
        Ok(())
    }

    /// Start a stopped node back up
    pub async fn start_node(&self, cluster_id: &str, node_id: &str) -> ControllerResult<()> {
        let node = self.db.clusters().require_node(node_id).await?;
        if node.cluster_id != cluster_id {
            return Err(ControllerError::Validation(format!(
                "node {} does not belong to cluster {}",
                node_id, cluster_id
            )));
        }
        self.runtime.start_container(&node.container_id).await?;
        Ok(())
    }

    pub(crate) async fn owner_of(&self, infra_id: &str) -> String {
        self.db
            .infrastructure()
            .get(infra_id)
            .await
            .ok()
            .flatten()
            .map(|row| row.owner_id)
            .unwrap_or_default()
    }
}

/// Trailing numeric index of a node name ("pg-web-node-3" -> 3)
fn node_index(name: &str) -> u32 {
    name.rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_index_parsing() {
        assert_eq!(node_index("pg-web-node-0"), 0);
        assert_eq!(node_index("pg-web-node-12"), 12);
        assert_eq!(node_index("weird"), 0);
    }
}
