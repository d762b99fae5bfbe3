//! Switchover and failover handling
//!
//! Manual promotion goes through the current primary's supervisor and
//! is recorded with reason `manual`. Automatic failovers happen between
//! the agents and the DCS without this process; the health loop detects
//! the resulting role change and records it with reason `automatic`.

use chrono::Utc;
use tracing::{info, warn};

use crate::events::{EventAction, InfrastructureEvent};
use crate::resource::{ControllerError, ControllerResult, ResourceKind};
use crate::store::{ClusterNodeRow, FailoverEventRow, FailoverReason, NodeRole, PgClusterRow};

use super::PgClusterController;

impl PgClusterController {
    /// Manual switchover to a named replica.
    pub async fn promote_replica(
        &self,
        cluster_id: &str,
        candidate_node_id: &str,
        triggered_by: &str,
    ) -> ControllerResult<()> {
        let lock = self.lock_for(cluster_id);
        let _guard = lock.lock().await;

        let cluster = self.db.clusters().require(cluster_id).await?;
        let candidate = self.db.clusters().require_node(candidate_node_id).await?;

        if candidate.cluster_id != cluster_id {
            return Err(ControllerError::Validation(format!(
                "node {} does not belong to cluster {}",
                candidate_node_id, cluster_id
            )));
        }
        if candidate.role == NodeRole::Primary {
            return Err(ControllerError::Validation(
                "candidate is already the primary".to_string(),
            ));
        }
        if !candidate.is_healthy {
            return Err(ControllerError::Validation(format!(
                "candidate {} is unhealthy",
                candidate.name
            )));
        }

        let primary = self.primary_node(cluster_id).await?;

        self.supervisor
            .switchover(primary.supervisor_port, &primary.name, &candidate.name)
            .await?;

        self.record_role_change(
            &cluster,
            Some(&primary),
            &candidate,
            FailoverReason::Manual,
            Some(triggered_by),
        )
        .await?;

        info!(
            cluster = %cluster_id,
            old = %primary.name,
            new = %candidate.name,
            "manual switchover complete"
        );
        Ok(())
    }

    /// Switch the primary role to the most caught-up healthy replica.
    ///
    /// Used before stopping or removing the current primary. With no
    /// eligible replica the caller decides (reject, or force).
    pub(crate) async fn switchover_to_best(
        &self,
        cluster: &PgClusterRow,
        triggered_by: Option<&str>,
    ) -> ControllerResult<ClusterNodeRow> {
        let nodes = self.db.clusters().nodes(&cluster.id).await?;
        let primary = nodes
            .iter()
            .find(|n| n.role == NodeRole::Primary)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(format!("primary of {}", cluster.id)))?;

        // Lowest replication lag wins
        let best = nodes
            .into_iter()
            .filter(|n| n.role == NodeRole::Replica && n.is_healthy)
            .min_by_key(|n| n.replication_lag_bytes)
            .ok_or_else(|| {
                ControllerError::Validation("no healthy replica eligible for promotion".to_string())
            })?;

        self.supervisor
            .switchover(primary.supervisor_port, &primary.name, &best.name)
            .await?;

        self.record_role_change(
            cluster,
            Some(&primary),
            &best,
            FailoverReason::Manual,
            triggered_by,
        )
        .await?;

        Ok(best)
    }

    /// Record an observed or commanded role change: node roles, the
    /// cluster's primary pointer, the history row, and the event.
    pub(crate) async fn record_role_change(
        &self,
        cluster: &PgClusterRow,
        old_primary: Option<&ClusterNodeRow>,
        new_primary: &ClusterNodeRow,
        reason: FailoverReason,
        triggered_by: Option<&str>,
    ) -> ControllerResult<()> {
        if let Some(old) = old_primary {
            self.db
                .clusters()
                .update_node_role(&old.id, NodeRole::Replica)
                .await?;
        }
        self.db
            .clusters()
            .update_node_role(&new_primary.id, NodeRole::Primary)
            .await?;
        self.db
            .clusters()
            .set_primary(&cluster.id, Some(&new_primary.id))
            .await?;

        self.db
            .clusters()
            .insert_failover(&FailoverEventRow {
                cluster_id: cluster.id.clone(),
                old_primary: old_primary.map(|n| n.id.clone()),
                new_primary: new_primary.id.clone(),
                reason,
                triggered_by: triggered_by.map(|s| s.to_string()),
                occurred_at: Utc::now(),
            })
            .await?;

        // The primary container binding on the infrastructure row
        // follows the role
        self.db
            .infrastructure()
            .set_container(
                &cluster.infrastructure_id,
                Some(&new_primary.container_id),
            )
            .await?;

        let owner = self
            .db
            .infrastructure()
            .get(&cluster.infrastructure_id)
            .await?
            .map(|row| row.owner_id)
            .unwrap_or_default();

        self.bus.publish(
            InfrastructureEvent::new(
                &cluster.infrastructure_id,
                owner,
                ResourceKind::PostgresCluster,
                EventAction::ClusterFailover,
            )
            .with_metadata(serde_json::json!({
                "cluster_id": cluster.id,
                "old_primary": old_primary.map(|n| n.id.clone()),
                "new_primary": new_primary.id,
                "reason": reason.as_str(),
            })),
        );

        Ok(())
    }

    /// Called by the health loop when the recorded primary no longer
    /// reports the master role. If another node claims it, record an
    /// automatic failover; otherwise leave state alone and let the next
    /// probe round decide.
    pub(crate) async fn observe_possible_failover(
        &self,
        cluster: &PgClusterRow,
    ) -> ControllerResult<bool> {
        let nodes = self.db.clusters().nodes(&cluster.id).await?;

        let recorded_primary = nodes.iter().find(|n| n.role == NodeRole::Primary).cloned();

        // Ask every node's supervisor who it thinks it is
        let mut actual_primary = None;
        for node in &nodes {
            if self.supervisor.is_primary(node.supervisor_port).await {
                actual_primary = Some(node.clone());
                break;
            }
        }

        match (recorded_primary, actual_primary) {
            (Some(recorded), Some(actual)) if recorded.id != actual.id => {
                warn!(
                    cluster = %cluster.id,
                    old = %recorded.name,
                    new = %actual.name,
                    "detected automatic failover"
                );
                self.record_role_change(
                    cluster,
                    Some(&recorded),
                    &actual,
                    FailoverReason::Automatic,
                    None,
                )
                .await?;
                Ok(true)
            }
            (None, Some(actual)) => {
                self.record_role_change(
                    cluster,
                    None,
                    &actual,
                    FailoverReason::Automatic,
                    None,
                )
                .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Failover history, newest first
    pub async fn failover_history(
        &self,
        cluster_id: &str,
    ) -> ControllerResult<Vec<FailoverEventRow>> {
        Ok(self.db.clusters().failover_history(cluster_id).await?)
    }
}
