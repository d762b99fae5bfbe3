//! Periodic cluster health loop
//!
//! Probes every RUNNING or DEGRADED cluster's node supervisors on an
//! interval: refreshes per-node health and lag, detects automatic
//! failovers, and drives the RUNNING ↔ DEGRADED transitions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::InfraStatus;

use super::PgClusterController;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Start the health loop. Runs until the lifetime token cancels.
pub fn spawn_health_loop(
    controller: Arc<PgClusterController>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("cluster health loop started");
        let mut interval = tokio::time::interval(PROBE_INTERVAL);
        interval.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("cluster health loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    run_probe_round(&controller).await;
                }
            }
        }
    })
}

async fn run_probe_round(controller: &PgClusterController) {
    let clusters = match controller.db.clusters().list_active().await {
        Ok(rows) => rows,
        Err(e) => {
            warn!("health loop listing failed: {}", e);
            return;
        }
    };

    for cluster in clusters {
        if let Err(e) = probe_cluster(controller, &cluster.id).await {
            warn!(cluster = %cluster.id, "health probe failed: {}", e);
        }
    }
}

/// One probe round for one cluster.
pub async fn probe_cluster(
    controller: &PgClusterController,
    cluster_id: &str,
) -> crate::resource::ControllerResult<()> {
    let cluster = controller.db.clusters().require(cluster_id).await?;

    let mut any_unhealthy = false;
    for node in controller.db.clusters().nodes(cluster_id).await? {
        let health = controller.supervisor.health(node.supervisor_port).await;

        let (healthy, lag) = match health {
            Ok(h) if h.is_running() => (true, h.lag_bytes),
            Ok(_) => (false, node.replication_lag_bytes),
            Err(e) => {
                debug!(node = %node.name, "supervisor unreachable: {}", e);
                (false, node.replication_lag_bytes)
            }
        };

        if !healthy {
            any_unhealthy = true;
        }

        controller
            .db
            .clusters()
            .update_node_health(&node.id, healthy, lag)
            .await?;
    }

    // A primary that stopped answering may mean the agents elected a
    // new one; reconcile the recorded roles
    controller.observe_possible_failover(&cluster).await?;

    let next = if any_unhealthy {
        InfraStatus::Degraded
    } else {
        InfraStatus::Running
    };

    if next != cluster.status {
        info!(
            cluster = %cluster_id,
            from = %cluster.status,
            to = %next,
            "cluster health transition"
        );
        controller.db.clusters().update_status(cluster_id, next).await?;
        controller
            .db
            .infrastructure()
            .update_status(&cluster.infrastructure_id, next)
            .await?;
    }

    Ok(())
}
