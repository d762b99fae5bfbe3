//! PostgreSQL HA cluster controller
//!
//! Bootstraps and operates highly-available PostgreSQL clusters: an
//! etcd quorum for leader election, supervisor-managed postgres nodes
//! (one primary plus replicas), and an HAProxy front with role-probing
//! health checks. Failover is coordinated through each node's
//! supervisor agent; this controller records the outcome and keeps the
//! read models honest.

mod bootstrap;
mod dcs;
mod failover;
mod haproxy;
mod health;
mod nodes;
mod query;
mod supervisor;

pub use health::spawn_health_loop;
pub use query::{
    QueryResult, ReplicaSyncStatus, ReplicaTestResult, ReplicationStatus, ReplicationTestReport,
};
pub use supervisor::{SupervisorClient, SupervisorHealth};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{PostgresConfiguration, ProvisioningConfiguration};
use crate::events::EventBus;
use crate::resource::{
    ControllerError, ControllerResult, CreateOutcome, CreateRequest, ResourceController,
    ResourceKind,
};
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::store::{ClusterNodeRow, Database, InfraStatus, NodeRole, PgClusterRow, ReplicationMode};

/// Cluster create request spec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default = "default_node_count")]
    pub node_count: u32,

    #[serde(default = "default_replication_mode")]
    pub replication_mode: ReplicationMode,

    /// Superuser password (required)
    pub password: String,

    /// Replication role password; generated when omitted
    #[serde(default)]
    pub replicator_password: Option<String>,

    /// DCS quorum size: 1 for dev, 3+ for HA
    #[serde(default = "default_etcd_count")]
    pub etcd_count: u32,

    /// Cluster scope name; derived from the declared name when omitted
    #[serde(default)]
    pub scope: Option<String>,

    /// Fixed HAProxy host ports; allocated when omitted
    #[serde(default)]
    pub primary_port: Option<u16>,

    #[serde(default)]
    pub replica_port: Option<u16>,
}

fn default_version() -> String {
    "17".to_string()
}

fn default_node_count() -> u32 {
    1
}

fn default_replication_mode() -> ReplicationMode {
    ReplicationMode::Async
}

fn default_etcd_count() -> u32 {
    1
}

/// Read model for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub container_id: String,
    pub role: NodeRole,
    pub port: u16,
    pub replication_lag_bytes: i64,
    pub is_healthy: bool,
}

impl From<&ClusterNodeRow> for NodeInfo {
    fn from(row: &ClusterNodeRow) -> Self {
        Self {
            id: row.id.clone(),
            name: row.name.clone(),
            container_id: row.container_id.clone(),
            role: row.role,
            port: row.port,
            replication_lag_bytes: row.replication_lag_bytes,
            is_healthy: row.is_healthy,
        }
    }
}

/// Connection endpoints exposed to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEndpoints {
    /// Read-write endpoint routed to the current primary
    pub primary: String,

    /// Round-robin endpoint over healthy replicas; absent on
    /// single-node clusters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replica: Option<String>,
}

/// Full cluster read model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub id: String,
    pub infrastructure_id: String,
    pub scope: String,
    pub version: String,
    pub node_count: u32,
    pub replication_mode: ReplicationMode,
    pub status: InfraStatus,

    /// False for a single-member DCS: functional but not HA
    pub ha: bool,

    pub primary_node_id: Option<String>,
    pub nodes: Vec<NodeInfo>,
    pub endpoints: ClusterEndpoints,
}

pub struct PgClusterController {
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) db: Arc<Database>,
    pub(crate) bus: EventBus,
    pub(crate) config: PostgresConfiguration,
    pub(crate) provisioning: ProvisioningConfiguration,
    pub(crate) data_dir: PathBuf,
    pub(crate) supervisor: SupervisorClient,

    /// Per-cluster operation locks
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl PgClusterController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<Database>,
        bus: EventBus,
        config: PostgresConfiguration,
        provisioning: ProvisioningConfiguration,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            runtime,
            db,
            bus,
            config,
            provisioning,
            data_dir,
            supervisor: SupervisorClient::new(),
            locks: DashMap::new(),
        }
    }

    /// Serialize operations against one cluster
    pub(crate) fn lock_for(&self, cluster_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(cluster_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn parse_spec(spec: &serde_json::Value) -> ControllerResult<ClusterSpec> {
        let spec: ClusterSpec = serde_json::from_value(spec.clone())
            .map_err(|e| ControllerError::Validation(format!("invalid cluster spec: {}", e)))?;

        if spec.password.len() < 8 {
            return Err(ControllerError::Validation(
                "cluster password must be at least 8 characters".to_string(),
            ));
        }
        if spec.node_count == 0 || spec.node_count > 8 {
            return Err(ControllerError::Validation(
                "node_count must be between 1 and 8".to_string(),
            ));
        }
        if !matches!(spec.etcd_count, 1 | 3 | 5) {
            return Err(ControllerError::Validation(
                "etcd_count must be 1, 3 or 5".to_string(),
            ));
        }
        if !matches!(spec.version.as_str(), "14" | "15" | "16" | "17") {
            return Err(ControllerError::Validation(format!(
                "unsupported PostgreSQL version '{}'",
                spec.version
            )));
        }

        Ok(spec)
    }

    pub(crate) async fn cluster_by_infra(&self, infra_id: &str) -> ControllerResult<PgClusterRow> {
        self.db
            .clusters()
            .get_by_infrastructure(infra_id)
            .await?
            .ok_or_else(|| ControllerError::NotFound(format!("cluster for {}", infra_id)))
    }

    /// Build the read model for a cluster
    pub async fn cluster_info(&self, cluster: &PgClusterRow) -> ControllerResult<ClusterInfo> {
        let nodes = self.db.clusters().nodes(&cluster.id).await?;
        let node_infos: Vec<NodeInfo> = nodes.iter().map(NodeInfo::from).collect();

        let replica = if nodes.iter().any(|n| n.role == NodeRole::Replica) {
            Some(format!("localhost:{}", cluster.haproxy_replica_port))
        } else {
            None
        };

        Ok(ClusterInfo {
            id: cluster.id.clone(),
            infrastructure_id: cluster.infrastructure_id.clone(),
            scope: cluster.scope.clone(),
            version: cluster.version.clone(),
            node_count: cluster.node_count,
            replication_mode: cluster.replication_mode,
            status: cluster.status,
            ha: cluster.ha,
            primary_node_id: cluster.primary_node_id.clone(),
            nodes: node_infos,
            endpoints: ClusterEndpoints {
                primary: format!("localhost:{}", cluster.haproxy_primary_port),
                replica,
            },
        })
    }

    /// Endpoints read model
    pub async fn endpoints(&self, cluster_id: &str) -> ControllerResult<ClusterEndpoints> {
        let cluster = self.db.clusters().require(cluster_id).await?;
        Ok(self.cluster_info(&cluster).await?.endpoints)
    }

    /// Aggregate recent logs across nodes and the load balancer
    pub async fn cluster_logs(
        &self,
        cluster_id: &str,
        tail: u32,
    ) -> ControllerResult<HashMap<String, Vec<String>>> {
        let cluster = self.db.clusters().require(cluster_id).await?;
        let mut logs = HashMap::new();

        for node in self.db.clusters().nodes(&cluster.id).await? {
            match self.runtime.container_logs(&node.container_id, tail).await {
                Ok(lines) => {
                    logs.insert(node.name.clone(), lines);
                }
                Err(e) => {
                    logs.insert(node.name.clone(), vec![format!("<unavailable: {}>", e)]);
                }
            }
        }

        if let Some(haproxy) = &cluster.haproxy_container_id {
            if let Ok(lines) = self.runtime.container_logs(haproxy, tail).await {
                logs.insert("haproxy".to_string(), lines);
            }
        }

        Ok(logs)
    }

    /// Per-node container stats snapshots
    pub async fn cluster_stats(
        &self,
        cluster_id: &str,
    ) -> ControllerResult<HashMap<String, serde_json::Value>> {
        let cluster = self.db.clusters().require(cluster_id).await?;
        let mut stats = HashMap::new();

        for node in self.db.clusters().nodes(&cluster.id).await? {
            if let Ok(snapshot) = self.runtime.container_stats(&node.container_id).await {
                stats.insert(node.name.clone(), snapshot);
            }
        }
        Ok(stats)
    }

    /// Stop every cluster container (nodes, haproxy, etcd), nodes first
    pub async fn stop_cluster(&self, cluster_id: &str) -> ControllerResult<()> {
        let lock = self.lock_for(cluster_id);
        let _guard = lock.lock().await;

        let cluster = self.db.clusters().require(cluster_id).await?;
        let timeout = self.provisioning.stop_timeout();

        if let Some(haproxy) = &cluster.haproxy_container_id {
            if let Err(e) = self.runtime.stop_container(haproxy, timeout).await {
                warn!(cluster = %cluster_id, "failed to stop haproxy: {}", e);
            }
        }
        for node in self.db.clusters().nodes(cluster_id).await? {
            if let Err(e) = self.runtime.stop_container(&node.container_id, timeout).await {
                warn!(cluster = %cluster_id, node = %node.name, "failed to stop node: {}", e);
            }
        }
        for etcd in self.db.clusters().etcd_nodes(cluster_id).await? {
            if let Err(e) = self.runtime.stop_container(&etcd.container_id, timeout).await {
                warn!(cluster = %cluster_id, etcd = %etcd.name, "failed to stop etcd: {}", e);
            }
        }

        self.db
            .clusters()
            .update_status(cluster_id, InfraStatus::Stopped)
            .await?;
        self.db
            .infrastructure()
            .update_status(&cluster.infrastructure_id, InfraStatus::Stopped)
            .await?;
        Ok(())
    }

    /// Start everything back up: etcd first, wait for quorum, then
    /// nodes, then haproxy.
    pub async fn start_cluster(
        &self,
        ctx: CancellationToken,
        cluster_id: &str,
    ) -> ControllerResult<()> {
        let lock = self.lock_for(cluster_id);
        let _guard = lock.lock().await;

        let cluster = self.db.clusters().require(cluster_id).await?;

        let etcd_nodes = self.db.clusters().etcd_nodes(cluster_id).await?;
        for etcd in &etcd_nodes {
            self.runtime.start_container(&etcd.container_id).await?;
        }
        dcs::wait_for_quorum(&ctx, &etcd_nodes).await?;

        for node in self.db.clusters().nodes(cluster_id).await? {
            self.runtime.start_container(&node.container_id).await?;
        }
        if let Some(haproxy) = &cluster.haproxy_container_id {
            self.runtime.start_container(haproxy).await?;
        }

        self.db
            .clusters()
            .update_status(cluster_id, InfraStatus::Running)
            .await?;
        self.db
            .infrastructure()
            .update_status(&cluster.infrastructure_id, InfraStatus::Running)
            .await?;
        Ok(())
    }

    pub async fn restart_cluster(
        &self,
        ctx: CancellationToken,
        cluster_id: &str,
    ) -> ControllerResult<()> {
        self.stop_cluster(cluster_id).await?;
        self.start_cluster(ctx, cluster_id).await
    }

    /// Tear the cluster down completely: containers, volumes, network,
    /// reserved ports. Missing pieces are skipped, not errors.
    pub async fn delete_cluster(&self, cluster_id: &str) -> ControllerResult<()> {
        let lock = self.lock_for(cluster_id);
        let _guard = lock.lock().await;

        let cluster = self.db.clusters().require(cluster_id).await?;
        self.db
            .clusters()
            .update_status(cluster_id, InfraStatus::Deleting)
            .await?;
        self.db
            .infrastructure()
            .update_status(&cluster.infrastructure_id, InfraStatus::Deleting)
            .await?;

        if let Some(haproxy) = &cluster.haproxy_container_id {
            self.remove_container_tolerant(haproxy).await;
        }

        for node in self.db.clusters().nodes(cluster_id).await? {
            self.remove_container_tolerant(&node.container_id).await;
            if let Err(e) = self.runtime.remove_volume(&node.volume_id, true).await {
                warn!(cluster = %cluster_id, volume = %node.volume_id, "volume removal failed: {}", e);
            }
        }

        for etcd in self.db.clusters().etcd_nodes(cluster_id).await? {
            self.remove_container_tolerant(&etcd.container_id).await;
        }

        if let Err(e) = self.runtime.remove_network(&cluster.network_id).await {
            warn!(cluster = %cluster_id, "network removal failed: {}", e);
        }

        let haproxy_dir = self.data_dir.join("clusters").join(cluster_id);
        if let Err(e) = tokio::fs::remove_dir_all(&haproxy_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(cluster = %cluster_id, "config dir removal failed: {}", e);
            }
        }

        self.db.clusters().delete(cluster_id).await?;
        self.db
            .infrastructure()
            .update_status(&cluster.infrastructure_id, InfraStatus::Deleted)
            .await?;
        self.db
            .infrastructure()
            .release_ports(&cluster.infrastructure_id)
            .await?;

        self.locks.remove(cluster_id);
        Ok(())
    }

    pub(crate) async fn remove_container_tolerant(&self, container_id: &str) {
        match self.runtime.remove_container(container_id, true).await {
            Ok(()) | Err(RuntimeError::ContainerNotFound(_)) => {}
            Err(e) => warn!(container = %container_id, "container removal failed: {}", e),
        }
    }

    /// Current primary node row
    pub(crate) async fn primary_node(&self, cluster_id: &str) -> ControllerResult<ClusterNodeRow> {
        let nodes = self.db.clusters().nodes(cluster_id).await?;
        nodes
            .into_iter()
            .find(|n| n.role == NodeRole::Primary)
            .ok_or_else(|| ControllerError::NotFound(format!("primary of {}", cluster_id)))
    }
}

#[async_trait]
impl ResourceController for PgClusterController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::PostgresCluster
    }

    fn create_deadline(&self) -> Duration {
        self.provisioning.cluster_create_deadline()
    }

    fn validate(&self, spec: &serde_json::Value) -> ControllerResult<()> {
        Self::parse_spec(spec).map(|_| ())
    }

    async fn create(
        &self,
        ctx: CancellationToken,
        req: CreateRequest,
    ) -> ControllerResult<CreateOutcome> {
        let spec = Self::parse_spec(&req.spec)?;
        bootstrap::create_cluster(self, ctx, req, spec).await
    }

    async fn start(&self, ctx: CancellationToken, infra_id: &str) -> ControllerResult<()> {
        let cluster = self.cluster_by_infra(infra_id).await?;
        self.start_cluster(ctx, &cluster.id).await
    }

    async fn stop(&self, _ctx: CancellationToken, infra_id: &str) -> ControllerResult<()> {
        let cluster = self.cluster_by_infra(infra_id).await?;
        self.stop_cluster(&cluster.id).await
    }

    async fn delete(&self, _ctx: CancellationToken, infra_id: &str) -> ControllerResult<()> {
        match self.cluster_by_infra(infra_id).await {
            Ok(cluster) => self.delete_cluster(&cluster.id).await,
            // Bootstrap failed before the cluster row landed
            Err(ControllerError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn logs(&self, infra_id: &str, tail: u32) -> ControllerResult<Vec<String>> {
        let cluster = self.cluster_by_infra(infra_id).await?;
        let by_source = self.cluster_logs(&cluster.id, tail).await?;

        let mut merged = Vec::new();
        for (source, lines) in by_source {
            for line in lines {
                merged.push(format!("[{}] {}", source, line));
            }
        }
        Ok(merged)
    }

    async fn stats(&self, infra_id: &str) -> ControllerResult<serde_json::Value> {
        let cluster = self.cluster_by_infra(infra_id).await?;
        let stats = self.cluster_stats(&cluster.id).await?;
        serde_json::to_value(stats).map_err(|e| ControllerError::Other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_validation() {
        let ok = serde_json::json!({
            "version": "17",
            "node_count": 3,
            "replication_mode": "async",
            "password": "secret123",
            "etcd_count": 3,
        });
        assert!(PgClusterController::parse_spec(&ok).is_ok());

        let short_password = serde_json::json!({ "password": "short" });
        assert!(matches!(
            PgClusterController::parse_spec(&short_password),
            Err(ControllerError::Validation(_))
        ));

        let bad_etcd = serde_json::json!({ "password": "secret123", "etcd_count": 2 });
        assert!(matches!(
            PgClusterController::parse_spec(&bad_etcd),
            Err(ControllerError::Validation(_))
        ));

        let bad_version = serde_json::json!({ "password": "secret123", "version": "9.6" });
        assert!(matches!(
            PgClusterController::parse_spec(&bad_version),
            Err(ControllerError::Validation(_))
        ));
    }

    #[test]
    fn test_spec_defaults() {
        let spec =
            PgClusterController::parse_spec(&serde_json::json!({ "password": "secret123" }))
                .unwrap();
        assert_eq!(spec.version, "17");
        assert_eq!(spec.node_count, 1);
        assert_eq!(spec.etcd_count, 1);
        assert_eq!(spec.replication_mode, ReplicationMode::Async);
    }
}
