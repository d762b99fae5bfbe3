//! State persistence module
//!
//! SQLite-backed storage for stacks, resources, clusters and their
//! nodes. The rest of the daemon reaches persisted state only through
//! [`Database`] accessors, so tests run against an in-memory database.

mod cluster;
mod stack;

pub use cluster::ClusterStore;
pub use stack::{InfraStore, StackStore};

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::resource::ResourceKind;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Infrastructure lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InfraStatus {
    Creating,
    Running,
    Degraded,
    Stopped,
    Failed,
    Deleting,
    Deleted,
}

impl InfraStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraStatus::Creating => "CREATING",
            InfraStatus::Running => "RUNNING",
            InfraStatus::Degraded => "DEGRADED",
            InfraStatus::Stopped => "STOPPED",
            InfraStatus::Failed => "FAILED",
            InfraStatus::Deleting => "DELETING",
            InfraStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATING" => Some(InfraStatus::Creating),
            "RUNNING" => Some(InfraStatus::Running),
            "DEGRADED" => Some(InfraStatus::Degraded),
            "STOPPED" => Some(InfraStatus::Stopped),
            "FAILED" => Some(InfraStatus::Failed),
            "DELETING" => Some(InfraStatus::Deleting),
            "DELETED" => Some(InfraStatus::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for InfraStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stack lifecycle status (superset of resource status: delete can fail
/// while leaving dangling resources behind)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    Creating,
    Running,
    Stopped,
    Failed,
    Deleting,
    Deleted,
    DeleteFailed,
}

impl StackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StackStatus::Creating => "CREATING",
            StackStatus::Running => "RUNNING",
            StackStatus::Stopped => "STOPPED",
            StackStatus::Failed => "FAILED",
            StackStatus::Deleting => "DELETING",
            StackStatus::Deleted => "DELETED",
            StackStatus::DeleteFailed => "DELETE_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATING" => Some(StackStatus::Creating),
            "RUNNING" => Some(StackStatus::Running),
            "STOPPED" => Some(StackStatus::Stopped),
            "FAILED" => Some(StackStatus::Failed),
            "DELETING" => Some(StackStatus::Deleting),
            "DELETED" => Some(StackStatus::Deleted),
            "DELETE_FAILED" => Some(StackStatus::DeleteFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Primary,
    Replica,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Primary => "primary",
            NodeRole::Replica => "replica",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(NodeRole::Primary),
            "replica" => Some(NodeRole::Replica),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replication mode for a PostgreSQL cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Async,
    Sync,
}

impl ReplicationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMode::Async => "async",
            ReplicationMode::Sync => "sync",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "async" => Some(ReplicationMode::Async),
            "sync" => Some(ReplicationMode::Sync),
            _ => None,
        }
    }
}

/// Why a failover happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    Manual,
    Automatic,
    NodeFailure,
}

impl FailoverReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverReason::Manual => "manual",
            FailoverReason::Automatic => "automatic",
            FailoverReason::NodeFailure => "node_failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(FailoverReason::Manual),
            "automatic" => Some(FailoverReason::Automatic),
            "node_failure" => Some(FailoverReason::NodeFailure),
            _ => None,
        }
    }
}

/// Generic infrastructure record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfrastructureRow {
    pub id: String,
    pub owner_id: String,
    pub kind: ResourceKind,
    pub name: String,
    pub status: InfraStatus,
    pub container_id: Option<String>,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stack record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackRow {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub environment: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub status: StackStatus,
    pub status_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Edge between a stack and an infrastructure record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackResourceRow {
    pub stack_id: String,
    pub infrastructure_id: Option<String>,
    pub declared_name: String,
    pub kind: ResourceKind,
    pub role: Option<String>,
    pub depends_on: Vec<String>,
    pub order: i64,

    /// Original declared spec, pre-substitution
    pub spec: serde_json::Value,

    pub outputs: HashMap<String, String>,
    pub status: InfraStatus,
    pub error: Option<String>,
}

/// PostgreSQL HA cluster record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgClusterRow {
    pub id: String,
    pub infrastructure_id: String,
    pub scope: String,
    pub version: String,
    pub node_count: u32,
    pub replication_mode: ReplicationMode,
    pub primary_node_id: Option<String>,
    pub dcs_endpoints: Vec<String>,
    pub network_id: String,
    pub haproxy_container_id: Option<String>,
    pub haproxy_primary_port: u16,
    pub haproxy_replica_port: u16,
    pub postgres_password: String,
    pub replicator_password: String,
    pub status: InfraStatus,
    pub ha: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cluster member node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNodeRow {
    pub id: String,
    pub cluster_id: String,
    pub container_id: String,
    pub name: String,
    pub role: NodeRole,
    pub port: u16,
    pub supervisor_port: u16,
    pub volume_id: String,
    pub replication_lag_bytes: i64,
    pub is_healthy: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
}

/// DCS member node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdNodeRow {
    pub id: String,
    pub cluster_id: String,
    pub container_id: String,
    pub name: String,
    pub peer_port: u16,
    pub client_port: u16,
}

/// Failover history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEventRow {
    pub cluster_id: String,
    pub old_primary: Option<String>,
    pub new_primary: String,
    pub reason: FailoverReason,
    pub triggered_by: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Resolution of a container id to the resource that owns it
#[derive(Debug, Clone)]
pub struct ContainerBinding {
    pub instance_id: String,
    pub owner_id: String,
    pub kind: ResourceKind,

    /// Set when the container is a cluster member rather than a
    /// directly bound resource
    pub cluster_id: Option<String>,
}

/// Main database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::init_tables(&conn)?;

        info!("Database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &Connection) -> SqliteResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS stacks (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                environment TEXT NOT NULL,
                description TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                status_detail TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (owner_id, name)
            );

            CREATE TABLE IF NOT EXISTS stack_resources (
                stack_id TEXT NOT NULL,
                infrastructure_id TEXT,
                declared_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                role TEXT,
                depends_on TEXT NOT NULL DEFAULT '[]',
                ord INTEGER NOT NULL DEFAULT 0,
                spec TEXT NOT NULL DEFAULT 'null',
                outputs TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL,
                error TEXT,
                PRIMARY KEY (stack_id, declared_name)
            );

            CREATE TABLE IF NOT EXISTS infrastructures (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                container_id TEXT,
                detail TEXT NOT NULL DEFAULT 'null',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pg_clusters (
                id TEXT PRIMARY KEY,
                infrastructure_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                version TEXT NOT NULL,
                node_count INTEGER NOT NULL,
                replication_mode TEXT NOT NULL,
                primary_node_id TEXT,
                dcs_endpoints TEXT NOT NULL DEFAULT '[]',
                network_id TEXT NOT NULL,
                haproxy_container_id TEXT,
                haproxy_primary_port INTEGER NOT NULL,
                haproxy_replica_port INTEGER NOT NULL,
                postgres_password TEXT NOT NULL,
                replicator_password TEXT NOT NULL,
                status TEXT NOT NULL,
                ha INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cluster_nodes (
                id TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL,
                container_id TEXT NOT NULL,
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                port INTEGER NOT NULL,
                supervisor_port INTEGER NOT NULL DEFAULT 0,
                volume_id TEXT NOT NULL,
                replication_lag_bytes INTEGER NOT NULL DEFAULT 0,
                is_healthy INTEGER NOT NULL DEFAULT 1,
                last_probe_at TEXT
            );

            CREATE TABLE IF NOT EXISTS etcd_nodes (
                id TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL,
                container_id TEXT NOT NULL,
                name TEXT NOT NULL,
                peer_port INTEGER NOT NULL,
                client_port INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS failover_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_id TEXT NOT NULL,
                old_primary TEXT,
                new_primary TEXT NOT NULL,
                reason TEXT NOT NULL,
                triggered_by TEXT,
                occurred_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS port_bindings (
                host_port INTEGER PRIMARY KEY,
                infrastructure_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_infra_owner_kind
                ON infrastructures(owner_id, kind);
            CREATE INDEX IF NOT EXISTS idx_infra_owner_status
                ON infrastructures(owner_id, status);
            CREATE INDEX IF NOT EXISTS idx_infra_container
                ON infrastructures(container_id);
            CREATE INDEX IF NOT EXISTS idx_nodes_cluster_healthy
                ON cluster_nodes(cluster_id, is_healthy);
            CREATE INDEX IF NOT EXISTS idx_nodes_cluster_role
                ON cluster_nodes(cluster_id, role);
            CREATE INDEX IF NOT EXISTS idx_nodes_container
                ON cluster_nodes(container_id);
            CREATE INDEX IF NOT EXISTS idx_resources_infra_status
                ON stack_resources(infrastructure_id, status);
            CREATE INDEX IF NOT EXISTS idx_stacks_tags
                ON stacks(tags);
            CREATE INDEX IF NOT EXISTS idx_failover_cluster
                ON failover_events(cluster_id, occurred_at);
            "#,
        )?;

        Ok(())
    }

    pub(crate) async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Stack and stack-resource accessors
    pub fn stacks(&self) -> StackStore<'_> {
        StackStore::new(self)
    }

    /// Generic infrastructure accessors
    pub fn infrastructure(&self) -> stack::InfraStore<'_> {
        stack::InfraStore::new(self)
    }

    /// Cluster, node and failover accessors
    pub fn clusters(&self) -> ClusterStore<'_> {
        ClusterStore::new(self)
    }

    /// Resolve a container id to its owning resource: a directly bound
    /// infrastructure, or a cluster node whose cluster is the resource.
    pub async fn resolve_container(
        &self,
        container_id: &str,
    ) -> StoreResult<Option<ContainerBinding>> {
        self.with_conn(|conn| {
            let direct = conn
                .query_row(
                    "SELECT id, owner_id, kind FROM infrastructures WHERE container_id = ?1",
                    [container_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .map(Some)
                .or_else(ignore_no_rows)?;

            if let Some((id, owner_id, kind)) = direct {
                let kind = ResourceKind::parse(&kind)
                    .ok_or_else(|| StoreError::Other(format!("unknown kind: {}", kind)))?;
                return Ok(Some(ContainerBinding {
                    instance_id: id,
                    owner_id,
                    kind,
                    cluster_id: None,
                }));
            }

            // Cluster nodes map to their cluster's infrastructure
            let via_node = conn
                .query_row(
                    r#"
                    SELECT i.id, i.owner_id, c.id
                    FROM cluster_nodes n
                    JOIN pg_clusters c ON c.id = n.cluster_id
                    JOIN infrastructures i ON i.id = c.infrastructure_id
                    WHERE n.container_id = ?1
                    "#,
                    [container_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .map(Some)
                .or_else(ignore_no_rows)?;

            Ok(via_node.map(|(id, owner_id, cluster_id)| ContainerBinding {
                instance_id: id,
                owner_id,
                kind: ResourceKind::PostgresCluster,
                cluster_id: Some(cluster_id),
            }))
        })
        .await
    }

    /// Compare-and-set an infrastructure status. Returns true when the
    /// row was in the expected status and transitioned.
    pub async fn infrastructure_status_cas(
        &self,
        id: &str,
        expected: InfraStatus,
        next: InfraStatus,
    ) -> StoreResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE infrastructures SET status = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = ?2",
                rusqlite::params![
                    id,
                    expected.as_str(),
                    next.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}

/// Collapse `QueryReturnedNoRows` into `Ok(None)`
pub(crate) fn ignore_no_rows<T>(e: rusqlite::Error) -> Result<Option<T>, StoreError> {
    match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(StoreError::from(other)),
    }
}

/// Map a UNIQUE violation into the typed duplicate error
pub(crate) fn map_constraint(e: rusqlite::Error, what: &str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::Duplicate(what.to_string());
        }
    }
    StoreError::from(e)
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn parse_ts(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_initializes_schema() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert!(count >= 7);
    }

    #[tokio::test]
    async fn test_status_cas_only_fires_from_expected() {
        let db = Database::open_in_memory().unwrap();
        db.infrastructure()
            .insert_for_tests("i-1", "u-1", ResourceKind::DockerService, "c-1")
            .await
            .unwrap();

        // Inserted as RUNNING; CAS from STOPPED must be a no-op
        let changed = db
            .infrastructure_status_cas("i-1", InfraStatus::Stopped, InfraStatus::Running)
            .await
            .unwrap();
        assert!(!changed);

        let changed = db
            .infrastructure_status_cas("i-1", InfraStatus::Running, InfraStatus::Stopped)
            .await
            .unwrap();
        assert!(changed);
    }
}
