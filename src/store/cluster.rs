//! PostgreSQL cluster persistence

use chrono::Utc;
use rusqlite::Row;

use super::{
    ignore_no_rows, parse_ts, to_json, ClusterNodeRow, Database, EtcdNodeRow, FailoverEventRow,
    FailoverReason, InfraStatus, NodeRole, PgClusterRow, ReplicationMode, StoreError, StoreResult,
};

/// Accessor for clusters, nodes and failover history
pub struct ClusterStore<'a> {
    db: &'a Database,
}

impl<'a> ClusterStore<'a> {
    pub(super) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, row: &PgClusterRow) -> StoreResult<()> {
        let row = row.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO pg_clusters
                        (id, infrastructure_id, scope, version, node_count,
                         replication_mode, primary_node_id, dcs_endpoints, network_id,
                         haproxy_container_id, haproxy_primary_port, haproxy_replica_port,
                         postgres_password, replicator_password, status, ha,
                         created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                            ?15, ?16, ?17, ?18)
                    "#,
                    rusqlite::params![
                        row.id,
                        row.infrastructure_id,
                        row.scope,
                        row.version,
                        row.node_count,
                        row.replication_mode.as_str(),
                        row.primary_node_id,
                        to_json(&row.dcs_endpoints)?,
                        row.network_id,
                        row.haproxy_container_id,
                        row.haproxy_primary_port,
                        row.haproxy_replica_port,
                        row.postgres_password,
                        row.replicator_password,
                        row.status.as_str(),
                        row.ha as i32,
                        row.created_at.to_rfc3339(),
                        row.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<PgClusterRow>> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("{} WHERE id = ?1", SELECT_CLUSTER),
                    [&id],
                    cluster_from_row,
                )
                .map(Some)
                .or_else(ignore_no_rows)
            })
            .await
    }

    pub async fn require(&self, id: &str) -> StoreResult<PgClusterRow> {
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("cluster {}", id)))
    }

    pub async fn get_by_infrastructure(
        &self,
        infrastructure_id: &str,
    ) -> StoreResult<Option<PgClusterRow>> {
        let infrastructure_id = infrastructure_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("{} WHERE infrastructure_id = ?1", SELECT_CLUSTER),
                    [&infrastructure_id],
                    cluster_from_row,
                )
                .map(Some)
                .or_else(ignore_no_rows)
            })
            .await
    }

    pub async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<PgClusterRow>> {
        let owner_id = owner_id.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT c.id, c.infrastructure_id, c.scope, c.version, c.node_count,
                            c.replication_mode, c.primary_node_id, c.dcs_endpoints,
                            c.network_id, c.haproxy_container_id, c.haproxy_primary_port,
                            c.haproxy_replica_port, c.postgres_password,
                            c.replicator_password, c.status, c.ha, c.created_at, c.updated_at
                     FROM pg_clusters c
                     JOIN infrastructures i ON i.id = c.infrastructure_id
                     WHERE i.owner_id = ?1 AND c.status != 'DELETED'
                     ORDER BY c.created_at",
                )?;
                let rows = stmt
                    .query_map([&owner_id], cluster_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Every cluster that is not deleted, for the health loop
    pub async fn list_active(&self) -> StoreResult<Vec<PgClusterRow>> {
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE status IN ('RUNNING', 'DEGRADED') ORDER BY created_at",
                    SELECT_CLUSTER
                ))?;
                let rows = stmt
                    .query_map([], cluster_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn update_status(&self, id: &str, status: InfraStatus) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE pg_clusters SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, status.as_str(), Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_primary(&self, id: &str, primary_node_id: Option<&str>) -> StoreResult<()> {
        let id = id.to_string();
        let primary_node_id = primary_node_id.map(|s| s.to_string());
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE pg_clusters SET primary_node_id = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, primary_node_id, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_node_count(&self, id: &str, node_count: u32) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE pg_clusters SET node_count = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, node_count, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_haproxy(&self, id: &str, container_id: Option<&str>) -> StoreResult<()> {
        let id = id.to_string();
        let container_id = container_id.map(|s| s.to_string());
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE pg_clusters SET haproxy_container_id = ?2, updated_at = ?3
                     WHERE id = ?1",
                    rusqlite::params![id, container_id, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    /// Hard-delete the cluster and everything under it
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute("DELETE FROM cluster_nodes WHERE cluster_id = ?1", [&id])?;
                conn.execute("DELETE FROM etcd_nodes WHERE cluster_id = ?1", [&id])?;
                conn.execute("DELETE FROM pg_clusters WHERE id = ?1", [&id])?;
                Ok(())
            })
            .await
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    pub async fn insert_node(&self, row: &ClusterNodeRow) -> StoreResult<()> {
        let row = row.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO cluster_nodes
                        (id, cluster_id, container_id, name, role, port, supervisor_port,
                         volume_id, replication_lag_bytes, is_healthy, last_probe_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    "#,
                    rusqlite::params![
                        row.id,
                        row.cluster_id,
                        row.container_id,
                        row.name,
                        row.role.as_str(),
                        row.port,
                        row.supervisor_port,
                        row.volume_id,
                        row.replication_lag_bytes,
                        row.is_healthy as i32,
                        row.last_probe_at.map(|t| t.to_rfc3339()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn node(&self, node_id: &str) -> StoreResult<Option<ClusterNodeRow>> {
        let node_id = node_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("{} WHERE id = ?1", SELECT_NODE),
                    [&node_id],
                    node_from_row,
                )
                .map(Some)
                .or_else(ignore_no_rows)
            })
            .await
    }

    pub async fn require_node(&self, node_id: &str) -> StoreResult<ClusterNodeRow> {
        self.node(node_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("node {}", node_id)))
    }

    /// Nodes of a cluster, primary first then by name
    pub async fn nodes(&self, cluster_id: &str) -> StoreResult<Vec<ClusterNodeRow>> {
        let cluster_id = cluster_id.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{} WHERE cluster_id = ?1 ORDER BY role = 'primary' DESC, name",
                    SELECT_NODE
                ))?;
                let rows = stmt
                    .query_map([&cluster_id], node_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn update_node_role(&self, node_id: &str, role: NodeRole) -> StoreResult<()> {
        let node_id = node_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE cluster_nodes SET role = ?2 WHERE id = ?1",
                    rusqlite::params![node_id, role.as_str()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn update_node_health(
        &self,
        node_id: &str,
        is_healthy: bool,
        lag_bytes: i64,
    ) -> StoreResult<()> {
        let node_id = node_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE cluster_nodes
                     SET is_healthy = ?2, replication_lag_bytes = ?3, last_probe_at = ?4
                     WHERE id = ?1",
                    rusqlite::params![
                        node_id,
                        is_healthy as i32,
                        lag_bytes,
                        Utc::now().to_rfc3339()
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete_node(&self, node_id: &str) -> StoreResult<()> {
        let node_id = node_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute("DELETE FROM cluster_nodes WHERE id = ?1", [&node_id])?;
                Ok(())
            })
            .await
    }

    // ========================================================================
    // Etcd nodes
    // ========================================================================

    pub async fn insert_etcd_node(&self, row: &EtcdNodeRow) -> StoreResult<()> {
        let row = row.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO etcd_nodes
                        (id, cluster_id, container_id, name, peer_port, client_port)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    rusqlite::params![
                        row.id,
                        row.cluster_id,
                        row.container_id,
                        row.name,
                        row.peer_port,
                        row.client_port,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn etcd_nodes(&self, cluster_id: &str) -> StoreResult<Vec<EtcdNodeRow>> {
        let cluster_id = cluster_id.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, cluster_id, container_id, name, peer_port, client_port
                     FROM etcd_nodes WHERE cluster_id = ?1 ORDER BY name",
                )?;
                let rows = stmt
                    .query_map([&cluster_id], |row| {
                        Ok(EtcdNodeRow {
                            id: row.get(0)?,
                            cluster_id: row.get(1)?,
                            container_id: row.get(2)?,
                            name: row.get(3)?,
                            peer_port: row.get(4)?,
                            client_port: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    // ========================================================================
    // Failover history
    // ========================================================================

    pub async fn insert_failover(&self, row: &FailoverEventRow) -> StoreResult<()> {
        let row = row.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO failover_events
                        (cluster_id, old_primary, new_primary, reason, triggered_by,
                         occurred_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    "#,
                    rusqlite::params![
                        row.cluster_id,
                        row.old_primary,
                        row.new_primary,
                        row.reason.as_str(),
                        row.triggered_by,
                        row.occurred_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn failover_history(&self, cluster_id: &str) -> StoreResult<Vec<FailoverEventRow>> {
        let cluster_id = cluster_id.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT cluster_id, old_primary, new_primary, reason, triggered_by,
                            occurred_at
                     FROM failover_events WHERE cluster_id = ?1 ORDER BY occurred_at DESC",
                )?;
                let rows = stmt
                    .query_map([&cluster_id], |row| {
                        let reason: String = row.get(3)?;
                        let occurred_at: String = row.get(5)?;
                        Ok(FailoverEventRow {
                            cluster_id: row.get(0)?,
                            old_primary: row.get(1)?,
                            new_primary: row.get(2)?,
                            reason: FailoverReason::parse(&reason)
                                .unwrap_or(FailoverReason::Automatic),
                            triggered_by: row.get(4)?,
                            occurred_at: parse_ts(&occurred_at),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

const SELECT_CLUSTER: &str = "SELECT id, infrastructure_id, scope, version, node_count,
       replication_mode, primary_node_id, dcs_endpoints, network_id,
       haproxy_container_id, haproxy_primary_port, haproxy_replica_port,
       postgres_password, replicator_password, status, ha, created_at, updated_at
 FROM pg_clusters";

const SELECT_NODE: &str = "SELECT id, cluster_id, container_id, name, role, port,
       supervisor_port, volume_id, replication_lag_bytes, is_healthy, last_probe_at
 FROM cluster_nodes";

fn cluster_from_row(row: &Row<'_>) -> rusqlite::Result<PgClusterRow> {
    let mode: String = row.get(5)?;
    let endpoints: String = row.get(7)?;
    let status: String = row.get(14)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;

    Ok(PgClusterRow {
        id: row.get(0)?,
        infrastructure_id: row.get(1)?,
        scope: row.get(2)?,
        version: row.get(3)?,
        node_count: row.get(4)?,
        replication_mode: ReplicationMode::parse(&mode).unwrap_or(ReplicationMode::Async),
        primary_node_id: row.get(6)?,
        dcs_endpoints: serde_json::from_str(&endpoints).unwrap_or_default(),
        network_id: row.get(8)?,
        haproxy_container_id: row.get(9)?,
        haproxy_primary_port: row.get(10)?,
        haproxy_replica_port: row.get(11)?,
        postgres_password: row.get(12)?,
        replicator_password: row.get(13)?,
        status: InfraStatus::parse(&status).unwrap_or(InfraStatus::Failed),
        ha: row.get::<_, i32>(15)? != 0,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<ClusterNodeRow> {
    let role: String = row.get(4)?;
    let last_probe: Option<String> = row.get(10)?;

    Ok(ClusterNodeRow {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        container_id: row.get(2)?,
        name: row.get(3)?,
        role: NodeRole::parse(&role).unwrap_or(NodeRole::Replica),
        port: row.get(5)?,
        supervisor_port: row.get(6)?,
        volume_id: row.get(7)?,
        replication_lag_bytes: row.get(8)?,
        is_healthy: row.get::<_, i32>(9)? != 0,
        last_probe_at: last_probe.as_deref().map(parse_ts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_row(id: &str) -> PgClusterRow {
        PgClusterRow {
            id: id.to_string(),
            infrastructure_id: format!("infra-{}", id),
            scope: "pg-test".to_string(),
            version: "17".to_string(),
            node_count: 3,
            replication_mode: ReplicationMode::Async,
            primary_node_id: None,
            dcs_endpoints: vec!["http://etcd-0:2379".to_string()],
            network_id: "net-1".to_string(),
            haproxy_container_id: None,
            haproxy_primary_port: 20000,
            haproxy_replica_port: 20001,
            postgres_password: "secret".to_string(),
            replicator_password: "replsecret".to_string(),
            status: InfraStatus::Creating,
            ha: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn node_row(id: &str, cluster: &str, role: NodeRole) -> ClusterNodeRow {
        ClusterNodeRow {
            id: id.to_string(),
            cluster_id: cluster.to_string(),
            container_id: format!("cont-{}", id),
            name: id.to_string(),
            role,
            port: 5432,
            supervisor_port: 18008,
            volume_id: format!("vol-{}", id),
            replication_lag_bytes: 0,
            is_healthy: true,
            last_probe_at: None,
        }
    }

    #[tokio::test]
    async fn test_cluster_round_trip() {
        let db = Database::open_in_memory().unwrap();
        db.clusters().insert(&cluster_row("c-1")).await.unwrap();

        let loaded = db.clusters().get("c-1").await.unwrap().unwrap();
        assert_eq!(loaded.scope, "pg-test");
        assert_eq!(loaded.replication_mode, ReplicationMode::Async);
        assert!(loaded.ha);
        assert_eq!(loaded.dcs_endpoints.len(), 1);
    }

    #[tokio::test]
    async fn test_nodes_primary_sorts_first() {
        let db = Database::open_in_memory().unwrap();
        db.clusters().insert(&cluster_row("c-1")).await.unwrap();

        db.clusters()
            .insert_node(&node_row("node-2", "c-1", NodeRole::Replica))
            .await
            .unwrap();
        db.clusters()
            .insert_node(&node_row("node-0", "c-1", NodeRole::Primary))
            .await
            .unwrap();
        db.clusters()
            .insert_node(&node_row("node-1", "c-1", NodeRole::Replica))
            .await
            .unwrap();

        let nodes = db.clusters().nodes("c-1").await.unwrap();
        assert_eq!(nodes[0].role, NodeRole::Primary);
        assert_eq!(nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_role_change_and_primary_pointer() {
        let db = Database::open_in_memory().unwrap();
        db.clusters().insert(&cluster_row("c-1")).await.unwrap();
        db.clusters()
            .insert_node(&node_row("node-0", "c-1", NodeRole::Primary))
            .await
            .unwrap();
        db.clusters()
            .insert_node(&node_row("node-1", "c-1", NodeRole::Replica))
            .await
            .unwrap();

        db.clusters()
            .update_node_role("node-0", NodeRole::Replica)
            .await
            .unwrap();
        db.clusters()
            .update_node_role("node-1", NodeRole::Primary)
            .await
            .unwrap();
        db.clusters().set_primary("c-1", Some("node-1")).await.unwrap();

        let cluster = db.clusters().get("c-1").await.unwrap().unwrap();
        assert_eq!(cluster.primary_node_id.as_deref(), Some("node-1"));

        let nodes = db.clusters().nodes("c-1").await.unwrap();
        let primaries: Vec<_> = nodes
            .iter()
            .filter(|n| n.role == NodeRole::Primary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].id, "node-1");
    }

    #[tokio::test]
    async fn test_failover_history_is_recorded() {
        let db = Database::open_in_memory().unwrap();
        db.clusters().insert(&cluster_row("c-1")).await.unwrap();

        db.clusters()
            .insert_failover(&FailoverEventRow {
                cluster_id: "c-1".to_string(),
                old_primary: Some("node-0".to_string()),
                new_primary: "node-1".to_string(),
                reason: FailoverReason::Automatic,
                triggered_by: None,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();

        let history = db.clusters().failover_history("c-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, FailoverReason::Automatic);
        assert_eq!(history[0].new_primary, "node-1");
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let db = Database::open_in_memory().unwrap();
        db.clusters().insert(&cluster_row("c-1")).await.unwrap();
        db.clusters()
            .insert_node(&node_row("node-0", "c-1", NodeRole::Primary))
            .await
            .unwrap();
        db.clusters()
            .insert_etcd_node(&EtcdNodeRow {
                id: "etcd-0".to_string(),
                cluster_id: "c-1".to_string(),
                container_id: "cont-etcd-0".to_string(),
                name: "etcd-0".to_string(),
                peer_port: 2380,
                client_port: 2379,
            })
            .await
            .unwrap();

        db.clusters().delete("c-1").await.unwrap();

        assert!(db.clusters().get("c-1").await.unwrap().is_none());
        assert!(db.clusters().nodes("c-1").await.unwrap().is_empty());
        assert!(db.clusters().etcd_nodes("c-1").await.unwrap().is_empty());
    }
}
