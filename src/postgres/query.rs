//! Query routing, replication status and SQL-level CRUD
//!
//! Statements run through `psql` inside the chosen node container.
//! Writes go to the primary, reads round-robin over healthy replicas,
//! and an explicit node id overrides routing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::resource::{ControllerError, ControllerResult};
use crate::store::{ClusterNodeRow, NodeRole};

use super::PgClusterController;

/// Replica read retry while waiting for a sentinel row to replicate
const SYNC_ATTEMPTS: u32 = 10;
const SYNC_INTERVAL: Duration = Duration::from_millis(500);

static READ_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Result of one routed statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub node_id: String,
    pub node_name: String,
    pub rows: Vec<Vec<String>>,
    pub row_count: usize,
}

/// Per-replica entry in the replication read model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSyncStatus {
    pub node_id: String,
    pub node_name: String,
    pub state: String,
    pub lag_bytes: i64,
    pub is_healthy: bool,
}

/// Replication read model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationStatus {
    pub primary_node_id: Option<String>,
    pub replicas: Vec<ReplicaSyncStatus>,
}

/// Outcome of a replication round-trip test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationTestReport {
    pub token: String,
    pub all_synced: bool,
    pub replicas: Vec<ReplicaTestResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaTestResult {
    pub node_id: String,
    pub node_name: String,
    pub synced: bool,
    pub attempts: u32,
}

impl PgClusterController {
    /// Run a statement, routed by explicit node id or by statement kind.
    pub async fn execute_query(
        &self,
        cluster_id: &str,
        sql: &str,
        database: Option<&str>,
        node_id: Option<&str>,
    ) -> ControllerResult<QueryResult> {
        let node = match node_id {
            Some(id) => {
                let node = self.db.clusters().require_node(id).await?;
                if node.cluster_id != cluster_id {
                    return Err(ControllerError::Validation(format!(
                        "node {} does not belong to cluster {}",
                        id, cluster_id
                    )));
                }
                node
            }
            None => self.route_for(cluster_id, sql).await?,
        };

        let database = database.unwrap_or("postgres");
        let output = self
            .runtime
            .exec(
                &node.container_id,
                vec![
                    "psql".to_string(),
                    "-U".to_string(),
                    "postgres".to_string(),
                    "-d".to_string(),
                    database.to_string(),
                    "-t".to_string(),
                    "-A".to_string(),
                    "-F".to_string(),
                    "|".to_string(),
                    "-c".to_string(),
                    sql.to_string(),
                ],
            )
            .await?;

        if !output.success() {
            return Err(ControllerError::Other(format!(
                "query failed on {}: {}",
                node.name,
                output.stderr.trim()
            )));
        }

        let rows: Vec<Vec<String>> = output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.split('|').map(|cell| cell.to_string()).collect())
            .collect();
        let row_count = rows.len();

        Ok(QueryResult {
            node_id: node.id,
            node_name: node.name,
            rows,
            row_count,
        })
    }

    /// Writes go to the primary; reads round-robin over healthy
    /// replicas, falling back to the primary when none qualify.
    async fn route_for(&self, cluster_id: &str, sql: &str) -> ControllerResult<ClusterNodeRow> {
        let nodes = self.db.clusters().nodes(cluster_id).await?;
        let primary = nodes
            .iter()
            .find(|n| n.role == NodeRole::Primary)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(format!("primary of {}", cluster_id)))?;

        if !is_read_statement(sql) {
            return Ok(primary);
        }

        let replicas: Vec<ClusterNodeRow> = nodes
            .into_iter()
            .filter(|n| n.role == NodeRole::Replica && n.is_healthy)
            .collect();

        if replicas.is_empty() {
            return Ok(primary);
        }

        let pick = READ_COUNTER.fetch_add(1, Ordering::Relaxed) % replicas.len();
        Ok(replicas[pick].clone())
    }

    /// Primary-side replication view, refreshing per-node lag and
    /// health along the way.
    pub async fn replication_status(
        &self,
        cluster_id: &str,
    ) -> ControllerResult<ReplicationStatus> {
        let cluster = self.db.clusters().require(cluster_id).await?;
        let primary = self.primary_node(cluster_id).await?;

        let sql = "SELECT application_name, state, \
                   COALESCE(pg_wal_lsn_diff(sent_lsn, replay_lsn), 0) \
                   FROM pg_stat_replication";
        let result = self
            .execute_query(cluster_id, sql, None, Some(&primary.id))
            .await?;

        let mut replicas = Vec::new();
        for node in self.db.clusters().nodes(cluster_id).await? {
            if node.role != NodeRole::Replica {
                continue;
            }

            // application_name matches the node name with underscores
            let app_name = node.name.replace('-', "_");
            let reported = result.rows.iter().find(|row| {
                row.first()
                    .map(|name| name == &app_name || name == &node.name)
                    .unwrap_or(false)
            });

            let (state, lag) = match reported {
                Some(row) => (
                    row.get(1).cloned().unwrap_or_default(),
                    row.get(2).and_then(|v| v.trim().parse().ok()).unwrap_or(0),
                ),
                None => ("disconnected".to_string(), -1),
            };

            let healthy = reported.is_some();
            self.db
                .clusters()
                .update_node_health(&node.id, healthy, lag.max(0))
                .await?;

            replicas.push(ReplicaSyncStatus {
                node_id: node.id.clone(),
                node_name: node.name.clone(),
                state,
                lag_bytes: lag,
                is_healthy: healthy,
            });
        }

        Ok(ReplicationStatus {
            primary_node_id: cluster.primary_node_id,
            replicas,
        })
    }

    /// Write a sentinel row on the primary and verify it appears on
    /// every replica within the bounded retry.
    pub async fn test_replication(
        &self,
        cluster_id: &str,
    ) -> ControllerResult<ReplicationTestReport> {
        let primary = self.primary_node(cluster_id).await?;
        let token = uuid::Uuid::new_v4().simple().to_string();

        self.execute_query(
            cluster_id,
            "CREATE TABLE IF NOT EXISTS replication_probe (token TEXT, written_at TIMESTAMPTZ DEFAULT now())",
            None,
            Some(&primary.id),
        )
        .await?;
        self.execute_query(
            cluster_id,
            &format!("INSERT INTO replication_probe (token) VALUES ('{}')", token),
            None,
            Some(&primary.id),
        )
        .await?;

        let probe_sql = format!(
            "SELECT count(*) FROM replication_probe WHERE token = '{}'",
            token
        );

        let mut replicas = Vec::new();
        let mut all_synced = true;

        for node in self.db.clusters().nodes(cluster_id).await? {
            if node.role != NodeRole::Replica {
                continue;
            }

            let mut synced = false;
            let mut attempts = 0;

            while attempts < SYNC_ATTEMPTS {
                attempts += 1;
                match self
                    .execute_query(cluster_id, &probe_sql, None, Some(&node.id))
                    .await
                {
                    Ok(result) => {
                        let count: i64 = result
                            .rows
                            .first()
                            .and_then(|row| row.first())
                            .and_then(|v| v.trim().parse().ok())
                            .unwrap_or(0);
                        if count > 0 {
                            synced = true;
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(node = %node.name, "replication probe read failed: {}", e);
                    }
                }
                tokio::time::sleep(SYNC_INTERVAL).await;
            }

            if !synced {
                warn!(node = %node.name, "sentinel row did not replicate in time");
                all_synced = false;
            }

            replicas.push(ReplicaTestResult {
                node_id: node.id.clone(),
                node_name: node.name.clone(),
                synced,
                attempts,
            });
        }

        Ok(ReplicationTestReport {
            token,
            all_synced,
            replicas,
        })
    }

    // ========================================================================
    // User and database CRUD
    // ========================================================================

    pub async fn create_user(
        &self,
        cluster_id: &str,
        username: &str,
        password: &str,
        superuser: bool,
    ) -> ControllerResult<()> {
        validate_identifier(username)?;
        let clause = if superuser { "SUPERUSER" } else { "NOSUPERUSER" };
        let sql = format!(
            "CREATE ROLE \"{}\" WITH LOGIN {} PASSWORD '{}'",
            username,
            clause,
            password.replace('\'', "''")
        );
        let primary = self.primary_node(cluster_id).await?;
        self.execute_query(cluster_id, &sql, None, Some(&primary.id))
            .await?;
        Ok(())
    }

    pub async fn drop_user(&self, cluster_id: &str, username: &str) -> ControllerResult<()> {
        validate_identifier(username)?;
        let primary = self.primary_node(cluster_id).await?;
        self.execute_query(
            cluster_id,
            &format!("DROP ROLE IF EXISTS \"{}\"", username),
            None,
            Some(&primary.id),
        )
        .await?;
        Ok(())
    }

    pub async fn list_users(&self, cluster_id: &str) -> ControllerResult<Vec<String>> {
        let primary = self.primary_node(cluster_id).await?;
        let result = self
            .execute_query(
                cluster_id,
                "SELECT rolname FROM pg_roles WHERE rolcanlogin ORDER BY rolname",
                None,
                Some(&primary.id),
            )
            .await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }

    pub async fn create_database(
        &self,
        cluster_id: &str,
        name: &str,
        owner: Option<&str>,
    ) -> ControllerResult<()> {
        validate_identifier(name)?;
        let mut sql = format!("CREATE DATABASE \"{}\"", name);
        if let Some(owner) = owner {
            validate_identifier(owner)?;
            sql.push_str(&format!(" OWNER \"{}\"", owner));
        }
        let primary = self.primary_node(cluster_id).await?;
        self.execute_query(cluster_id, &sql, None, Some(&primary.id))
            .await?;
        Ok(())
    }

    pub async fn drop_database(&self, cluster_id: &str, name: &str) -> ControllerResult<()> {
        validate_identifier(name)?;
        let primary = self.primary_node(cluster_id).await?;
        self.execute_query(
            cluster_id,
            &format!("DROP DATABASE IF EXISTS \"{}\"", name),
            None,
            Some(&primary.id),
        )
        .await?;
        Ok(())
    }

    pub async fn list_databases(&self, cluster_id: &str) -> ControllerResult<Vec<String>> {
        let primary = self.primary_node(cluster_id).await?;
        let result = self
            .execute_query(
                cluster_id,
                "SELECT datname FROM pg_database WHERE NOT datistemplate ORDER BY datname",
                None,
                Some(&primary.id),
            )
            .await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }
}

/// Read statements are routable to replicas
fn is_read_statement(sql: &str) -> bool {
    let head = sql.trim_start().to_ascii_lowercase();
    head.starts_with("select") || head.starts_with("show") || head.starts_with("with")
}

/// Identifiers are interpolated into DDL, so they stay alphanumeric
fn validate_identifier(name: &str) -> ControllerResult<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(ControllerError::Validation(
            "identifier must be 1-63 characters".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.chars().next().is_some_and(|c| c.is_ascii_digit())
    {
        return Err(ControllerError::Validation(format!(
            "invalid identifier '{}'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_statement_detection() {
        assert!(is_read_statement("SELECT 1"));
        assert!(is_read_statement("  select * from t"));
        assert!(is_read_statement("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_read_statement("SHOW server_version"));
        assert!(!is_read_statement("INSERT INTO t VALUES (1)"));
        assert!(!is_read_statement("UPDATE t SET a = 1"));
        assert!(!is_read_statement("CREATE TABLE t (a int)"));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("app_db").is_ok());
        assert!(validate_identifier("User1").is_ok());
        assert!(validate_identifier("1bad").is_err());
        assert!(validate_identifier("bad-name").is_err());
        assert!(validate_identifier("drop table; --").is_err());
        assert!(validate_identifier("").is_err());
    }
}
