//! Stack, stack-resource and infrastructure persistence

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{Connection, Row};

use crate::resource::ResourceKind;

use super::{
    ignore_no_rows, map_constraint, parse_ts, to_json, Database, InfraStatus, InfrastructureRow,
    StackResourceRow, StackRow, StackStatus, StoreError, StoreResult,
};

/// Accessor for generic infrastructure rows
pub struct InfraStore<'a> {
    db: &'a Database,
}

impl<'a> InfraStore<'a> {
    pub(super) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, row: &InfrastructureRow) -> StoreResult<()> {
        let row = row.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO infrastructures
                        (id, owner_id, kind, name, status, container_id, detail,
                         created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    "#,
                    rusqlite::params![
                        row.id,
                        row.owner_id,
                        row.kind.as_str(),
                        row.name,
                        row.status.as_str(),
                        row.container_id,
                        to_json(&row.detail)?,
                        row.created_at.to_rfc3339(),
                        row.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| map_constraint(e, "infrastructure id"))?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<InfrastructureRow>> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, owner_id, kind, name, status, container_id, detail,
                            created_at, updated_at
                     FROM infrastructures WHERE id = ?1",
                    [&id],
                    infra_from_row,
                )
                .map(Some)
                .or_else(ignore_no_rows)
            })
            .await
    }

    pub async fn require(&self, id: &str) -> StoreResult<InfrastructureRow> {
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("infrastructure {}", id)))
    }

    pub async fn update_status(&self, id: &str, status: InfraStatus) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE infrastructures SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, status.as_str(), Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_container(&self, id: &str, container_id: Option<&str>) -> StoreResult<()> {
        let id = id.to_string();
        let container_id = container_id.map(|s| s.to_string());
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE infrastructures SET container_id = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, container_id, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_detail(&self, id: &str, detail: &serde_json::Value) -> StoreResult<()> {
        let id = id.to_string();
        let detail = to_json(detail)?;
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE infrastructures SET detail = ?2, updated_at = ?3 WHERE id = ?1",
                    rusqlite::params![id, detail, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_by_owner(
        &self,
        owner_id: &str,
        kind: Option<ResourceKind>,
    ) -> StoreResult<Vec<InfrastructureRow>> {
        let owner_id = owner_id.to_string();
        self.db
            .with_conn(move |conn| {
                let mut rows = Vec::new();
                match kind {
                    Some(kind) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, owner_id, kind, name, status, container_id, detail,
                                    created_at, updated_at
                             FROM infrastructures
                             WHERE owner_id = ?1 AND kind = ?2
                             ORDER BY created_at",
                        )?;
                        let mapped =
                            stmt.query_map([&owner_id, kind.as_str()], infra_from_row)?;
                        for row in mapped {
                            rows.push(row?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, owner_id, kind, name, status, container_id, detail,
                                    created_at, updated_at
                             FROM infrastructures WHERE owner_id = ?1 ORDER BY created_at",
                        )?;
                        let mapped = stmt.query_map([&owner_id], infra_from_row)?;
                        for row in mapped {
                            rows.push(row?);
                        }
                    }
                }
                Ok(rows)
            })
            .await
    }

    /// Hard-delete the row and release its reserved ports
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute("DELETE FROM infrastructures WHERE id = ?1", [&id])?;
                conn.execute(
                    "DELETE FROM port_bindings WHERE infrastructure_id = ?1",
                    [&id],
                )?;
                Ok(())
            })
            .await
    }

    /// Release every port reserved by an infrastructure
    pub async fn release_ports(&self, infra_id: &str) -> StoreResult<()> {
        let infra_id = infra_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM port_bindings WHERE infrastructure_id = ?1",
                    [&infra_id],
                )?;
                Ok(())
            })
            .await
    }

    /// Reserve a host port for an infrastructure; fails on conflict.
    pub async fn reserve_port(&self, port: u16, infra_id: &str) -> StoreResult<()> {
        let infra_id = infra_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO port_bindings (host_port, infrastructure_id) VALUES (?1, ?2)",
                    rusqlite::params![port, infra_id],
                )
                .map_err(|e| map_constraint(e, &format!("host port {}", port)))?;
                Ok(())
            })
            .await
    }

    /// Allocate the lowest free host port in the configured range.
    pub async fn allocate_port(&self, range_start: u16, range_end: u16, infra_id: &str) -> StoreResult<u16> {
        let infra_id = infra_id.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT host_port FROM port_bindings ORDER BY host_port")?;
                let taken: Vec<u16> = stmt
                    .query_map([], |row| row.get::<_, u16>(0))?
                    .collect::<Result<_, _>>()?;

                let mut candidate = range_start;
                for port in taken {
                    if port < range_start {
                        continue;
                    }
                    if port == candidate {
                        candidate = candidate.checked_add(1).ok_or_else(|| {
                            StoreError::Other("port range exhausted".to_string())
                        })?;
                    } else if port > candidate {
                        break;
                    }
                }

                if candidate > range_end {
                    return Err(StoreError::Other("port range exhausted".to_string()));
                }

                conn.execute(
                    "INSERT INTO port_bindings (host_port, infrastructure_id) VALUES (?1, ?2)",
                    rusqlite::params![candidate, infra_id],
                )?;
                Ok(candidate)
            })
            .await
    }

    pub async fn ports_for(&self, infra_id: &str) -> StoreResult<Vec<u16>> {
        let infra_id = infra_id.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT host_port FROM port_bindings WHERE infrastructure_id = ?1",
                )?;
                let ports = stmt
                    .query_map([&infra_id], |row| row.get(0))?
                    .collect::<Result<Vec<u16>, _>>()?;
                Ok(ports)
            })
            .await
    }

    pub async fn port_in_use(&self, port: u16) -> StoreResult<bool> {
        self.db
            .with_conn(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT count(*) FROM port_bindings WHERE host_port = ?1",
                    [port],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    #[cfg(test)]
    pub async fn insert_for_tests(
        &self,
        id: &str,
        owner_id: &str,
        kind: ResourceKind,
        container_id: &str,
    ) -> StoreResult<()> {
        self.insert(&InfrastructureRow {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            kind,
            name: id.to_string(),
            status: InfraStatus::Running,
            container_id: Some(container_id.to_string()),
            detail: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
    }
}

fn infra_from_row(row: &Row<'_>) -> rusqlite::Result<InfrastructureRow> {
    let kind: String = row.get(2)?;
    let status: String = row.get(4)?;
    let detail: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(InfrastructureRow {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        kind: ResourceKind::parse(&kind).unwrap_or(ResourceKind::DockerService),
        name: row.get(3)?,
        status: InfraStatus::parse(&status).unwrap_or(InfraStatus::Failed),
        container_id: row.get(5)?,
        detail: serde_json::from_str(&detail).unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

/// Accessor for stacks and their resources
pub struct StackStore<'a> {
    db: &'a Database,
}

impl<'a> StackStore<'a> {
    pub(super) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, row: &StackRow) -> StoreResult<()> {
        let row = row.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO stacks
                        (id, owner_id, name, environment, description, tags, status,
                         status_detail, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                    "#,
                    rusqlite::params![
                        row.id,
                        row.owner_id,
                        row.name,
                        row.environment,
                        row.description,
                        to_json(&row.tags)?,
                        row.status.as_str(),
                        row.status_detail,
                        row.created_at.to_rfc3339(),
                        row.updated_at.to_rfc3339(),
                    ],
                )
                .map_err(|e| map_constraint(e, &format!("stack name '{}'", row.name)))?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<StackRow>> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, owner_id, name, environment, description, tags, status,
                            status_detail, created_at, updated_at
                     FROM stacks WHERE id = ?1",
                    [&id],
                    stack_from_row,
                )
                .map(Some)
                .or_else(ignore_no_rows)
            })
            .await
    }

    pub async fn require(&self, id: &str) -> StoreResult<StackRow> {
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("stack {}", id)))
    }

    pub async fn find_by_name(&self, owner_id: &str, name: &str) -> StoreResult<Option<StackRow>> {
        let owner_id = owner_id.to_string();
        let name = name.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, owner_id, name, environment, description, tags, status,
                            status_detail, created_at, updated_at
                     FROM stacks WHERE owner_id = ?1 AND name = ?2",
                    [&owner_id, &name],
                    stack_from_row,
                )
                .map(Some)
                .or_else(ignore_no_rows)
            })
            .await
    }

    pub async fn list(
        &self,
        owner_id: &str,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<StackRow>> {
        let owner_id = owner_id.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, name, environment, description, tags, status,
                            status_detail, created_at, updated_at
                     FROM stacks
                     WHERE owner_id = ?1 AND status != 'DELETED'
                     ORDER BY created_at DESC
                     LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![owner_id, limit, offset],
                        stack_from_row,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: StackStatus,
        detail: Option<&str>,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let detail = detail.map(|s| s.to_string());
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE stacks SET status = ?2, status_detail = ?3, updated_at = ?4
                     WHERE id = ?1",
                    rusqlite::params![id, status.as_str(), detail, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn insert_resource(&self, row: &StackResourceRow) -> StoreResult<()> {
        let row = row.clone();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO stack_resources
                        (stack_id, infrastructure_id, declared_name, kind, role,
                         depends_on, ord, spec, outputs, status, error)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                    "#,
                    rusqlite::params![
                        row.stack_id,
                        row.infrastructure_id,
                        row.declared_name,
                        row.kind.as_str(),
                        row.role,
                        to_json(&row.depends_on)?,
                        row.order,
                        to_json(&row.spec)?,
                        to_json(&row.outputs)?,
                        row.status.as_str(),
                        row.error,
                    ],
                )
                .map_err(|e| {
                    map_constraint(e, &format!("resource name '{}'", row.declared_name))
                })?;
                Ok(())
            })
            .await
    }

    /// Resources of a stack, in declared order
    pub async fn resources(&self, stack_id: &str) -> StoreResult<Vec<StackResourceRow>> {
        let stack_id = stack_id.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT stack_id, infrastructure_id, declared_name, kind, role,
                            depends_on, ord, spec, outputs, status, error
                     FROM stack_resources WHERE stack_id = ?1 ORDER BY ord, declared_name",
                )?;
                let rows = stmt
                    .query_map([&stack_id], resource_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn resource(
        &self,
        stack_id: &str,
        declared_name: &str,
    ) -> StoreResult<Option<StackResourceRow>> {
        let stack_id = stack_id.to_string();
        let declared_name = declared_name.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT stack_id, infrastructure_id, declared_name, kind, role,
                            depends_on, ord, spec, outputs, status, error
                     FROM stack_resources WHERE stack_id = ?1 AND declared_name = ?2",
                    [&stack_id, &declared_name],
                    resource_from_row,
                )
                .map(Some)
                .or_else(ignore_no_rows)
            })
            .await
    }

    pub async fn bind_resource(
        &self,
        stack_id: &str,
        declared_name: &str,
        infrastructure_id: &str,
    ) -> StoreResult<()> {
        let stack_id = stack_id.to_string();
        let declared_name = declared_name.to_string();
        let infrastructure_id = infrastructure_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE stack_resources SET infrastructure_id = ?3
                     WHERE stack_id = ?1 AND declared_name = ?2",
                    rusqlite::params![stack_id, declared_name, infrastructure_id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn update_resource_status(
        &self,
        stack_id: &str,
        declared_name: &str,
        status: InfraStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let stack_id = stack_id.to_string();
        let declared_name = declared_name.to_string();
        let error = error.map(|s| s.to_string());
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE stack_resources SET status = ?3, error = ?4
                     WHERE stack_id = ?1 AND declared_name = ?2",
                    rusqlite::params![stack_id, declared_name, status.as_str(), error],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_resource_outputs(
        &self,
        stack_id: &str,
        declared_name: &str,
        outputs: &HashMap<String, String>,
    ) -> StoreResult<()> {
        let stack_id = stack_id.to_string();
        let declared_name = declared_name.to_string();
        let outputs = to_json(outputs)?;
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE stack_resources SET outputs = ?3
                     WHERE stack_id = ?1 AND declared_name = ?2",
                    rusqlite::params![stack_id, declared_name, outputs],
                )?;
                Ok(())
            })
            .await
    }

    /// Remove the resource rows of a fully deleted stack
    pub async fn delete_resources(&self, stack_id: &str) -> StoreResult<()> {
        let stack_id = stack_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute("DELETE FROM stack_resources WHERE stack_id = ?1", [&stack_id])?;
                Ok(())
            })
            .await
    }
}

fn stack_from_row(row: &Row<'_>) -> rusqlite::Result<StackRow> {
    let tags: String = row.get(5)?;
    let status: String = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(StackRow {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        environment: row.get(3)?,
        description: row.get(4)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        status: StackStatus::parse(&status).unwrap_or(StackStatus::Failed),
        status_detail: row.get(7)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<StackResourceRow> {
    let kind: String = row.get(3)?;
    let depends_on: String = row.get(5)?;
    let spec: String = row.get(7)?;
    let outputs: String = row.get(8)?;
    let status: String = row.get(9)?;

    Ok(StackResourceRow {
        stack_id: row.get(0)?,
        infrastructure_id: row.get(1)?,
        declared_name: row.get(2)?,
        kind: ResourceKind::parse(&kind).unwrap_or(ResourceKind::DockerService),
        role: row.get(4)?,
        depends_on: serde_json::from_str(&depends_on).unwrap_or_default(),
        order: row.get(6)?,
        spec: serde_json::from_str(&spec).unwrap_or(serde_json::Value::Null),
        outputs: serde_json::from_str(&outputs).unwrap_or_default(),
        status: InfraStatus::parse(&status).unwrap_or(InfraStatus::Failed),
        error: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack_row(id: &str, owner: &str, name: &str) -> StackRow {
        StackRow {
            id: id.to_string(),
            owner_id: owner.to_string(),
            name: name.to_string(),
            environment: "development".to_string(),
            description: None,
            tags: vec!["web".to_string()],
            status: StackStatus::Creating,
            status_detail: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_stack_round_trip() {
        let db = Database::open_in_memory().unwrap();
        db.stacks().insert(&stack_row("s-1", "u-1", "web")).await.unwrap();

        let loaded = db.stacks().get("s-1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "web");
        assert_eq!(loaded.status, StackStatus::Creating);
        assert_eq!(loaded.tags, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_stack_name_is_conflict() {
        let db = Database::open_in_memory().unwrap();
        db.stacks().insert(&stack_row("s-1", "u-1", "web")).await.unwrap();

        let err = db
            .stacks()
            .insert(&stack_row("s-2", "u-1", "web"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));

        // Same name under a different owner is fine
        db.stacks().insert(&stack_row("s-3", "u-2", "web")).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_declared_name_within_stack_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.stacks().insert(&stack_row("s-1", "u-1", "web")).await.unwrap();

        let resource = StackResourceRow {
            stack_id: "s-1".to_string(),
            infrastructure_id: None,
            declared_name: "db".to_string(),
            kind: ResourceKind::PostgresCluster,
            role: None,
            depends_on: vec![],
            order: 0,
            spec: serde_json::json!({ "password": "secret123" }),
            outputs: HashMap::new(),
            status: InfraStatus::Creating,
            error: None,
        };
        db.stacks().insert_resource(&resource).await.unwrap();

        let err = db.stacks().insert_resource(&resource).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_resources_come_back_in_declared_order() {
        let db = Database::open_in_memory().unwrap();
        db.stacks().insert(&stack_row("s-1", "u-1", "web")).await.unwrap();

        for (name, ord) in [("gw", 3), ("db", 1), ("app", 2)] {
            db.stacks()
                .insert_resource(&StackResourceRow {
                    stack_id: "s-1".to_string(),
                    infrastructure_id: None,
                    declared_name: name.to_string(),
                    kind: ResourceKind::DockerService,
                    role: None,
                    depends_on: vec![],
                    order: ord,
                    spec: serde_json::Value::Null,
                    outputs: HashMap::new(),
                    status: InfraStatus::Creating,
                    error: None,
                })
                .await
                .unwrap();
        }

        let resources = db.stacks().resources("s-1").await.unwrap();
        let names: Vec<_> = resources.iter().map(|r| r.declared_name.as_str()).collect();
        assert_eq!(names, ["db", "app", "gw"]);
    }

    #[tokio::test]
    async fn test_port_allocation_skips_reserved() {
        let db = Database::open_in_memory().unwrap();
        db.infrastructure().reserve_port(20000, "i-1").await.unwrap();
        db.infrastructure().reserve_port(20001, "i-1").await.unwrap();

        let port = db
            .infrastructure()
            .allocate_port(20000, 20010, "i-2")
            .await
            .unwrap();
        assert_eq!(port, 20002);

        // Reserving an in-use port is a conflict
        let err = db.infrastructure().reserve_port(20000, "i-3").await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_outputs_persist() {
        let db = Database::open_in_memory().unwrap();
        db.stacks().insert(&stack_row("s-1", "u-1", "web")).await.unwrap();
        db.stacks()
            .insert_resource(&StackResourceRow {
                stack_id: "s-1".to_string(),
                infrastructure_id: None,
                declared_name: "db".to_string(),
                kind: ResourceKind::PostgresCluster,
                role: None,
                depends_on: vec![],
                order: 0,
                spec: serde_json::Value::Null,
                outputs: HashMap::new(),
                status: InfraStatus::Creating,
                error: None,
            })
            .await
            .unwrap();

        let mut outputs = HashMap::new();
        outputs.insert("primary_endpoint".to_string(), "localhost:20000".to_string());
        db.stacks()
            .set_resource_outputs("s-1", "db", &outputs)
            .await
            .unwrap();

        let row = db.stacks().resource("s-1", "db").await.unwrap().unwrap();
        assert_eq!(
            row.outputs.get("primary_endpoint").map(|s| s.as_str()),
            Some("localhost:20000")
        );
    }
}
