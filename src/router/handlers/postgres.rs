//! PostgreSQL cluster handlers
//!
//! Standalone cluster creation is detached from the request: the
//! handler persists a CREATING placeholder, dispatches the bootstrap on
//! the service lifetime, and returns immediately. A client hang-up does
//! not abort provisioning.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use crate::error::{ApiError, Result};
use crate::resource::{CreateRequest, ResourceController, ResourceKind};
use crate::store::{InfraStatus, InfrastructureRow, PgClusterRow};

use super::super::{envelope, AppState, OwnerId};

#[derive(Debug, Deserialize)]
pub struct CreateClusterBody {
    pub name: String,

    #[serde(flatten)]
    pub spec: serde_json::Value,
}

/// Resolve a cluster the caller owns, by cluster id.
async fn owned_cluster(state: &AppState, owner: &str, cluster_id: &str) -> Result<PgClusterRow> {
    let cluster = state
        .db
        .clusters()
        .get(cluster_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("cluster {}", cluster_id)))?;

    let infra = state
        .db
        .infrastructure()
        .get(&cluster.infrastructure_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("cluster {}", cluster_id)))?;

    if infra.owner_id != owner {
        return Err(ApiError::NotFound(format!("cluster {}", cluster_id)));
    }
    Ok(cluster)
}

pub async fn create_cluster(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Json(body): Json<CreateClusterBody>,
) -> Result<impl IntoResponse> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("cluster name must not be empty".to_string()));
    }
    state
        .clusters
        .validate(&body.spec)
        .map_err(ApiError::from)?;

    // Placeholder row first, so the id is immediately pollable
    let infra_id = format!("pgc-{}", Uuid::new_v4());
    let now = Utc::now();
    state
        .db
        .infrastructure()
        .insert(&InfrastructureRow {
            id: infra_id.clone(),
            owner_id: owner.clone(),
            kind: ResourceKind::PostgresCluster,
            name: body.name.clone(),
            status: InfraStatus::Creating,
            container_id: None,
            detail: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        })
        .await?;

    let controller = state.clusters.clone();
    let request = CreateRequest {
        owner_id: owner,
        stack_id: None,
        declared_name: body.name,
        infra_id: Some(infra_id.clone()),
        spec: body.spec,
    };
    let token = state.lifetime.child_token();

    tokio::spawn(async move {
        if let Err(e) = controller.create(token, request).await {
            error!("detached cluster create failed: {}", e);
        }
    });

    Ok((
        StatusCode::CREATED,
        envelope(serde_json::json!({
            "infrastructure_id": infra_id,
            "status": "CREATING",
        })),
    ))
}

pub async fn list_clusters(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
) -> Result<impl IntoResponse> {
    let rows = state.db.clusters().list_by_owner(&owner).await?;

    let mut infos = Vec::with_capacity(rows.len());
    for row in rows {
        infos.push(state.clusters.cluster_info(&row).await?);
    }
    Ok(envelope(infos))
}

pub async fn get_cluster(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    // The id may be an infrastructure id (from detached create) or the
    // cluster id itself
    let cluster = match state.db.clusters().get_by_infrastructure(&id).await? {
        Some(cluster) => {
            owned_cluster(&state, &owner, &cluster.id).await?
        }
        None => {
            // Placeholder still provisioning?
            if let Some(infra) = state.db.infrastructure().get(&id).await? {
                if infra.owner_id != owner {
                    return Err(ApiError::NotFound(format!("cluster {}", id)));
                }
                if infra.kind == ResourceKind::PostgresCluster {
                    return Ok(envelope(serde_json::json!({
                        "infrastructure_id": infra.id,
                        "status": infra.status,
                    })));
                }
                return Err(ApiError::NotFound(format!("cluster {}", id)));
            }
            owned_cluster(&state, &owner, &id).await?
        }
    };

    let cache_key = format!("cluster:{}", cluster.id);
    if let Some(cached) = state
        .cache
        .get_json::<crate::postgres::ClusterInfo>(&cache_key)
        .await
    {
        return Ok(envelope(cached));
    }

    let info = state.clusters.cluster_info(&cluster).await?;
    state.cache.put_json(&cache_key, &info).await;
    Ok(envelope(info))
}

pub async fn delete_cluster(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state.clusters.delete_cluster(&cluster.id).await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": "DELETED" })))
}

pub async fn start_cluster(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state
        .clusters
        .start_cluster(state.lifetime.child_token(), &cluster.id)
        .await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": "RUNNING" })))
}

pub async fn stop_cluster(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state.clusters.stop_cluster(&cluster.id).await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": "STOPPED" })))
}

pub async fn restart_cluster(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state
        .clusters
        .restart_cluster(state.lifetime.child_token(), &cluster.id)
        .await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": "RUNNING" })))
}

#[derive(Debug, Deserialize)]
pub struct ScaleBody {
    pub node_count: u32,
}

pub async fn scale_cluster(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Json(body): Json<ScaleBody>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state
        .clusters
        .scale(state.lifetime.child_token(), &cluster.id, body.node_count)
        .await?;
    Ok(envelope(serde_json::json!({
        "id": id,
        "node_count": body.node_count,
    })))
}

#[derive(Debug, Deserialize)]
pub struct FailoverBody {
    pub candidate_node_id: String,
}

pub async fn failover(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Json(body): Json<FailoverBody>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state
        .clusters
        .promote_replica(&cluster.id, &body.candidate_node_id, &owner)
        .await?;
    Ok(envelope(serde_json::json!({
        "id": id,
        "new_primary": body.candidate_node_id,
    })))
}

pub async fn endpoints(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    let endpoints = state.clusters.endpoints(&cluster.id).await?;
    Ok(envelope(endpoints))
}

pub async fn replication_status(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    let status = state.clusters.replication_status(&cluster.id).await?;
    Ok(envelope(status))
}

pub async fn cluster_stats(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    let stats = state.clusters.cluster_stats(&cluster.id).await?;
    Ok(envelope(stats))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: u32,
}

fn default_tail() -> u32 {
    100
}

pub async fn cluster_logs(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    axum::extract::Query(query): axum::extract::Query<LogsQuery>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    let logs = state.clusters.cluster_logs(&cluster.id, query.tail).await?;
    Ok(envelope(logs))
}

pub async fn failover_history(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    let history = state.clusters.failover_history(&cluster.id).await?;
    Ok(envelope(history))
}

pub async fn add_node(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    let node = state
        .clusters
        .add_node(state.lifetime.child_token(), &cluster.id)
        .await?;
    Ok((StatusCode::CREATED, envelope(node)))
}

#[derive(Debug, Deserialize)]
pub struct RemoveNodeQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn remove_node(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path((id, node_id)): Path<(String, String)>,
    axum::extract::Query(query): axum::extract::Query<RemoveNodeQuery>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state
        .clusters
        .remove_node(&cluster.id, &node_id, query.force)
        .await?;
    Ok(envelope(serde_json::json!({ "removed": node_id })))
}

pub async fn list_nodes(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    let nodes = state.db.clusters().nodes(&cluster.id).await?;
    Ok(envelope(nodes))
}

pub async fn stop_node(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path((id, node_id)): Path<(String, String)>,
    axum::extract::Query(query): axum::extract::Query<RemoveNodeQuery>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state
        .clusters
        .stop_node(&cluster.id, &node_id, query.force)
        .await?;
    Ok(envelope(serde_json::json!({ "stopped": node_id })))
}

pub async fn start_node(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path((id, node_id)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state.clusters.start_node(&cluster.id, &node_id).await?;
    Ok(envelope(serde_json::json!({ "started": node_id })))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserBody {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub superuser: bool,
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Json(body): Json<CreateUserBody>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state
        .clusters
        .create_user(&cluster.id, &body.username, &body.password, body.superuser)
        .await?;
    Ok((StatusCode::CREATED, envelope(serde_json::json!({ "username": body.username }))))
}

pub async fn drop_user(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path((id, username)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state.clusters.drop_user(&cluster.id, &username).await?;
    Ok(envelope(serde_json::json!({ "dropped": username })))
}

pub async fn list_users(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    let users = state.clusters.list_users(&cluster.id).await?;
    Ok(envelope(users))
}

#[derive(Debug, Deserialize)]
pub struct CreateDatabaseBody {
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
}

pub async fn create_database(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Json(body): Json<CreateDatabaseBody>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state
        .clusters
        .create_database(&cluster.id, &body.name, body.owner.as_deref())
        .await?;
    Ok((StatusCode::CREATED, envelope(serde_json::json!({ "name": body.name }))))
}

pub async fn drop_database(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path((id, name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    state.clusters.drop_database(&cluster.id, &name).await?;
    Ok(envelope(serde_json::json!({ "dropped": name })))
}

pub async fn list_databases(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    let databases = state.clusters.list_databases(&cluster.id).await?;
    Ok(envelope(databases))
}

#[derive(Debug, Deserialize)]
pub struct QueryBody {
    pub sql: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
}

pub async fn execute_query(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Json(body): Json<QueryBody>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    let result = state
        .clusters
        .execute_query(
            &cluster.id,
            &body.sql,
            body.database.as_deref(),
            body.node_id.as_deref(),
        )
        .await?;
    Ok(envelope(result))
}

pub async fn test_replication(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let cluster = owned_cluster(&state, &owner, &id).await?;
    let report = state.clusters.test_replication(&cluster.id).await?;
    Ok(envelope(report))
}
