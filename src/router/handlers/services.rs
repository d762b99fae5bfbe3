//! Docker service handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;

use crate::error::{ApiError, Result};
use crate::resource::{CreateRequest, ResourceController, ResourceKind};
use crate::store::InfrastructureRow;

use super::super::{envelope, AppState, OwnerId};

#[derive(Debug, Deserialize)]
pub struct CreateServiceBody {
    pub name: String,

    #[serde(flatten)]
    pub spec: serde_json::Value,
}

async fn owned_service(state: &AppState, owner: &str, id: &str) -> Result<InfrastructureRow> {
    let infra = state
        .db
        .infrastructure()
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("service {}", id)))?;

    if infra.owner_id != owner || infra.kind != ResourceKind::DockerService {
        return Err(ApiError::NotFound(format!("service {}", id)));
    }
    Ok(infra)
}

pub async fn create_service(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Json(body): Json<CreateServiceBody>,
) -> Result<impl IntoResponse> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("service name must not be empty".to_string()));
    }

    let outcome = state
        .services
        .create(
            state.lifetime.child_token(),
            CreateRequest {
                owner_id: owner,
                stack_id: None,
                declared_name: body.name,
                infra_id: None,
                spec: body.spec,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, envelope(serde_json::json!({
        "infrastructure_id": outcome.infra_id,
        "outputs": outcome.outputs,
        "status": outcome.status,
    }))))
}

pub async fn list_services(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
) -> Result<impl IntoResponse> {
    let rows = state
        .db
        .infrastructure()
        .list_by_owner(&owner, Some(ResourceKind::DockerService))
        .await?;
    Ok(envelope(rows))
}

pub async fn get_service(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let infra = owned_service(&state, &owner, &id).await?;
    Ok(envelope(infra))
}

pub async fn delete_service(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    owned_service(&state, &owner, &id).await?;
    state
        .services
        .delete(state.lifetime.child_token(), &id)
        .await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": "DELETED" })))
}

pub async fn start_service(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    owned_service(&state, &owner, &id).await?;
    state
        .services
        .start(state.lifetime.child_token(), &id)
        .await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": "RUNNING" })))
}

pub async fn stop_service(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    owned_service(&state, &owner, &id).await?;
    state
        .services
        .stop(state.lifetime.child_token(), &id)
        .await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": "STOPPED" })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: u32,
}

fn default_tail() -> u32 {
    100
}

pub async fn service_logs(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse> {
    owned_service(&state, &owner, &id).await?;
    let logs = state.services.logs(&id, query.tail).await?;
    Ok(envelope(logs))
}
