//! Nginx gateway handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;

use crate::error::{ApiError, Result};
use crate::resource::nginx::{DomainSpec, RouteSpec, SslSpec, UpstreamSpec};
use crate::resource::{CreateRequest, ResourceController, ResourceKind};
use crate::store::InfrastructureRow;

use super::super::{envelope, AppState, OwnerId};

#[derive(Debug, Deserialize)]
pub struct CreateGatewayBody {
    pub name: String,

    #[serde(flatten)]
    pub spec: serde_json::Value,
}

async fn owned_gateway(state: &AppState, owner: &str, id: &str) -> Result<InfrastructureRow> {
    let infra = state
        .db
        .infrastructure()
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("gateway {}", id)))?;

    if infra.owner_id != owner || infra.kind != ResourceKind::NginxGateway {
        return Err(ApiError::NotFound(format!("gateway {}", id)));
    }
    Ok(infra)
}

pub async fn create_gateway(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Json(body): Json<CreateGatewayBody>,
) -> Result<impl IntoResponse> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("gateway name must not be empty".to_string()));
    }

    let outcome = state
        .gateways
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

pub async fn get_gateway(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let infra = owned_gateway(&state, &owner, &id).await?;
    Ok(envelope(serde_json::json!({
        "infrastructure_id": infra.id,
        "name": infra.name,
        "status": infra.status,
        "container_id": infra.container_id,
        "spec": infra.detail,
    })))
}

pub async fn delete_gateway(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    owned_gateway(&state, &owner, &id).await?;
    state
        .gateways
        .delete(state.lifetime.child_token(), &id)
        .await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": "DELETED" })))
}

pub async fn add_domain(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Json(domain): Json<DomainSpec>,
) -> Result<impl IntoResponse> {
    owned_gateway(&state, &owner, &id).await?;
    state.gateways.add_domain(&id, domain).await?;
    Ok(envelope(serde_json::json!({ "id": id })))
}

pub async fn remove_domain(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path((id, name)): Path<(String, String)>,
) -> Result<impl IntoResponse> {
    owned_gateway(&state, &owner, &id).await?;
    state.gateways.remove_domain(&id, &name).await?;
    Ok(envelope(serde_json::json!({ "removed": name })))
}

pub async fn add_route(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Json(route): Json<RouteSpec>,
) -> Result<impl IntoResponse> {
    owned_gateway(&state, &owner, &id).await?;
    state.gateways.add_route(&id, route).await?;
    Ok(envelope(serde_json::json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
pub struct RemoveRouteBody {
    pub path: String,
}

pub async fn remove_route(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Json(body): Json<RemoveRouteBody>,
) -> Result<impl IntoResponse> {
    owned_gateway(&state, &owner, &id).await?;
    state.gateways.remove_route(&id, &body.path).await?;
    Ok(envelope(serde_json::json!({ "removed": body.path })))
}

pub async fn set_upstreams(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Json(upstreams): Json<Vec<UpstreamSpec>>,
) -> Result<impl IntoResponse> {
    owned_gateway(&state, &owner, &id).await?;
    state.gateways.set_upstreams(&id, upstreams).await?;
    Ok(envelope(serde_json::json!({ "id": id })))
}

pub async fn set_ssl(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Json(ssl): Json<Option<SslSpec>>,
) -> Result<impl IntoResponse> {
    owned_gateway(&state, &owner, &id).await?;
    state.gateways.set_ssl(&id, ssl).await?;
    Ok(envelope(serde_json::json!({ "id": id })))
}

pub async fn reload_gateway(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    owned_gateway(&state, &owner, &id).await?;
    state.gateways.reload_gateway(&id).await?;
    Ok(envelope(serde_json::json!({ "reloaded": id })))
}
