//! Stack management handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;

use crate::error::{ApiError, Result};
use crate::stack::CreateStackRequest;

use super::super::{envelope, AppState, OwnerId};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_tail")]
    pub tail: u32,
}

fn default_tail() -> u32 {
    100
}

pub async fn create_stack(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Json(req): Json<CreateStackRequest>,
) -> Result<impl IntoResponse> {
    let info = state.orchestrator.create_stack(&owner, req).await?;
    Ok((StatusCode::CREATED, envelope(info)))
}

pub async fn list_stacks(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse> {
    let stacks = state
        .orchestrator
        .list_stacks(&owner, query.page, query.per_page)
        .await?;
    Ok(envelope(stacks))
}

pub async fn get_stack(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    // Read-through: serve the cached read model when fresh
    let cache_key = format!("stack:{}", id);
    if let Some(cached) = state
        .cache
        .get_json::<crate::stack::StackInfo>(&cache_key)
        .await
    {
        return Ok(envelope(cached));
    }

    let info = state.orchestrator.get_stack(&owner, &id).await?;
    state.cache.put_json(&cache_key, &info).await;
    Ok(envelope(info))
}

pub async fn delete_stack(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.orchestrator.delete_stack(&owner, &id).await?;
    Ok(envelope(serde_json::json!({ "id": id })))
}

pub async fn start_stack(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.orchestrator.start_stack(&owner, &id).await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": "RUNNING" })))
}

pub async fn stop_stack(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.orchestrator.stop_stack(&owner, &id).await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": "STOPPED" })))
}

pub async fn restart_stack(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    state.orchestrator.restart_stack(&owner, &id).await?;
    Ok(envelope(serde_json::json!({ "id": id, "status": "RUNNING" })))
}

pub async fn stack_logs(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse> {
    let logs = state
        .orchestrator
        .stack_logs(&owner, &id, query.tail)
        .await?;
    Ok(envelope(logs))
}

pub async fn stack_metrics(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let metrics = state.orchestrator.stack_metrics(&owner, &id).await?;
    Ok(envelope(metrics))
}

pub async fn export_stack(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let request = state.orchestrator.export_stack(&owner, &id).await?;
    Ok(envelope(request))
}

#[derive(Debug, Deserialize)]
pub struct CloneRequest {
    pub source_stack_id: String,
    pub name: String,
}

pub async fn clone_stack(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Json(req): Json<CloneRequest>,
) -> Result<impl IntoResponse> {
    if req.name.trim().is_empty() {
        return Err(ApiError::Validation("clone name must not be empty".to_string()));
    }
    let info = state
        .orchestrator
        .clone_stack(&owner, &req.source_stack_id, &req.name)
        .await?;
    Ok((StatusCode::CREATED, envelope(info)))
}
