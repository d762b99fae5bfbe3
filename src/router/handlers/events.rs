//! Durable log replay handler
//!
//! Reconcile path for live-stream clients that lost updates to
//! overflow: read one resource's events back in publish order.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension,
};

use crate::error::{ApiError, Result};

use super::super::{envelope, AppState, OwnerId};

pub async fn read_instance(
    State(state): State<AppState>,
    Extension(OwnerId(owner)): Extension<OwnerId>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse> {
    let events = state
        .sink
        .read_instance(&instance_id)
        .map_err(|e| ApiError::Internal(format!("log read failed: {}", e)))?;

    // Tenancy: only the owner's events come back
    let events: Vec<_> = events
        .into_iter()
        .filter(|event| event.owner_id == owner)
        .collect();

    Ok(envelope(events))
}
