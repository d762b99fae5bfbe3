//! System information handler

use axum::{extract::State, response::IntoResponse};

use crate::error::Result;

use super::super::{envelope, AppState};

pub async fn system_info(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let runtime_version = state
        .runtime
        .version()
        .await
        .unwrap_or_else(|_| "unreachable".to_string());

    let mut system = sysinfo::System::new();
    system.refresh_memory();

    Ok(envelope(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "runtime_version": runtime_version,
        "live_stream_clients": state.hub.client_count(),
        "event_subscribers": state.bus.subscriber_count(),
        "cache_connected": state.cache.is_connected(),
        "memory_total_bytes": system.total_memory(),
        "memory_used_bytes": system.used_memory(),
        "cpus": num_cpus::get(),
    })))
}
