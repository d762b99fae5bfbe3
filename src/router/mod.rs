//! HTTP router module
//!
//! REST API for stacks, clusters, gateways and services, plus the
//! live-stream WebSocket endpoint.

mod handlers;
mod middleware;
mod websocket;

pub use middleware::auth::OwnerId;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::cache::Cache;
use crate::config::Configuration;
use crate::events::{DurableEventSink, EventBus, LiveStreamHub};
use crate::postgres::PgClusterController;
use crate::resource::{DockerServiceController, NginxGatewayController};
use crate::runtime::ContainerRuntime;
use crate::stack::StackOrchestrator;
use crate::store::Database;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<StackOrchestrator>,
    pub clusters: Arc<PgClusterController>,
    pub gateways: Arc<NginxGatewayController>,
    pub services: Arc<DockerServiceController>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub db: Arc<Database>,
    pub bus: EventBus,
    pub hub: Arc<LiveStreamHub>,
    pub sink: DurableEventSink,
    pub cache: Arc<Cache>,
    pub config: Arc<Configuration>,
    pub lifetime: tokio_util::sync::CancellationToken,
}

/// Success envelope shared by every endpoint
pub fn envelope<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "code": "OK",
        "message": "ok",
        "data": data,
    }))
}

/// Build the HTTP router with all routes
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // System
        .route("/system", get(handlers::system::system_info))
        // Stacks
        .route("/stacks", post(handlers::stacks::create_stack))
        .route("/stacks", get(handlers::stacks::list_stacks))
        .route("/stacks/clone", post(handlers::stacks::clone_stack))
        .route("/stacks/:id", get(handlers::stacks::get_stack))
        .route("/stacks/:id", delete(handlers::stacks::delete_stack))
        .route("/stacks/:id/start", post(handlers::stacks::start_stack))
        .route("/stacks/:id/stop", post(handlers::stacks::stop_stack))
        .route("/stacks/:id/restart", post(handlers::stacks::restart_stack))
        .route("/stacks/:id/logs", get(handlers::stacks::stack_logs))
        .route("/stacks/:id/metrics", get(handlers::stacks::stack_metrics))
        .route("/stacks/:id/export", get(handlers::stacks::export_stack))
        // PostgreSQL clusters
        .nest("/postgres", postgres_routes())
        // Nginx gateways
        .nest("/nginx", nginx_routes())
        // Docker services
        .nest("/services", service_routes())
        // Durable log replay per resource
        .route("/events/:instance_id", get(handlers::events::read_instance))
        // Bearer auth on everything above
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .nest("/api/v1", api_routes)
        // Live stream; unauthenticated in the current design
        .route("/ws", get(websocket::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

fn postgres_routes() -> Router<AppState> {
    Router::new()
        .route("/cluster", post(handlers::postgres::create_cluster))
        .route("/cluster", get(handlers::postgres::list_clusters))
        .route("/cluster/:id", get(handlers::postgres::get_cluster))
        .route("/cluster/:id", delete(handlers::postgres::delete_cluster))
        .route("/cluster/:id/start", post(handlers::postgres::start_cluster))
        .route("/cluster/:id/stop", post(handlers::postgres::stop_cluster))
        .route("/cluster/:id/restart", post(handlers::postgres::restart_cluster))
        .route("/cluster/:id/scale", post(handlers::postgres::scale_cluster))
        .route("/cluster/:id/failover", post(handlers::postgres::failover))
        .route("/cluster/:id/endpoints", get(handlers::postgres::endpoints))
        .route("/cluster/:id/replication", get(handlers::postgres::replication_status))
        .route("/cluster/:id/stats", get(handlers::postgres::cluster_stats))
        .route("/cluster/:id/logs", get(handlers::postgres::cluster_logs))
        .route(
            "/cluster/:id/failover-history",
            get(handlers::postgres::failover_history),
        )
        .route("/cluster/:id/nodes", get(handlers::postgres::list_nodes))
        .route("/cluster/:id/nodes", post(handlers::postgres::add_node))
        .route(
            "/cluster/:id/nodes/:node_id",
            delete(handlers::postgres::remove_node),
        )
        .route(
            "/cluster/:id/nodes/:node_id/stop",
            post(handlers::postgres::stop_node),
        )
        .route(
            "/cluster/:id/nodes/:node_id/start",
            post(handlers::postgres::start_node),
        )
        .route("/cluster/:id/users", get(handlers::postgres::list_users))
        .route("/cluster/:id/users", post(handlers::postgres::create_user))
        .route(
            "/cluster/:id/users/:username",
            delete(handlers::postgres::drop_user),
        )
        .route("/cluster/:id/databases", get(handlers::postgres::list_databases))
        .route("/cluster/:id/databases", post(handlers::postgres::create_database))
        .route(
            "/cluster/:id/databases/:name",
            delete(handlers::postgres::drop_database),
        )
        .route("/cluster/:id/query", post(handlers::postgres::execute_query))
        .route(
            "/cluster/:id/test-replication",
            post(handlers::postgres::test_replication),
        )
}

fn nginx_routes() -> Router<AppState> {
    Router::new()
        .route("/gateway", post(handlers::nginx::create_gateway))
        .route("/gateway/:id", get(handlers::nginx::get_gateway))
        .route("/gateway/:id", delete(handlers::nginx::delete_gateway))
        .route("/gateway/:id/domains", post(handlers::nginx::add_domain))
        .route(
            "/gateway/:id/domains/:name",
            delete(handlers::nginx::remove_domain),
        )
        .route("/gateway/:id/routes", post(handlers::nginx::add_route))
        .route("/gateway/:id/routes", delete(handlers::nginx::remove_route))
        .route("/gateway/:id/upstreams", post(handlers::nginx::set_upstreams))
        .route("/gateway/:id/ssl", post(handlers::nginx::set_ssl))
        .route("/gateway/:id/reload", post(handlers::nginx::reload_gateway))
}

fn service_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(handlers::services::create_service))
        .route("/", get(handlers::services::list_services))
        .route("/:id", get(handlers::services::get_service))
        .route("/:id", delete(handlers::services::delete_service))
        .route("/:id/start", post(handlers::services::start_service))
        .route("/:id/stop", post(handlers::services::stop_service))
        .route("/:id/logs", get(handlers::services::service_logs))
}
