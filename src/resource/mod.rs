//! Resource controllers
//!
//! One controller per resource kind behind a common trait. Kinds are a
//! closed set: adding one means a new variant plus a new controller,
//! nothing else changes shape.

pub mod nginx;
pub mod service;

pub use nginx::NginxGatewayController;
pub use service::DockerServiceController;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::runtime::RuntimeError;
use crate::store::{InfraStatus, StoreError};

/// The closed set of provisionable resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    #[serde(rename = "POSTGRES_CLUSTER")]
    PostgresCluster,
    #[serde(rename = "NGINX_GATEWAY")]
    NginxGateway,
    #[serde(rename = "DOCKER_SERVICE")]
    DockerService,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::PostgresCluster => "POSTGRES_CLUSTER",
            ResourceKind::NginxGateway => "NGINX_GATEWAY",
            ResourceKind::DockerService => "DOCKER_SERVICE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "POSTGRES_CLUSTER" => Some(ResourceKind::PostgresCluster),
            "NGINX_GATEWAY" => Some(ResourceKind::NginxGateway),
            "DOCKER_SERVICE" => Some(ResourceKind::DockerService),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller errors
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("DCS did not become ready: {0}")]
    DcsTimeout(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Context handed to a controller when creating a resource as part of a
/// stack (or standalone, with `stack_id` absent).
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub owner_id: String,
    pub stack_id: Option<String>,
    pub declared_name: String,

    /// Preassigned infrastructure id. Set when the caller persisted a
    /// CREATING placeholder before dispatching (detached standalone
    /// creates); absent for stack-driven creates.
    pub infra_id: Option<String>,

    /// Kind-specific spec with cross-resource placeholders already
    /// substituted by the orchestrator
    pub spec: serde_json::Value,
}

/// Result of a successful (or degraded) create
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub infra_id: String,

    /// Outputs other resources may reference (`${name.key}`)
    pub outputs: HashMap<String, String>,

    /// RUNNING, or DEGRADED when a non-fatal part failed
    pub status: InfraStatus,
}

/// Kind-specific lifecycle operations.
///
/// Every method takes a cancellation handle; long operations derive
/// their deadline from [`ResourceController::create_deadline`] at the
/// call site, not internally.
#[async_trait]
pub trait ResourceController: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Per-kind create deadline; the orchestrator bounds `create` by it
    fn create_deadline(&self) -> Duration {
        Duration::from_secs(300)
    }

    /// Schema-check a spec without side effects
    fn validate(&self, spec: &serde_json::Value) -> ControllerResult<()>;

    async fn create(
        &self,
        ctx: CancellationToken,
        req: CreateRequest,
    ) -> ControllerResult<CreateOutcome>;

    async fn start(&self, ctx: CancellationToken, infra_id: &str) -> ControllerResult<()>;

    async fn stop(&self, ctx: CancellationToken, infra_id: &str) -> ControllerResult<()>;

    /// Tolerant teardown: a missing container is not an error
    async fn delete(&self, ctx: CancellationToken, infra_id: &str) -> ControllerResult<()>;

    async fn logs(&self, infra_id: &str, tail: u32) -> ControllerResult<Vec<String>>;

    async fn stats(&self, infra_id: &str) -> ControllerResult<serde_json::Value>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            ResourceKind::PostgresCluster,
            ResourceKind::NginxGateway,
            ResourceKind::DockerService,
        ] {
            assert_eq!(ResourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ResourceKind::parse("LAMBDA"), None);
    }

    #[test]
    fn test_kind_serde_uses_wire_names() {
        let json = serde_json::to_string(&ResourceKind::PostgresCluster).unwrap();
        assert_eq!(json, "\"POSTGRES_CLUSTER\"");
    }
}
