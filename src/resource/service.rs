//! Docker service controller
//!
//! Thin controller mapping a declarative service spec (image, ports,
//! env, limits) onto a single container. The image is pulled only when
//! absent locally; host ports come from the request or the allocator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ProvisioningConfiguration;
use crate::runtime::{ContainerRuntime, ContainerSpec, PortMap, ResourceLimits, RestartPolicyKind, RuntimeError};
use crate::store::{Database, InfraStatus, InfrastructureRow};

use super::{
    ControllerError, ControllerResult, CreateOutcome, CreateRequest, ResourceController,
    ResourceKind,
};

/// Declarative spec for a plain container service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub image: String,

    #[serde(default = "default_tag")]
    pub tag: String,

    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// Memory limit in megabytes (0 = unlimited)
    #[serde(default)]
    pub memory_mb: u64,

    /// CPU limit in whole cores (0 = unlimited)
    #[serde(default)]
    pub cpus: f64,

    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePort {
    pub container: u16,

    /// Fixed host port; omitted means the allocator picks one
    #[serde(default)]
    pub host: Option<u16>,
}

fn default_tag() -> String {
    "latest".to_string()
}

impl ServiceSpec {
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

pub struct DockerServiceController {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<Database>,
    provisioning: ProvisioningConfiguration,
}

impl DockerServiceController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<Database>,
        provisioning: ProvisioningConfiguration,
    ) -> Self {
        Self {
            runtime,
            db,
            provisioning,
        }
    }

    fn parse_spec(spec: &serde_json::Value) -> ControllerResult<ServiceSpec> {
        let spec: ServiceSpec = serde_json::from_value(spec.clone())
            .map_err(|e| ControllerError::Validation(format!("invalid service spec: {}", e)))?;

        if spec.image.trim().is_empty() {
            return Err(ControllerError::Validation(
                "service image must not be empty".to_string(),
            ));
        }
        for port in &spec.ports {
            if port.container == 0 {
                return Err(ControllerError::Validation(
                    "container port must be non-zero".to_string(),
                ));
            }
        }

        Ok(spec)
    }

    async fn container_id_for(&self, infra_id: &str) -> ControllerResult<String> {
        let row = self.db.infrastructure().require(infra_id).await?;
        row.container_id
            .ok_or_else(|| ControllerError::NotFound(format!("{} has no container", infra_id)))
    }
}

#[async_trait]
impl ResourceController for DockerServiceController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::DockerService
    }

    fn create_deadline(&self) -> Duration {
        self.provisioning.create_deadline()
    }

    fn validate(&self, spec: &serde_json::Value) -> ControllerResult<()> {
        Self::parse_spec(spec).map(|_| ())
    }

    async fn create(
        &self,
        ctx: CancellationToken,
        req: CreateRequest,
    ) -> ControllerResult<CreateOutcome> {
        let spec = Self::parse_spec(&req.spec)?;
        let infra_id = format!("svc-{}", Uuid::new_v4());
        let container_name = format!("stackd-{}-{}", req.declared_name, &infra_id[4..12]);

        // Resolve host ports before touching the engine
        let mut port_maps = Vec::new();
        let mut outputs = HashMap::new();
        for port in &spec.ports {
            let host_port = match port.host {
                Some(host) => {
                    self.db.infrastructure().reserve_port(host, &infra_id).await?;
                    host
                }
                None => {
                    self.db
                        .infrastructure()
                        .allocate_port(
                            self.provisioning.port_range_start,
                            self.provisioning.port_range_end,
                            &infra_id,
                        )
                        .await?
                }
            };
            port_maps.push(PortMap::tcp(port.container, host_port));
            outputs.insert(format!("port_{}", port.container), host_port.to_string());
            if outputs.len() == 1 {
                outputs.insert("endpoint".to_string(), format!("localhost:{}", host_port));
            }
        }

        if ctx.is_cancelled() {
            self.db.infrastructure().delete(&infra_id).await?;
            return Err(ControllerError::Cancelled);
        }

        let mut labels = HashMap::new();
        labels.insert("io.stackd.infrastructure".to_string(), infra_id.clone());
        if let Some(stack_id) = &req.stack_id {
            labels.insert("io.stackd.stack".to_string(), stack_id.clone());
        }

        let container_spec = ContainerSpec {
            name: container_name,
            image: spec.image_ref(),
            command: match &spec.command {
                Some(cmd) => Some(shell_words::split(cmd).map_err(|e| {
                    ControllerError::Validation(format!("invalid command: {}", e))
                })?),
                None => None,
            },
            env: spec.env.clone(),
            ports: port_maps,
            mounts: Vec::new(),
            network: None,
            network_aliases: Vec::new(),
            labels,
            limits: ResourceLimits {
                memory: spec.memory_mb * 1024 * 1024,
                nano_cpus: (spec.cpus * 1_000_000_000.0) as i64,
            },
            restart: if spec.restart {
                RestartPolicyKind::UnlessStopped
            } else {
                RestartPolicyKind::Never
            },
        };

        let container_id = match self.runtime.create_container(&container_spec).await {
            Ok(id) => id,
            Err(e) => {
                self.db.infrastructure().delete(&infra_id).await?;
                return Err(e.into());
            }
        };

        if let Err(e) = self.runtime.start_container(&container_id).await {
            let _ = self.runtime.remove_container(&container_id, true).await;
            self.db.infrastructure().delete(&infra_id).await?;
            return Err(e.into());
        }

        outputs.insert("container_id".to_string(), container_id.clone());

        let row = InfrastructureRow {
            id: infra_id.clone(),
            owner_id: req.owner_id.clone(),
            kind: ResourceKind::DockerService,
            name: req.declared_name.clone(),
            status: InfraStatus::Running,
            container_id: Some(container_id),
            detail: serde_json::to_value(&spec)
                .map_err(|e| ControllerError::Other(e.to_string()))?,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.db.infrastructure().insert(&row).await?;

        info!(infra = %infra_id, image = %spec.image_ref(), "service created");

        Ok(CreateOutcome {
            infra_id,
            outputs,
            status: InfraStatus::Running,
        })
    }

    async fn start(&self, _ctx: CancellationToken, infra_id: &str) -> ControllerResult<()> {
        let container_id = self.container_id_for(infra_id).await?;
        self.runtime.start_container(&container_id).await?;
        self.db
            .infrastructure()
            .update_status(infra_id, InfraStatus::Running)
            .await?;
        Ok(())
    }

    async fn stop(&self, _ctx: CancellationToken, infra_id: &str) -> ControllerResult<()> {
        let container_id = self.container_id_for(infra_id).await?;
        self.runtime
            .stop_container(&container_id, self.provisioning.stop_timeout())
            .await?;
        self.db
            .infrastructure()
            .update_status(infra_id, InfraStatus::Stopped)
            .await?;
        Ok(())
    }

    async fn delete(&self, _ctx: CancellationToken, infra_id: &str) -> ControllerResult<()> {
        let row = self.db.infrastructure().require(infra_id).await?;
        self.db
            .infrastructure()
            .update_status(infra_id, InfraStatus::Deleting)
            .await?;

        if let Some(container_id) = &row.container_id {
            match self.runtime.remove_container(container_id, true).await {
                Ok(()) | Err(RuntimeError::ContainerNotFound(_)) => {}
                Err(e) => {
                    warn!(infra = %infra_id, "failed to remove container: {}", e);
                    return Err(e.into());
                }
            }
        }

        self.db
            .infrastructure()
            .update_status(infra_id, InfraStatus::Deleted)
            .await?;
        // Ports become reusable once the container is gone
        self.db.infrastructure().release_ports(infra_id).await?;
        Ok(())
    }

    async fn logs(&self, infra_id: &str, tail: u32) -> ControllerResult<Vec<String>> {
        let container_id = self.container_id_for(infra_id).await?;
        Ok(self.runtime.container_logs(&container_id, tail).await?)
    }

    async fn stats(&self, infra_id: &str) -> ControllerResult<serde_json::Value> {
        let container_id = self.container_id_for(infra_id).await?;
        Ok(self.runtime.container_stats(&container_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;

    fn controller() -> (Arc<FakeRuntime>, DockerServiceController) {
        let runtime = Arc::new(FakeRuntime::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let controller = DockerServiceController::new(
            runtime.clone(),
            db,
            ProvisioningConfiguration::default(),
        );
        (runtime, controller)
    }

    fn request(spec: serde_json::Value) -> CreateRequest {
        CreateRequest {
            owner_id: "u-1".to_string(),
            stack_id: None,
            declared_name: "app".to_string(),
            infra_id: None,
            spec,
        }
    }

    #[tokio::test]
    async fn test_create_starts_container_and_records_outputs() {
        let (runtime, controller) = controller();

        let outcome = controller
            .create(
                CancellationToken::new(),
                request(serde_json::json!({
                    "image": "nginx",
                    "tag": "1.27",
                    "ports": [{ "container": 80, "host": 20080 }],
                })),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, InfraStatus::Running);
        assert_eq!(outcome.outputs.get("port_80").map(|s| s.as_str()), Some("20080"));
        assert!(outcome.outputs.contains_key("container_id"));
        assert_eq!(runtime.container_count(), 1);
    }

    #[tokio::test]
    async fn test_validate_rejects_empty_image() {
        let (_, controller) = controller();
        let err = controller
            .validate(&serde_json::json!({ "image": "" }))
            .unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_is_tolerant_of_missing_container() {
        let (runtime, controller) = controller();

        let outcome = controller
            .create(
                CancellationToken::new(),
                request(serde_json::json!({ "image": "redis" })),
            )
            .await
            .unwrap();

        // Remove the container out-of-band, then delete must still pass
        let container = outcome.outputs.get("container_id").unwrap();
        runtime.remove_container(container, true).await.unwrap();

        controller
            .delete(CancellationToken::new(), &outcome.infra_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_failure_releases_reserved_ports() {
        let (runtime, controller) = controller();
        runtime.fail_create_matching("app");

        let err = controller
            .create(
                CancellationToken::new(),
                request(serde_json::json!({
                    "image": "nginx",
                    "ports": [{ "container": 80, "host": 20080 }],
                })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Runtime(_)));

        // The port must be allocatable again
        assert!(!controller
            .db
            .infrastructure()
            .port_in_use(20080)
            .await
            .unwrap());
    }
}
