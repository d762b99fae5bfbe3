//! Nginx gateway controller
//!
//! Renders a gateway spec into an nginx config on the host, mounts it
//! into the container, and exposes the declared port. Config changes go
//! through the image's own check (`nginx -t`) before a reload; a failed
//! check restores the previous file and errors out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ProvisioningConfiguration;
use crate::runtime::{ContainerRuntime, ContainerSpec, MountSpec, PortMap, RuntimeError};
use crate::store::{Database, InfraStatus, InfrastructureRow};

use super::{
    ControllerError, ControllerResult, CreateOutcome, CreateRequest, ResourceController,
    ResourceKind,
};

/// Gateway image used unless the spec overrides it
const DEFAULT_IMAGE: &str = "nginx:1.27-alpine";

/// Declarative gateway spec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySpec {
    /// Host port the gateway listens on
    pub port: u16,

    #[serde(default)]
    pub image: Option<String>,

    /// Raw server-block body; when present it is used verbatim inside
    /// the generated `server { }` and routes/domains are additive
    #[serde(default)]
    pub config: Option<String>,

    #[serde(default)]
    pub domains: Vec<DomainSpec>,

    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    #[serde(default)]
    pub upstreams: Vec<UpstreamSpec>,

    #[serde(default)]
    pub ssl: Option<SslSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSpec {
    pub name: String,
    pub upstream: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    pub path: String,
    pub upstream: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSpec {
    pub name: String,
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslSpec {
    pub cert_path: String,
    pub key_path: String,
}

impl GatewaySpec {
    pub fn image_ref(&self) -> String {
        self.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string())
    }

    /// Render the full nginx.conf
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("worker_processes auto;\n\nevents {\n    worker_connections 1024;\n}\n\n");
        out.push_str("http {\n");

        for upstream in &self.upstreams {
            out.push_str(&format!("    upstream {} {{\n", upstream.name));
            for server in &upstream.servers {
                out.push_str(&format!("        server {};\n", server));
            }
            out.push_str("    }\n\n");
        }

        out.push_str("    server {\n        listen 80;\n");
        if let Some(ssl) = &self.ssl {
            out.push_str("        listen 443 ssl;\n");
            out.push_str(&format!("        ssl_certificate {};\n", ssl.cert_path));
            out.push_str(&format!("        ssl_certificate_key {};\n", ssl.key_path));
        }

        for domain in &self.domains {
            out.push_str(&format!("        server_name {};\n", domain.name));
        }

        if let Some(raw) = &self.config {
            for line in raw.lines() {
                out.push_str("        ");
                out.push_str(line);
                out.push('\n');
            }
        }

        for route in &self.routes {
            out.push_str(&format!(
                "        location {} {{\n            proxy_pass http://{};\n            proxy_set_header Host $host;\n            proxy_set_header X-Real-IP $remote_addr;\n        }}\n",
                route.path, route.upstream
            ));
        }

        if self.routes.is_empty() && self.config.is_none() {
            out.push_str(
                "        location / {\n            return 200 'gateway up';\n            add_header Content-Type text/plain;\n        }\n",
            );
        }

        out.push_str("    }\n}\n");
        out
    }
}

pub struct NginxGatewayController {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<Database>,
    provisioning: ProvisioningConfiguration,

    /// Host directory holding per-gateway config files
    config_dir: PathBuf,
}

impl NginxGatewayController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<Database>,
        provisioning: ProvisioningConfiguration,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            runtime,
            db,
            provisioning,
            config_dir: data_dir.join("gateways"),
        }
    }

    fn parse_spec(spec: &serde_json::Value) -> ControllerResult<GatewaySpec> {
        let spec: GatewaySpec = serde_json::from_value(spec.clone())
            .map_err(|e| ControllerError::Validation(format!("invalid gateway spec: {}", e)))?;

        if spec.port == 0 {
            return Err(ControllerError::Validation(
                "gateway port must be non-zero".to_string(),
            ));
        }

        let upstream_names: Vec<&str> =
            spec.upstreams.iter().map(|u| u.name.as_str()).collect();
        for route in &spec.routes {
            if !upstream_names.contains(&route.upstream.as_str())
                && !route.upstream.contains(':')
            {
                return Err(ControllerError::Validation(format!(
                    "route {} references unknown upstream '{}'",
                    route.path, route.upstream
                )));
            }
        }

        Ok(spec)
    }

    fn config_path(&self, infra_id: &str) -> PathBuf {
        self.config_dir.join(infra_id).join("nginx.conf")
    }

    async fn write_config(&self, infra_id: &str, content: &str) -> ControllerResult<()> {
        let path = self.config_path(infra_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ControllerError::Other(e.to_string()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| ControllerError::Other(e.to_string()))?;
        Ok(())
    }

    /// Run the image's config check inside the container
    async fn check_config(&self, container_id: &str) -> ControllerResult<()> {
        let out = self
            .runtime
            .exec(container_id, vec!["nginx".into(), "-t".into()])
            .await?;

        if !out.success() {
            return Err(ControllerError::ConfigInvalid(format!(
                "nginx config check failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn reload(&self, container_id: &str) -> ControllerResult<()> {
        let out = self
            .runtime
            .exec(container_id, vec!["nginx".into(), "-s".into(), "reload".into()])
            .await?;

        if !out.success() {
            return Err(ControllerError::ConfigInvalid(format!(
                "nginx reload failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn load(&self, infra_id: &str) -> ControllerResult<(InfrastructureRow, GatewaySpec)> {
        let row = self.db.infrastructure().require(infra_id).await?;
        let spec = Self::parse_spec(&row.detail)?;
        Ok((row, spec))
    }

    /// Swap in a new spec: render, check inside the container, reload.
    /// On any failure the previous config file is restored.
    async fn apply_spec(
        &self,
        infra_id: &str,
        row: &InfrastructureRow,
        next: &GatewaySpec,
    ) -> ControllerResult<()> {
        let container_id = row
            .container_id
            .as_deref()
            .ok_or_else(|| ControllerError::NotFound(format!("{} has no container", infra_id)))?;

        let previous = tokio::fs::read_to_string(self.config_path(infra_id))
            .await
            .unwrap_or_default();

        self.write_config(infra_id, &next.render()).await?;

        let applied = async {
            self.check_config(container_id).await?;
            self.reload(container_id).await
        }
        .await;

        if let Err(e) = applied {
            // Roll the file back so the running config matches disk
            if let Err(restore_err) = self.write_config(infra_id, &previous).await {
                warn!(infra = %infra_id, "failed to restore previous config: {}", restore_err);
            }
            return Err(e);
        }

        self.db
            .infrastructure()
            .set_detail(
                infra_id,
                &serde_json::to_value(next).map_err(|e| ControllerError::Other(e.to_string()))?,
            )
            .await?;
        Ok(())
    }

    // ========================================================================
    // Gateway mutations (domains, routes, upstreams, ssl)
    // ========================================================================

    pub async fn add_domain(&self, infra_id: &str, domain: DomainSpec) -> ControllerResult<()> {
        let (row, mut spec) = self.load(infra_id).await?;
        if spec.domains.iter().any(|d| d.name == domain.name) {
            return Err(ControllerError::Validation(format!(
                "domain '{}' already configured",
                domain.name
            )));
        }
        spec.domains.push(domain);
        self.apply_spec(infra_id, &row, &spec).await
    }

    pub async fn remove_domain(&self, infra_id: &str, name: &str) -> ControllerResult<()> {
        let (row, mut spec) = self.load(infra_id).await?;
        let before = spec.domains.len();
        spec.domains.retain(|d| d.name != name);
        if spec.domains.len() == before {
            return Err(ControllerError::NotFound(format!("domain '{}'", name)));
        }
        self.apply_spec(infra_id, &row, &spec).await
    }

    pub async fn add_route(&self, infra_id: &str, route: RouteSpec) -> ControllerResult<()> {
        let (row, mut spec) = self.load(infra_id).await?;
        if spec.routes.iter().any(|r| r.path == route.path) {
            return Err(ControllerError::Validation(format!(
                "route '{}' already configured",
                route.path
            )));
        }
        spec.routes.push(route);
        self.apply_spec(infra_id, &row, &spec).await
    }

    pub async fn remove_route(&self, infra_id: &str, path: &str) -> ControllerResult<()> {
        let (row, mut spec) = self.load(infra_id).await?;
        let before = spec.routes.len();
        spec.routes.retain(|r| r.path != path);
        if spec.routes.len() == before {
            return Err(ControllerError::NotFound(format!("route '{}'", path)));
        }
        self.apply_spec(infra_id, &row, &spec).await
    }

    pub async fn set_upstreams(
        &self,
        infra_id: &str,
        upstreams: Vec<UpstreamSpec>,
    ) -> ControllerResult<()> {
        let (row, mut spec) = self.load(infra_id).await?;
        spec.upstreams = upstreams;
        self.apply_spec(infra_id, &row, &spec).await
    }

    pub async fn set_ssl(&self, infra_id: &str, ssl: Option<SslSpec>) -> ControllerResult<()> {
        let (row, mut spec) = self.load(infra_id).await?;
        spec.ssl = ssl;
        self.apply_spec(infra_id, &row, &spec).await
    }

    pub async fn reload_gateway(&self, infra_id: &str) -> ControllerResult<()> {
        let (row, _) = self.load(infra_id).await?;
        let container_id = row
            .container_id
            .as_deref()
            .ok_or_else(|| ControllerError::NotFound(format!("{} has no container", infra_id)))?;
        self.check_config(container_id).await?;
        self.reload(container_id).await
    }
}

#[async_trait]
impl ResourceController for NginxGatewayController {
    fn kind(&self) -> ResourceKind {
        ResourceKind::NginxGateway
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
        let infra_id = format!("gw-{}", Uuid::new_v4());
        let container_name = format!("stackd-{}-{}", req.declared_name, &infra_id[3..11]);

        self.db
            .infrastructure()
            .reserve_port(spec.port, &infra_id)
            .await?;

        self.write_config(&infra_id, &spec.render()).await?;

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
            command: None,
            env: HashMap::new(),
            ports: vec![PortMap::tcp(80, spec.port)],
            mounts: vec![MountSpec::Bind {
                source: self
                    .config_path(&infra_id)
                    .to_string_lossy()
                    .into_owned(),
                target: "/etc/nginx/nginx.conf".to_string(),
                read_only: true,
            }],
            network: None,
            network_aliases: Vec::new(),
            labels,
            limits: Default::default(),
            restart: Default::default(),
        };

        let container_id = match self.runtime.create_container(&container_spec).await {
            Ok(id) => id,
            Err(e) => {
                self.db.infrastructure().delete(&infra_id).await?;
                return Err(e.into());
            }
        };

        let started = async {
            self.runtime.start_container(&container_id).await?;
            // The image's own check is the real validator
            self.check_config(&container_id).await
        }
        .await;

        if let Err(e) = started {
            let _ = self.runtime.remove_container(&container_id, true).await;
            self.db.infrastructure().delete(&infra_id).await?;
            return Err(e);
        }

        let row = InfrastructureRow {
            id: infra_id.clone(),
            owner_id: req.owner_id.clone(),
            kind: ResourceKind::NginxGateway,
            name: req.declared_name.clone(),
            status: InfraStatus::Running,
            container_id: Some(container_id.clone()),
            detail: serde_json::to_value(&spec)
                .map_err(|e| ControllerError::Other(e.to_string()))?,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.db.infrastructure().insert(&row).await?;

        info!(infra = %infra_id, port = spec.port, "gateway created");

        let mut outputs = HashMap::new();
        outputs.insert("endpoint".to_string(), format!("localhost:{}", spec.port));
        outputs.insert("port".to_string(), spec.port.to_string());
        outputs.insert("container_id".to_string(), container_id);

        Ok(CreateOutcome {
            infra_id,
            outputs,
            status: InfraStatus::Running,
        })
    }

    async fn start(&self, _ctx: CancellationToken, infra_id: &str) -> ControllerResult<()> {
        let (row, _) = self.load(infra_id).await?;
        let container_id = row
            .container_id
            .as_deref()
            .ok_or_else(|| ControllerError::NotFound(format!("{} has no container", infra_id)))?;
        self.runtime.start_container(container_id).await?;
        self.db
            .infrastructure()
            .update_status(infra_id, InfraStatus::Running)
            .await?;
        Ok(())
    }

    async fn stop(&self, _ctx: CancellationToken, infra_id: &str) -> ControllerResult<()> {
        let (row, _) = self.load(infra_id).await?;
        let container_id = row
            .container_id
            .as_deref()
            .ok_or_else(|| ControllerError::NotFound(format!("{} has no container", infra_id)))?;
        self.runtime
            .stop_container(container_id, self.provisioning.stop_timeout())
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
                Err(e) => return Err(e.into()),
            }
        }

        let config_dir = self.config_dir.join(infra_id);
        if let Err(e) = tokio::fs::remove_dir_all(&config_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(infra = %infra_id, "failed to remove gateway config dir: {}", e);
            }
        }

        self.db
            .infrastructure()
            .update_status(infra_id, InfraStatus::Deleted)
            .await?;
        self.db.infrastructure().release_ports(infra_id).await?;
        Ok(())
    }

    async fn logs(&self, infra_id: &str, tail: u32) -> ControllerResult<Vec<String>> {
        let (row, _) = self.load(infra_id).await?;
        let container_id = row
            .container_id
            .as_deref()
            .ok_or_else(|| ControllerError::NotFound(format!("{} has no container", infra_id)))?;
        Ok(self.runtime.container_logs(container_id, tail).await?)
    }

    async fn stats(&self, infra_id: &str) -> ControllerResult<serde_json::Value> {
        let (row, _) = self.load(infra_id).await?;
        let container_id = row
            .container_id
            .as_deref()
            .ok_or_else(|| ControllerError::NotFound(format!("{} has no container", infra_id)))?;
        Ok(self.runtime.container_stats(container_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::ExecOutput;

    fn controller(dir: &std::path::Path) -> (Arc<FakeRuntime>, NginxGatewayController) {
        let runtime = Arc::new(FakeRuntime::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let controller = NginxGatewayController::new(
            runtime.clone(),
            db,
            ProvisioningConfiguration::default(),
            dir.to_path_buf(),
        );
        (runtime, controller)
    }

    fn request(spec: serde_json::Value) -> CreateRequest {
        CreateRequest {
            owner_id: "u-1".to_string(),
            stack_id: None,
            declared_name: "gw".to_string(),
            infra_id: None,
            spec,
        }
    }

    #[test]
    fn test_render_includes_upstreams_and_routes() {
        let spec = GatewaySpec {
            port: 8080,
            image: None,
            config: None,
            domains: vec![DomainSpec {
                name: "example.test".to_string(),
                upstream: "app".to_string(),
            }],
            routes: vec![RouteSpec {
                path: "/api".to_string(),
                upstream: "app".to_string(),
            }],
            upstreams: vec![UpstreamSpec {
                name: "app".to_string(),
                servers: vec!["10.0.0.2:3000".to_string()],
            }],
            ssl: None,
        };

        let rendered = spec.render();
        assert!(rendered.contains("upstream app"));
        assert!(rendered.contains("server 10.0.0.2:3000;"));
        assert!(rendered.contains("server_name example.test;"));
        assert!(rendered.contains("location /api"));
        assert!(rendered.contains("proxy_pass http://app;"));
    }

    #[tokio::test]
    async fn test_create_checks_config_in_image() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, controller) = controller(dir.path());

        let outcome = controller
            .create(
                CancellationToken::new(),
                request(serde_json::json!({ "port": 8080 })),
            )
            .await
            .unwrap();

        assert_eq!(outcome.outputs.get("port").map(|s| s.as_str()), Some("8080"));

        // The config check ran inside the container
        let execs = runtime.exec_invocations();
        assert!(execs.iter().any(|(_, cmd)| cmd == &vec!["nginx", "-t"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_create_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, controller) = controller(dir.path());

        runtime.script_exec(
            "nginx -t",
            ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "unexpected end of file".to_string(),
            },
        );

        let err = controller
            .create(
                CancellationToken::new(),
                request(serde_json::json!({ "port": 8080 })),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::ConfigInvalid(_)));
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_route_change_restores_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, controller) = controller(dir.path());

        let outcome = controller
            .create(
                CancellationToken::new(),
                request(serde_json::json!({ "port": 8080 })),
            )
            .await
            .unwrap();

        let original = tokio::fs::read_to_string(controller.config_path(&outcome.infra_id))
            .await
            .unwrap();

        // All further checks fail
        runtime.script_exec(
            "nginx -t",
            ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "bad directive".to_string(),
            },
        );

        let err = controller
            .add_route(
                &outcome.infra_id,
                RouteSpec {
                    path: "/broken".to_string(),
                    upstream: "127.0.0.1:1".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ConfigInvalid(_)));

        let restored = tokio::fs::read_to_string(controller.config_path(&outcome.infra_id))
            .await
            .unwrap();
        assert_eq!(restored, original);
    }

    #[tokio::test]
    async fn test_route_referencing_unknown_upstream_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, controller) = controller(dir.path());

        let err = controller
            .validate(&serde_json::json!({
                "port": 8080,
                "routes": [{ "path": "/", "upstream": "ghost" }],
            }))
            .unwrap_err();
        assert!(matches!(err, ControllerError::Validation(_)));
    }
}
