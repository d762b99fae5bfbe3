//! Container runtime trait definitions

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Error type for runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("Image pull failed: {0}")]
    ImagePull(String),

    #[error("Exec failed: {0}")]
    ExecFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Port mapping from a container port to an optional fixed host port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMap {
    pub container: u16,
    pub host: Option<u16>,
    pub protocol: String,
}

impl PortMap {
    pub fn tcp(container: u16, host: u16) -> Self {
        Self {
            container,
            host: Some(host),
            protocol: "tcp".into(),
        }
    }

    /// Exposed on the container network only, no host binding
    pub fn internal(container: u16) -> Self {
        Self {
            container,
            host: None,
            protocol: "tcp".into(),
        }
    }
}

/// Volume or bind mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSpec {
    /// Named volume managed by the runtime
    Volume { name: String, target: String },

    /// Host path bind mount
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
}

/// Resource limits for a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory limit in bytes (0 = unlimited)
    pub memory: u64,

    /// CPU limit in nano-CPUs (0 = unlimited)
    pub nano_cpus: i64,
}

/// Restart policy applied at container create
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicyKind {
    #[default]
    Never,
    UnlessStopped,
    OnFailure,
}

/// Declarative container description consumed by `create_container`
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name (unique on the host)
    pub name: String,

    /// Image reference including tag
    pub image: String,

    /// Command override; None keeps the image default
    pub command: Option<Vec<String>>,

    /// Environment variables
    pub env: HashMap<String, String>,

    /// Port mappings
    pub ports: Vec<PortMap>,

    /// Mounts
    pub mounts: Vec<MountSpec>,

    /// Network to attach to (None = engine default)
    pub network: Option<String>,

    /// Extra DNS names on the attached network
    pub network_aliases: Vec<String>,

    /// Labels
    pub labels: HashMap<String, String>,

    /// Resource limits
    pub limits: ResourceLimits,

    /// Restart policy
    pub restart: RestartPolicyKind,
}

/// Container state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Removing,
    Unknown,
}

/// Health probe state, when the image defines a healthcheck
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

/// Snapshot returned by `inspect_container`
#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub health: Option<HealthState>,

    /// IP address per attached network
    pub networks: HashMap<String, String>,

    pub labels: HashMap<String, String>,
}

/// Output of an exec invocation inside a running container
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Lifecycle event emitted by the engine's event stream
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub container_id: String,
    pub action: String,
    pub attributes: HashMap<String, String>,
    pub timestamp: i64,
}

/// Trait abstracting the container host.
///
/// All methods are cancellation-safe: dropping the future leaves the
/// engine in a consistent state (the engine call itself may complete).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Verify connectivity with the engine
    async fn ping(&self) -> RuntimeResult<()>;

    /// Engine version string
    async fn version(&self) -> RuntimeResult<String>;

    /// Pull the image only if it is not present locally
    async fn ensure_image(&self, image: &str) -> RuntimeResult<()>;

    /// Create a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    /// Start a created or stopped container
    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    /// Stop with a grace period, then SIGKILL
    async fn stop_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()>;

    /// Send a signal to the main process
    async fn kill_container(&self, id: &str, signal: &str) -> RuntimeResult<()>;

    /// Remove a container; `force` kills first if running
    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()>;

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails>;

    /// Tail recent log lines
    async fn container_logs(&self, id: &str, tail: u32) -> RuntimeResult<Vec<String>>;

    /// Run a command inside the container and collect its output
    async fn exec(&self, id: &str, cmd: Vec<String>) -> RuntimeResult<ExecOutput>;

    /// Create a bridge network; returns the network id. Reuses an
    /// existing network of the same name.
    async fn create_network(&self, name: &str) -> RuntimeResult<String>;

    async fn remove_network(&self, name: &str) -> RuntimeResult<()>;

    async fn create_volume(&self, name: &str) -> RuntimeResult<String>;

    async fn remove_volume(&self, name: &str, force: bool) -> RuntimeResult<()>;

    /// Container stats snapshot as reported by the engine
    async fn container_stats(&self, id: &str) -> RuntimeResult<serde_json::Value>;

    /// Subscribe to the engine's container lifecycle events
    fn events(&self) -> BoxStream<'static, RuntimeResult<RuntimeEvent>>;
}
