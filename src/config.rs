//! Configuration structures and loading

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfiguration,

    /// System paths and settings
    #[serde(default)]
    pub system: SystemConfiguration,

    /// Docker configuration
    #[serde(default)]
    pub docker: DockerConfiguration,

    /// Event plane configuration
    #[serde(default)]
    pub events: EventConfiguration,

    /// Redis cache configuration
    #[serde(default)]
    pub cache: CacheConfiguration,

    /// PostgreSQL cluster defaults
    #[serde(default)]
    pub postgres: PostgresConfiguration,

    /// Provisioning timeouts and port allocation
    #[serde(default)]
    pub provisioning: ProvisioningConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        config.apply_env_overrides();

        // Ensure directories exist
        std::fs::create_dir_all(&config.system.data_directory)?;
        std::fs::create_dir_all(&config.system.log_directory)?;
        std::fs::create_dir_all(config.events.log_directory(&config.system))?;

        Ok(config)
    }

    /// Environment variables override file values for the settings that
    /// differ between deployments.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("STACKD_HTTP_PORT") {
            if let Ok(port) = v.parse() {
                self.api.port = port;
            }
        }
        if let Ok(v) = std::env::var("STACKD_DOCKER_SOCKET") {
            self.docker.socket = v;
        }
        if let Ok(v) = std::env::var("STACKD_JWT_SECRET") {
            self.api.jwt_secret = v;
        }
        if let Ok(v) = std::env::var("STACKD_REDIS_URL") {
            self.cache.url = v;
            self.cache.enabled = true;
        }
        if let Ok(v) = std::env::var("STACKD_EVENT_TOPIC") {
            self.events.topic = v;
        }
        if let Ok(v) = std::env::var("STACKD_CORS_ORIGINS") {
            self.api.cors_origins = v.split(',').map(|s| s.trim().to_string()).collect();
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    /// Host to bind to
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Secret for signing/validating bearer tokens
    #[serde(default)]
    pub jwt_secret: String,

    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            jwt_secret: String::new(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8090
}

/// System paths and settings
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    /// Root directory for daemon data (store, cluster configs, logs)
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    /// Log directory
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,

    /// SQLite database path
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            log_directory: default_log_directory(),
            database_path: default_database_path(),
        }
    }
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("/var/lib/stackd")
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("/var/log/stackd")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/stackd/state.db")
}

/// Docker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    /// Docker socket path
    #[serde(default = "default_docker_socket")]
    pub socket: String,

    /// API call timeout in seconds
    #[serde(default = "default_docker_timeout")]
    pub timeout_seconds: u64,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            timeout_seconds: default_docker_timeout(),
        }
    }
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".into()
}

fn default_docker_timeout() -> u64 {
    120
}

/// Event plane configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EventConfiguration {
    /// Durable log topic name
    #[serde(default = "default_event_topic")]
    pub topic: String,

    /// Number of partitions in the durable log
    #[serde(default = "default_event_partitions")]
    pub partitions: u32,

    /// Directory for durable log segments; relative paths resolve
    /// against the system data directory
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Maximum events per flushed batch
    #[serde(default = "default_batch_size")]
    pub batch_max_events: usize,

    /// Maximum time a batch may linger before flushing
    #[serde(default = "default_batch_linger_ms")]
    pub batch_linger_ms: u64,

    /// Per-client live stream queue depth
    #[serde(default = "default_live_queue")]
    pub live_queue_depth: usize,
}

impl EventConfiguration {
    pub fn log_directory(&self, system: &SystemConfiguration) -> PathBuf {
        match &self.log_dir {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => system.data_directory.join(p),
            None => system.data_directory.join("events"),
        }
    }

    pub fn batch_linger(&self) -> Duration {
        Duration::from_millis(self.batch_linger_ms)
    }
}

impl Default for EventConfiguration {
    fn default() -> Self {
        Self {
            topic: default_event_topic(),
            partitions: default_event_partitions(),
            log_dir: None,
            batch_max_events: default_batch_size(),
            batch_linger_ms: default_batch_linger_ms(),
            live_queue_depth: default_live_queue(),
        }
    }
}

fn default_event_topic() -> String {
    "infrastructure-events".into()
}

fn default_event_partitions() -> u32 {
    8
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_linger_ms() -> u64 {
    10
}

fn default_live_queue() -> usize {
    256
}

/// Redis cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfiguration {
    /// Enable the read-through cache
    #[serde(default)]
    pub enabled: bool,

    /// Redis URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// TTL for cached read models in seconds
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            ttl_seconds: default_cache_ttl(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_cache_ttl() -> u64 {
    300
}

/// PostgreSQL cluster provisioning defaults
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfiguration {
    /// Image for etcd DCS nodes
    #[serde(default = "default_etcd_image")]
    pub etcd_image: String,

    /// Image prefix for supervisor-managed PostgreSQL nodes; the
    /// requested major version is appended as the tag
    #[serde(default = "default_postgres_image")]
    pub node_image_prefix: String,

    /// Image for the HAProxy load balancer
    #[serde(default = "default_haproxy_image")]
    pub haproxy_image: String,

    /// Supervisor agent REST port inside node containers
    #[serde(default = "default_supervisor_port")]
    pub supervisor_port: u16,

    /// Maximum replicas bootstrapped concurrently
    #[serde(default = "default_replica_parallelism")]
    pub replica_parallelism: usize,
}

impl Default for PostgresConfiguration {
    fn default() -> Self {
        Self {
            etcd_image: default_etcd_image(),
            node_image_prefix: default_postgres_image(),
            haproxy_image: default_haproxy_image(),
            supervisor_port: default_supervisor_port(),
            replica_parallelism: default_replica_parallelism(),
        }
    }
}

fn default_etcd_image() -> String {
    "quay.io/coreos/etcd:v3.5.16".into()
}

fn default_postgres_image() -> String {
    "stackd/supervised-postgres".into()
}

fn default_haproxy_image() -> String {
    "haproxy:2.9-alpine".into()
}

fn default_supervisor_port() -> u16 {
    8008
}

fn default_replica_parallelism() -> usize {
    2
}

/// Provisioning timeouts and port allocation
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningConfiguration {
    /// Default per-resource create deadline in seconds
    #[serde(default = "default_create_deadline")]
    pub create_deadline_seconds: u64,

    /// Create deadline for PostgreSQL clusters in seconds
    #[serde(default = "default_cluster_deadline")]
    pub cluster_create_deadline_seconds: u64,

    /// Graceful stop timeout in seconds before force kill
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,

    /// First host port handed out by the allocator
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last host port handed out by the allocator
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
}

impl ProvisioningConfiguration {
    pub fn create_deadline(&self) -> Duration {
        Duration::from_secs(self.create_deadline_seconds)
    }

    pub fn cluster_create_deadline(&self) -> Duration {
        Duration::from_secs(self.cluster_create_deadline_seconds)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }
}

impl Default for ProvisioningConfiguration {
    fn default() -> Self {
        Self {
            create_deadline_seconds: default_create_deadline(),
            cluster_create_deadline_seconds: default_cluster_deadline(),
            stop_timeout_seconds: default_stop_timeout(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
        }
    }
}

fn default_create_deadline() -> u64 {
    300
}

fn default_cluster_deadline() -> u64 {
    600
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_port_range_start() -> u16 {
    20000
}

fn default_port_range_end() -> u16 {
    29999
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse_from_empty() {
        let config: Configuration = toml::from_str("").unwrap();
        assert_eq!(config.api.port, 8090);
        assert_eq!(config.events.batch_max_events, 100);
        assert_eq!(config.events.batch_linger_ms, 10);
        assert_eq!(config.events.live_queue_depth, 256);
        assert_eq!(config.provisioning.create_deadline_seconds, 300);
        assert_eq!(config.provisioning.cluster_create_deadline_seconds, 600);
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_load_requires_the_file() {
        let err = Configuration::load("/nonexistent/stackd.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_partial_file_overrides() {
        let config: Configuration = toml::from_str(
            r#"
            [api]
            port = 9000

            [events]
            topic = "infra"
            partitions = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.api.port, 9000);
        assert_eq!(config.events.topic, "infra");
        assert_eq!(config.events.partitions, 4);
        // Untouched sections keep their defaults
        assert_eq!(config.postgres.supervisor_port, 8008);
    }
}
