//! Container lifecycle operations

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, HealthStatusEnum, HostConfig, Mount, MountTypeEnum, PortBinding,
    RestartPolicy, RestartPolicyNameEnum,
};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::runtime::traits::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, HealthState,
    MountSpec, RestartPolicyKind, RuntimeError, RuntimeEvent, RuntimeResult,
};

use super::{map_docker_err, DockerRuntime};

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        self.client().ping().await.map_err(RuntimeError::Docker)?;
        Ok(())
    }

    async fn version(&self) -> RuntimeResult<String> {
        let version = self
            .client()
            .version()
            .await
            .map_err(RuntimeError::Docker)?;
        Ok(version.version.unwrap_or_else(|| "unknown".into()))
    }

    async fn ensure_image(&self, image: &str) -> RuntimeResult<()> {
        // Pull only when the image is absent locally
        if self.client().inspect_image(image).await.is_ok() {
            debug!("Image {} present, skipping pull", image);
            return Ok(());
        }

        info!("Pulling image {}", image);
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.client().create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(RuntimeError::ImagePull(format!("{}: {}", image, e)));
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.ensure_image(&spec.image).await?;

        let env_vars: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/{}", port.container, port.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());

            if let Some(host_port) = port.host {
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(host_port.to_string()),
                    }]),
                );
            }
        }

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| match m {
                MountSpec::Volume { name, target } => Mount {
                    target: Some(target.clone()),
                    source: Some(name.clone()),
                    typ: Some(MountTypeEnum::VOLUME),
                    ..Default::default()
                },
                MountSpec::Bind {
                    source,
                    target,
                    read_only,
                } => Mount {
                    target: Some(target.clone()),
                    source: Some(source.clone()),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(*read_only),
                    ..Default::default()
                },
            })
            .collect();

        let restart_policy = match spec.restart {
            RestartPolicyKind::Never => RestartPolicyNameEnum::NO,
            RestartPolicyKind::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
            RestartPolicyKind::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
        };

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            mounts: if mounts.is_empty() {
                None
            } else {
                Some(mounts)
            },
            memory: if spec.limits.memory > 0 {
                Some(spec.limits.memory as i64)
            } else {
                None
            },
            nano_cpus: if spec.limits.nano_cpus > 0 {
                Some(spec.limits.nano_cpus)
            } else {
                None
            },
            network_mode: spec.network.clone(),
            restart_policy: Some(RestartPolicy {
                name: Some(restart_policy),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut labels = spec.labels.clone();
        labels.insert("io.stackd.managed".to_string(), "true".to_string());

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(env_vars),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .client()
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                if let bollard::errors::Error::DockerResponseServerError {
                    status_code: 409, ..
                } = e
                {
                    return RuntimeError::ContainerExists(spec.name.clone());
                }
                RuntimeError::Docker(e)
            })?;

        // Aliases require a named network endpoint; attach after create
        if let (Some(network), false) = (&spec.network, spec.network_aliases.is_empty()) {
            use bollard::network::{ConnectNetworkOptions, DisconnectNetworkOptions};

            let disconnect = DisconnectNetworkOptions {
                container: response.id.as_str(),
                force: true,
            };
            let _ = self.client().disconnect_network(network, disconnect).await;

            let connect = ConnectNetworkOptions {
                container: response.id.as_str(),
                endpoint_config: bollard::models::EndpointSettings {
                    aliases: Some(spec.network_aliases.clone()),
                    ..Default::default()
                },
            };
            self.client()
                .connect_network(network, connect)
                .await
                .map_err(RuntimeError::Docker)?;
        }

        info!("Created container {} ({})", spec.name, short_id(&response.id));
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.client()
            .start_container::<String>(id, None)
            .await
            .map_err(|e| map_docker_err(id, e))?;
        debug!("Started container {}", short_id(id));
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.client()
            .stop_container(id, Some(options))
            .await
            .map_err(|e| map_docker_err(id, e))?;
        debug!("Stopped container {}", short_id(id));
        Ok(())
    }

    async fn kill_container(&self, id: &str, signal: &str) -> RuntimeResult<()> {
        let options = KillContainerOptions { signal };
        self.client()
            .kill_container(id, Some(options))
            .await
            .map_err(|e| map_docker_err(id, e))?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force,
            v: false,
            ..Default::default()
        };
        self.client()
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_docker_err(id, e))?;
        debug!("Removed container {}", short_id(id));
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerDetails> {
        let info = self
            .client()
            .inspect_container(id, None)
            .await
            .map_err(|e| map_docker_err(id, e))?;

        let state = info.state.unwrap_or_default();

        let status = match state.status {
            Some(ContainerStateStatusEnum::CREATED) => ContainerState::Created,
            Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
            Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
            Some(ContainerStateStatusEnum::REMOVING) => ContainerState::Removing,
            Some(ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
            Some(ContainerStateStatusEnum::DEAD) => ContainerState::Dead,
            _ => ContainerState::Unknown,
        };

        let health = state.health.and_then(|h| match h.status {
            Some(HealthStatusEnum::STARTING) => Some(HealthState::Starting),
            Some(HealthStatusEnum::HEALTHY) => Some(HealthState::Healthy),
            Some(HealthStatusEnum::UNHEALTHY) => Some(HealthState::Unhealthy),
            _ => None,
        });

        let started_at = state
            .started_at
            .filter(|s| !s.is_empty() && s != "0001-01-01T00:00:00Z")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        let networks = info
            .network_settings
            .and_then(|ns| ns.networks)
            .map(|nets| {
                nets.into_iter()
                    .filter_map(|(name, ep)| ep.ip_address.map(|ip| (name, ip)))
                    .collect()
            })
            .unwrap_or_default();

        let labels = info
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();

        Ok(ContainerDetails {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            state: status,
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
            started_at,
            health,
            networks,
            labels,
        })
    }

    async fn container_logs(&self, id: &str, tail: u32) -> RuntimeResult<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut logs = self.client().logs(id, Some(options));
        let mut result = Vec::new();

        while let Some(log) = logs.next().await {
            match log {
                Ok(output) => {
                    let line = output.to_string();
                    if !line.is_empty() {
                        result.push(line);
                    }
                }
                Err(e) => {
                    warn!("Error reading logs for {}: {}", short_id(id), e);
                    break;
                }
            }
        }

        Ok(result)
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> RuntimeResult<ExecOutput> {
        super::exec::run_exec(self, id, cmd).await
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<String> {
        super::network::create_network(self, name).await
    }

    async fn remove_network(&self, name: &str) -> RuntimeResult<()> {
        super::network::remove_network(self, name).await
    }

    async fn create_volume(&self, name: &str) -> RuntimeResult<String> {
        super::network::create_volume(self, name).await
    }

    async fn remove_volume(&self, name: &str, force: bool) -> RuntimeResult<()> {
        super::network::remove_volume(self, name, force).await
    }

    async fn container_stats(&self, id: &str) -> RuntimeResult<serde_json::Value> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = self.client().stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => serde_json::to_value(stats)
                .map_err(|e| RuntimeError::Other(format!("Failed to encode stats: {}", e))),
            Some(Err(e)) => Err(map_docker_err(id, e)),
            None => Err(RuntimeError::ContainerNotFound(id.to_string())),
        }
    }

    fn events(&self) -> BoxStream<'static, RuntimeResult<RuntimeEvent>> {
        super::events::event_stream(self)
    }
}

/// First 12 characters of a container id, for log lines
pub(crate) fn short_id(id: &str) -> &str {
    if id.len() > 12 {
        &id[..12]
    } else {
        id
    }
}
