//! Docker implementation of the container runtime

mod container;
mod events;
mod exec;
mod network;

use std::sync::Arc;

use bollard::Docker;

use crate::config::DockerConfiguration;

use super::traits::{RuntimeError, RuntimeResult};

/// Process-wide Docker client wrapper.
///
/// Cheap to clone; the inner client is shared and thread-safe.
#[derive(Clone)]
pub struct DockerRuntime {
    client: Arc<Docker>,
}

impl DockerRuntime {
    /// Connect to the engine over the configured unix socket
    pub fn new(config: &DockerConfiguration) -> RuntimeResult<Self> {
        let client = Docker::connect_with_socket(
            &config.socket,
            config.timeout_seconds,
            bollard::API_DEFAULT_VERSION,
        )
        .map_err(RuntimeError::Docker)?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Connect with the engine's default resolution order (env, socket)
    pub fn from_defaults() -> RuntimeResult<Self> {
        let client = Docker::connect_with_local_defaults().map_err(RuntimeError::Docker)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub(crate) fn client(&self) -> &Docker {
        &self.client
    }
}

/// Map a Docker 404 onto the typed not-found variant so callers can be
/// tolerant of already-removed containers.
pub(crate) fn map_docker_err(id: &str, e: bollard::errors::Error) -> RuntimeError {
    if let bollard::errors::Error::DockerResponseServerError {
        status_code: 404, ..
    } = e
    {
        return RuntimeError::ContainerNotFound(id.to_string());
    }
    RuntimeError::Docker(e)
}
