//! Network and volume operations

use bollard::network::CreateNetworkOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use tracing::{debug, info};

use crate::runtime::traits::{RuntimeError, RuntimeResult};

use super::DockerRuntime;

/// Create a bridge network, reusing an existing one with the same name.
pub(crate) async fn create_network(runtime: &DockerRuntime, name: &str) -> RuntimeResult<String> {
    // Reuse if present
    if let Ok(existing) = runtime.client().inspect_network::<String>(name, None).await {
        if let Some(id) = existing.id {
            debug!("Reusing network {}", name);
            return Ok(id);
        }
    }

    let options = CreateNetworkOptions {
        name,
        driver: "bridge",
        check_duplicate: true,
        ..Default::default()
    };

    let response = runtime
        .client()
        .create_network(options)
        .await
        .map_err(RuntimeError::Docker)?;

    info!("Created network {}", name);
    Ok(response.id.unwrap_or_else(|| name.to_string()))
}

pub(crate) async fn remove_network(runtime: &DockerRuntime, name: &str) -> RuntimeResult<()> {
    match runtime.client().remove_network(name).await {
        Ok(()) => {
            info!("Removed network {}", name);
            Ok(())
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            // Already gone
            Ok(())
        }
        Err(e) => Err(RuntimeError::Docker(e)),
    }
}

pub(crate) async fn create_volume(runtime: &DockerRuntime, name: &str) -> RuntimeResult<String> {
    let options = CreateVolumeOptions {
        name,
        ..Default::default()
    };

    let volume = runtime
        .client()
        .create_volume(options)
        .await
        .map_err(RuntimeError::Docker)?;

    debug!("Created volume {}", volume.name);
    Ok(volume.name)
}

pub(crate) async fn remove_volume(
    runtime: &DockerRuntime,
    name: &str,
    force: bool,
) -> RuntimeResult<()> {
    let options = RemoveVolumeOptions { force };

    match runtime.client().remove_volume(name, Some(options)).await {
        Ok(()) => {
            debug!("Removed volume {}", name);
            Ok(())
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(()),
        Err(e) => Err(RuntimeError::Docker(e)),
    }
}
