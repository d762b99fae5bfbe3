//! DCS (etcd) quorum bootstrap and readiness probing

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::resource::{ControllerError, ControllerResult};
use crate::runtime::{ContainerSpec, PortMap};
use crate::store::EtcdNodeRow;

use super::PgClusterController;

/// In-network etcd ports
pub(crate) const ETCD_CLIENT_PORT: u16 = 2379;
pub(crate) const ETCD_PEER_PORT: u16 = 2380;

/// Probe schedule: 2s for the first 20 attempts, 3s for the next 20,
/// then 5s, capped at 90 attempts (~3 minutes wall time at the tail).
const MAX_PROBE_ATTEMPTS: u32 = 90;

fn probe_interval(attempt: u32) -> Duration {
    match attempt {
        0..=19 => Duration::from_secs(2),
        20..=39 => Duration::from_secs(3),
        _ => Duration::from_secs(5),
    }
}

/// Launch the etcd containers for a cluster.
///
/// Every member advertises a stable peer URL on the cluster network and
/// carries the full `initial-cluster` membership. The client port is
/// additionally host-mapped so the daemon can probe readiness from
/// outside the network.
pub(crate) async fn launch_quorum(
    controller: &PgClusterController,
    cluster_id: &str,
    infra_id: &str,
    scope: &str,
    network: &str,
    etcd_count: u32,
) -> ControllerResult<Vec<EtcdNodeRow>> {
    let member_names: Vec<String> = (0..etcd_count)
        .map(|k| format!("{}-etcd-{}", scope, k))
        .collect();

    let initial_cluster = member_names
        .iter()
        .map(|name| format!("{}=http://{}:{}", name, name, ETCD_PEER_PORT))
        .collect::<Vec<_>>()
        .join(",");

    let mut rows = Vec::new();

    for name in &member_names {
        let client_host_port = controller
            .db
            .infrastructure()
            .allocate_port(
                controller.provisioning.port_range_start,
                controller.provisioning.port_range_end,
                infra_id,
            )
            .await?;

        let mut env = HashMap::new();
        env.insert("ETCD_NAME".to_string(), name.clone());
        env.insert(
            "ETCD_INITIAL_ADVERTISE_PEER_URLS".to_string(),
            format!("http://{}:{}", name, ETCD_PEER_PORT),
        );
        env.insert(
            "ETCD_LISTEN_PEER_URLS".to_string(),
            format!("http://0.0.0.0:{}", ETCD_PEER_PORT),
        );
        env.insert(
            "ETCD_LISTEN_CLIENT_URLS".to_string(),
            format!("http://0.0.0.0:{}", ETCD_CLIENT_PORT),
        );
        env.insert(
            "ETCD_ADVERTISE_CLIENT_URLS".to_string(),
            format!("http://{}:{}", name, ETCD_CLIENT_PORT),
        );
        env.insert("ETCD_INITIAL_CLUSTER".to_string(), initial_cluster.clone());
        env.insert("ETCD_INITIAL_CLUSTER_STATE".to_string(), "new".to_string());
        env.insert("ETCD_INITIAL_CLUSTER_TOKEN".to_string(), scope.to_string());
        env.insert("ALLOW_NONE_AUTHENTICATION".to_string(), "yes".to_string());

        let mut labels = HashMap::new();
        labels.insert("io.stackd.cluster".to_string(), cluster_id.to_string());
        labels.insert("io.stackd.role".to_string(), "etcd".to_string());

        let spec = ContainerSpec {
            name: name.clone(),
            image: controller.config.etcd_image.clone(),
            command: None,
            env,
            ports: vec![
                PortMap::tcp(ETCD_CLIENT_PORT, client_host_port),
                PortMap::internal(ETCD_PEER_PORT),
            ],
            mounts: Vec::new(),
            network: Some(network.to_string()),
            network_aliases: vec![name.clone()],
            labels,
            limits: Default::default(),
            restart: Default::default(),
        };

        let container_id = controller.runtime.create_container(&spec).await?;
        controller.runtime.start_container(&container_id).await?;

        rows.push(EtcdNodeRow {
            id: format!("etcd-{}", uuid::Uuid::new_v4()),
            cluster_id: cluster_id.to_string(),
            container_id,
            name: name.clone(),
            peer_port: ETCD_PEER_PORT,
            client_port: client_host_port,
        });
    }

    info!(cluster = %cluster_id, members = etcd_count, "etcd members launched");
    Ok(rows)
}

/// Poll the DCS until a quorum of members answers health probes.
///
/// Required reachable members: ⌈n/2⌉+1 capped at the member count; a
/// single-member DCS needs just itself.
pub(crate) async fn wait_for_quorum(
    ctx: &CancellationToken,
    members: &[EtcdNodeRow],
) -> ControllerResult<()> {
    let quorum = quorum_size(members.len());
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_default();

    for attempt in 0..MAX_PROBE_ATTEMPTS {
        if ctx.is_cancelled() {
            return Err(ControllerError::Cancelled);
        }

        let mut healthy = 0usize;
        for member in members {
            if probe_member(&http, member.client_port).await {
                healthy += 1;
            }
        }

        if healthy >= quorum {
            info!(healthy, quorum, "DCS quorum reached");
            return Ok(());
        }

        debug!(
            attempt,
            healthy, quorum, "DCS not ready yet, backing off"
        );

        tokio::select! {
            _ = ctx.cancelled() => return Err(ControllerError::Cancelled),
            _ = tokio::time::sleep(probe_interval(attempt)) => {}
        }
    }

    Err(ControllerError::DcsTimeout(format!(
        "quorum of {} not reached after {} attempts",
        quorum, MAX_PROBE_ATTEMPTS
    )))
}

/// HTTP `/health` first; plain TCP connect as the fallback for etcd
/// builds without the health endpoint.
async fn probe_member(http: &reqwest::Client, client_port: u16) -> bool {
    let url = format!("http://127.0.0.1:{}/health", client_port);
    match http.get(&url).send().await {
        Ok(response) if response.status().is_success() => {
            let body = response.text().await.unwrap_or_default();
            // etcd answers {"health":"true"} (string, not bool)
            body.contains("true")
        }
        Ok(_) => false,
        Err(e) => {
            debug!(port = client_port, "HTTP probe failed ({}), trying TCP", e);
            tokio::net::TcpStream::connect(("127.0.0.1", client_port))
                .await
                .is_ok()
        }
    }
}

pub(crate) fn quorum_size(member_count: usize) -> usize {
    if member_count <= 1 {
        return member_count;
    }
    (member_count.div_ceil(2) + 1).min(member_count)
}

/// In-network client URLs handed to the supervisor agents
pub(crate) fn client_endpoints(members: &[EtcdNodeRow]) -> Vec<String> {
    members
        .iter()
        .map(|m| format!("http://{}:{}", m.name, ETCD_CLIENT_PORT))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_size() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(3), 3);
        assert_eq!(quorum_size(5), 4);
    }

    #[test]
    fn test_probe_schedule() {
        assert_eq!(probe_interval(0), Duration::from_secs(2));
        assert_eq!(probe_interval(19), Duration::from_secs(2));
        assert_eq!(probe_interval(20), Duration::from_secs(3));
        assert_eq!(probe_interval(39), Duration::from_secs(3));
        assert_eq!(probe_interval(40), Duration::from_secs(5));
        assert_eq!(probe_interval(89), Duration::from_secs(5));
    }

    #[test]
    fn test_client_endpoints_use_network_names() {
        let members = vec![EtcdNodeRow {
            id: "e-1".to_string(),
            cluster_id: "c-1".to_string(),
            container_id: "cont-1".to_string(),
            name: "pg-web-etcd-0".to_string(),
            peer_port: ETCD_PEER_PORT,
            client_port: 21000,
        }];
        assert_eq!(
            client_endpoints(&members),
            vec!["http://pg-web-etcd-0:2379".to_string()]
        );
    }
}
