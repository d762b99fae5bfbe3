//! HAProxy load balancer for cluster traffic
//!
//! Two listeners: `primary` routes writes to whichever node's
//! supervisor answers `GET /primary` with 200, `replicas` round-robins
//! reads over nodes answering `GET /replica`. Membership changes
//! rewrite the config file and HUP the process.

use std::collections::HashMap;

use tracing::info;

use crate::resource::{ControllerError, ControllerResult};
use crate::runtime::{ContainerSpec, MountSpec, PortMap};
use crate::store::ClusterNodeRow;

use super::PgClusterController;

/// Container-side listener ports
const PRIMARY_LISTEN: u16 = 5000;
const REPLICA_LISTEN: u16 = 5001;

/// Postgres port on the cluster network
pub(crate) const PG_PORT: u16 = 5432;

/// Render the HAProxy configuration for the current membership.
pub(crate) fn render_config(nodes: &[ClusterNodeRow], supervisor_port: u16) -> String {
    let mut out = String::new();

    out.push_str(
        "global\n    maxconn 256\n\ndefaults\n    mode tcp\n    timeout connect 5s\n    timeout client 60m\n    timeout server 60m\n\n",
    );

    out.push_str(&format!(
        "listen primary\n    bind *:{}\n    option httpchk GET /primary\n    http-check expect status 200\n    default-server inter 3s fall 3 rise 2\n",
        PRIMARY_LISTEN
    ));
    for node in nodes {
        out.push_str(&format!(
            "    server {} {}:{} check port {}\n",
            node.name, node.name, PG_PORT, supervisor_port
        ));
    }

    out.push_str(&format!(
        "\nlisten replicas\n    bind *:{}\n    balance roundrobin\n    option httpchk GET /replica\n    http-check expect status 200\n    default-server inter 3s fall 3 rise 2\n",
        REPLICA_LISTEN
    ));
    for node in nodes {
        out.push_str(&format!(
            "    server {} {}:{} check port {}\n",
            node.name, node.name, PG_PORT, supervisor_port
        ));
    }

    out
}

/// Write the config file for a cluster and return its host path.
pub(crate) async fn write_config(
    controller: &PgClusterController,
    cluster_id: &str,
    nodes: &[ClusterNodeRow],
) -> ControllerResult<std::path::PathBuf> {
    let dir = controller.data_dir.join("clusters").join(cluster_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| ControllerError::Other(e.to_string()))?;

    let path = dir.join("haproxy.cfg");
    let content = render_config(nodes, controller.config.supervisor_port);
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| ControllerError::Other(e.to_string()))?;

    Ok(path)
}

/// Launch the load balancer container.
pub(crate) async fn launch(
    controller: &PgClusterController,
    cluster_id: &str,
    scope: &str,
    network: &str,
    nodes: &[ClusterNodeRow],
    primary_port: u16,
    replica_port: u16,
) -> ControllerResult<String> {
    let config_path = write_config(controller, cluster_id, nodes).await?;

    let mut labels = HashMap::new();
    labels.insert("io.stackd.cluster".to_string(), cluster_id.to_string());
    labels.insert("io.stackd.role".to_string(), "haproxy".to_string());

    let name = format!("{}-haproxy", scope);
    let spec = ContainerSpec {
        name: name.clone(),
        image: controller.config.haproxy_image.clone(),
        command: None,
        env: HashMap::new(),
        ports: vec![
            PortMap::tcp(PRIMARY_LISTEN, primary_port),
            PortMap::tcp(REPLICA_LISTEN, replica_port),
        ],
        mounts: vec![MountSpec::Bind {
            source: config_path.to_string_lossy().into_owned(),
            target: "/usr/local/etc/haproxy/haproxy.cfg".to_string(),
            read_only: true,
        }],
        network: Some(network.to_string()),
        network_aliases: vec![name],
        labels,
        limits: Default::default(),
        restart: Default::default(),
    };

    let container_id = controller.runtime.create_container(&spec).await?;
    controller.runtime.start_container(&container_id).await?;

    info!(cluster = %cluster_id, primary_port, replica_port, "haproxy launched");
    Ok(container_id)
}

/// Rewrite the config for the current membership and HUP the process.
pub(crate) async fn refresh(
    controller: &PgClusterController,
    cluster_id: &str,
) -> ControllerResult<()> {
    let cluster = controller.db.clusters().require(cluster_id).await?;
    let nodes = controller.db.clusters().nodes(cluster_id).await?;

    write_config(controller, cluster_id, &nodes).await?;

    if let Some(haproxy) = &cluster.haproxy_container_id {
        controller.runtime.kill_container(haproxy, "SIGHUP").await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodeRole;

    fn node(name: &str, role: NodeRole) -> ClusterNodeRow {
        ClusterNodeRow {
            id: name.to_string(),
            cluster_id: "c-1".to_string(),
            container_id: format!("cont-{}", name),
            name: name.to_string(),
            role,
            port: 20010,
            supervisor_port: 20011,
            volume_id: format!("vol-{}", name),
            replication_lag_bytes: 0,
            is_healthy: true,
            last_probe_at: None,
        }
    }

    #[test]
    fn test_config_probes_roles_with_required_timings() {
        let nodes = vec![
            node("pg-web-node-0", NodeRole::Primary),
            node("pg-web-node-1", NodeRole::Replica),
        ];

        let config = render_config(&nodes, 8008);

        assert!(config.contains("option httpchk GET /primary"));
        assert!(config.contains("option httpchk GET /replica"));
        assert!(config.contains("inter 3s fall 3 rise 2"));
        assert!(config.contains("balance roundrobin"));
        // Every node appears in both pools; the probes decide routing
        assert_eq!(config.matches("server pg-web-node-0").count(), 2);
        assert_eq!(config.matches("server pg-web-node-1").count(), 2);
        assert!(config.contains("check port 8008"));
    }
}
