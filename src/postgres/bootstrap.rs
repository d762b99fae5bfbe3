//! Cluster create protocol
//!
//! Network → DCS quorum → primary → replicas → load balancer, with
//! cleanup of everything already materialized when a fatal step fails.
//! Replica failures are non-fatal: the cluster lands DEGRADED as long
//! as the primary is healthy.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::events::{EventAction, InfrastructureEvent};
use crate::resource::{ControllerError, ControllerResult, CreateOutcome, CreateRequest, ResourceKind};
use crate::runtime::{ContainerSpec, MountSpec, PortMap};
use crate::store::{
    ClusterNodeRow, EtcdNodeRow, InfraStatus, InfrastructureRow, NodeRole, PgClusterRow,
    ReplicationMode,
};

use super::{dcs, haproxy, ClusterSpec, PgClusterController};

/// Attempts × interval while waiting for the primary supervisor
const PRIMARY_READY_ATTEMPTS: u32 = 90;
const REPLICA_READY_ATTEMPTS: u32 = 60;
const READY_PROBE_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) async fn create_cluster(
    controller: &PgClusterController,
    ctx: CancellationToken,
    req: CreateRequest,
    spec: ClusterSpec,
) -> ControllerResult<CreateOutcome> {
    let cluster_id = format!("pg-{}", Uuid::new_v4());
    let infra_id = req
        .infra_id
        .clone()
        .unwrap_or_else(|| format!("pgc-{}", Uuid::new_v4()));
    let scope = spec
        .scope
        .clone()
        .unwrap_or_else(|| format!("pg-{}", req.declared_name));
    let network_name = format!("{}-net", scope);

    let replicator_password = spec
        .replicator_password
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    // Partial-progress tracker for cleanup
    let mut created = Created::default();

    let result = run_protocol(
        controller,
        &ctx,
        &req,
        &spec,
        &cluster_id,
        &infra_id,
        &scope,
        &network_name,
        &replicator_password,
        &mut created,
    )
    .await;

    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            error!(cluster = %cluster_id, "bootstrap failed, cleaning up: {}", e);
            cleanup_partial(controller, &infra_id, &network_name, &created).await;
            if req.infra_id.is_some() {
                // The placeholder row the caller persisted before
                // dispatching reflects the failure
                let _ = controller
                    .db
                    .infrastructure()
                    .update_status(&infra_id, InfraStatus::Failed)
                    .await;
            }
            Err(e)
        }
    }
}

/// Everything materialized so far, for teardown on a fatal error
#[derive(Default)]
struct Created {
    network: bool,
    etcd: Vec<EtcdNodeRow>,
    nodes: Vec<ClusterNodeRow>,
    haproxy: Option<String>,
}

#[allow(clippy::too_many_arguments)]
async fn run_protocol(
    controller: &PgClusterController,
    ctx: &CancellationToken,
    req: &CreateRequest,
    spec: &ClusterSpec,
    cluster_id: &str,
    infra_id: &str,
    scope: &str,
    network_name: &str,
    replicator_password: &str,
    created: &mut Created,
) -> ControllerResult<CreateOutcome> {
    // 1. Dedicated bridge network
    controller.runtime.create_network(network_name).await?;
    created.network = true;

    if ctx.is_cancelled() {
        return Err(ControllerError::Cancelled);
    }

    // 2. DCS quorum
    let etcd_rows = dcs::launch_quorum(
        controller,
        cluster_id,
        infra_id,
        scope,
        network_name,
        spec.etcd_count,
    )
    .await?;
    created.etcd = etcd_rows.clone();

    dcs::wait_for_quorum(ctx, &etcd_rows).await?;

    let ha = spec.etcd_count > 1;
    if !ha {
        warn!(cluster = %cluster_id, "single-member DCS: cluster is functional but not HA");
    }

    let dcs_endpoints = dcs::client_endpoints(&etcd_rows);

    // 3. Primary bootstrap
    let primary = launch_node(
        controller,
        NodeLaunch {
            cluster_id,
            infra_id,
            scope,
            network: network_name,
            index: 0,
            is_leader: true,
            version: &spec.version,
            replication_mode: spec.replication_mode,
            postgres_password: &spec.password,
            replicator_password,
            dcs_endpoints: &dcs_endpoints,
        },
    )
    .await?;
    created.nodes.push(primary.clone());

    wait_for_role(controller, ctx, primary.supervisor_port, NodeRole::Primary,
        PRIMARY_READY_ATTEMPTS)
        .await?;
    info!(cluster = %cluster_id, node = %primary.name, "primary ready");

    // 4. Replica bootstrap, bounded parallelism, failures tolerated
    let parallelism = controller.config.replica_parallelism.clamp(1, 2);
    let mut degraded = false;
    let mut replica_index = 1u32;

    while replica_index < spec.node_count {
        let batch_end = (replica_index + parallelism as u32).min(spec.node_count);
        let mut handles = Vec::new();

        for k in replica_index..batch_end {
            let launch = NodeLaunch {
                cluster_id,
                infra_id,
                scope,
                network: network_name,
                index: k,
                is_leader: false,
                version: &spec.version,
                replication_mode: spec.replication_mode,
                postgres_password: &spec.password,
                replicator_password,
                dcs_endpoints: &dcs_endpoints,
            };
            handles.push(bootstrap_replica(controller, ctx, launch));
        }

        for result in futures::future::join_all(handles).await {
            match result {
                Ok(node) => {
                    if !node.is_healthy {
                        degraded = true;
                    }
                    created.nodes.push(node);
                }
                Err(ControllerError::Cancelled) => return Err(ControllerError::Cancelled),
                Err(e) => {
                    warn!(cluster = %cluster_id, "replica bootstrap failed (continuing): {}", e);
                    degraded = true;
                }
            }
        }

        replica_index = batch_end;
    }

    if ctx.is_cancelled() {
        return Err(ControllerError::Cancelled);
    }

    // 5. Load balancer
    let (primary_port, replica_port) =
        resolve_haproxy_ports(controller, spec, infra_id).await?;
    let haproxy_id = haproxy::launch(
        controller,
        cluster_id,
        scope,
        network_name,
        &created.nodes,
        primary_port,
        replica_port,
    )
    .await?;
    created.haproxy = Some(haproxy_id.clone());

    // 6. Persist and announce
    let status = if degraded {
        InfraStatus::Degraded
    } else {
        InfraStatus::Running
    };

    let now = Utc::now();
    let cluster_row = PgClusterRow {
        id: cluster_id.to_string(),
        infrastructure_id: infra_id.to_string(),
        scope: scope.to_string(),
        version: spec.version.clone(),
        node_count: spec.node_count,
        replication_mode: spec.replication_mode,
        primary_node_id: Some(primary.id.clone()),
        dcs_endpoints,
        network_id: network_name.to_string(),
        haproxy_container_id: Some(haproxy_id),
        haproxy_primary_port: primary_port,
        haproxy_replica_port: replica_port,
        postgres_password: spec.password.clone(),
        replicator_password: replicator_password.to_string(),
        status,
        ha,
        created_at: now,
        updated_at: now,
    };

    // A detached standalone create persisted a CREATING placeholder
    // before dispatching; finish it instead of inserting
    if controller.db.infrastructure().get(infra_id).await?.is_some() {
        controller
            .db
            .infrastructure()
            .update_status(infra_id, status)
            .await?;
        controller
            .db
            .infrastructure()
            .set_container(infra_id, Some(&primary.container_id))
            .await?;
        controller
            .db
            .infrastructure()
            .set_detail(infra_id, &serde_json::json!({ "cluster_id": cluster_id }))
            .await?;
    } else {
        controller
            .db
            .infrastructure()
            .insert(&InfrastructureRow {
                id: infra_id.to_string(),
                owner_id: req.owner_id.clone(),
                kind: ResourceKind::PostgresCluster,
                name: req.declared_name.clone(),
                status,
                container_id: Some(primary.container_id.clone()),
                detail: serde_json::json!({ "cluster_id": cluster_id }),
                created_at: now,
                updated_at: now,
            })
            .await?;
    }
    controller.db.clusters().insert(&cluster_row).await?;
    for node in &created.nodes {
        controller.db.clusters().insert_node(node).await?;
    }
    for etcd in &created.etcd {
        controller.db.clusters().insert_etcd_node(etcd).await?;
    }

    controller.bus.publish(
        InfrastructureEvent::new(
            infra_id,
            &req.owner_id,
            ResourceKind::PostgresCluster,
            EventAction::ClusterCreated,
        )
        .with_metadata(serde_json::json!({
            "cluster_id": cluster_id,
            "status": status.as_str(),
            "node_count": created.nodes.len(),
            "ha": ha,
            "stack_id": req.stack_id,
        })),
    );

    info!(
        cluster = %cluster_id,
        nodes = created.nodes.len(),
        %status,
        "cluster created"
    );

    let mut outputs = HashMap::new();
    outputs.insert("cluster_id".to_string(), cluster_id.to_string());
    outputs.insert(
        "primary_endpoint".to_string(),
        format!("localhost:{}", primary_port),
    );
    if spec.node_count > 1 {
        outputs.insert(
            "replica_endpoint".to_string(),
            format!("localhost:{}", replica_port),
        );
    }
    outputs.insert("container_id".to_string(), primary.container_id.clone());

    Ok(CreateOutcome {
        infra_id: infra_id.to_string(),
        outputs,
        status,
    })
}

pub(crate) struct NodeLaunch<'a> {
    pub cluster_id: &'a str,
    pub infra_id: &'a str,
    pub scope: &'a str,
    pub network: &'a str,
    pub index: u32,
    pub is_leader: bool,
    pub version: &'a str,
    pub replication_mode: ReplicationMode,
    pub postgres_password: &'a str,
    pub replicator_password: &'a str,
    pub dcs_endpoints: &'a [String],
}

/// Start one supervisor-managed postgres node container.
pub(crate) async fn launch_node(
    controller: &PgClusterController,
    launch: NodeLaunch<'_>,
) -> ControllerResult<ClusterNodeRow> {
    let name = format!("{}-node-{}", launch.scope, launch.index);
    let volume_name = format!("{}-data", name);

    let pg_host_port = controller
        .db
        .infrastructure()
        .allocate_port(
            controller.provisioning.port_range_start,
            controller.provisioning.port_range_end,
            launch.infra_id,
        )
        .await?;
    let supervisor_host_port = controller
        .db
        .infrastructure()
        .allocate_port(
            controller.provisioning.port_range_start,
            controller.provisioning.port_range_end,
            launch.infra_id,
        )
        .await?;

    controller.runtime.create_volume(&volume_name).await?;

    let mut env = HashMap::new();
    env.insert("PATRONI_SCOPE".to_string(), launch.scope.to_string());
    env.insert("PATRONI_NAME".to_string(), name.clone());
    env.insert(
        "ETCD_HOSTS".to_string(),
        launch.dcs_endpoints.join(","),
    );
    env.insert("PG_VERSION".to_string(), launch.version.to_string());
    env.insert(
        "POSTGRES_PASSWORD".to_string(),
        launch.postgres_password.to_string(),
    );
    env.insert(
        "REPLICATOR_PASSWORD".to_string(),
        launch.replicator_password.to_string(),
    );
    env.insert(
        "REPLICATION_MODE".to_string(),
        launch.replication_mode.as_str().to_string(),
    );
    if launch.is_leader {
        env.insert("IS_LEADER".to_string(), "true".to_string());
    }

    let mut labels = HashMap::new();
    labels.insert("io.stackd.cluster".to_string(), launch.cluster_id.to_string());
    labels.insert("io.stackd.role".to_string(), "postgres".to_string());

    let image = format!("{}:{}", controller.config.node_image_prefix, launch.version);
    let spec = ContainerSpec {
        name: name.clone(),
        image,
        command: None,
        env,
        ports: vec![
            PortMap::tcp(haproxy::PG_PORT, pg_host_port),
            PortMap::tcp(controller.config.supervisor_port, supervisor_host_port),
        ],
        mounts: vec![MountSpec::Volume {
            name: volume_name.clone(),
            target: "/var/lib/postgresql/data".to_string(),
        }],
        network: Some(launch.network.to_string()),
        network_aliases: vec![name.clone()],
        labels,
        limits: Default::default(),
        restart: Default::default(),
    };

    let container_id = controller.runtime.create_container(&spec).await?;
    controller.runtime.start_container(&container_id).await?;

    Ok(ClusterNodeRow {
        id: format!("node-{}", Uuid::new_v4()),
        cluster_id: launch.cluster_id.to_string(),
        container_id,
        name,
        role: if launch.is_leader {
            NodeRole::Primary
        } else {
            NodeRole::Replica
        },
        port: pg_host_port,
        supervisor_port: supervisor_host_port,
        volume_id: volume_name,
        replication_lag_bytes: 0,
        is_healthy: true,
        last_probe_at: None,
    })
}

/// Launch a replica and wait until its supervisor reports the replica
/// role (base backup finished, streaming joined). A replica that
/// launched but never joined is returned unhealthy so the caller can
/// record it and land the cluster DEGRADED.
async fn bootstrap_replica(
    controller: &PgClusterController,
    ctx: &CancellationToken,
    launch: NodeLaunch<'_>,
) -> ControllerResult<ClusterNodeRow> {
    let mut node = launch_node(controller, launch).await?;
    match wait_for_role(
        controller,
        ctx,
        node.supervisor_port,
        NodeRole::Replica,
        REPLICA_READY_ATTEMPTS,
    )
    .await
    {
        Ok(()) => {}
        Err(ControllerError::Cancelled) => return Err(ControllerError::Cancelled),
        Err(_) => {
            warn!(node = %node.name, "replica never reported the replica role");
            node.is_healthy = false;
        }
    }
    Ok(node)
}

/// Poll the supervisor until the node reports the wanted role.
pub(crate) async fn wait_for_role(
    controller: &PgClusterController,
    ctx: &CancellationToken,
    supervisor_port: u16,
    role: NodeRole,
    attempts: u32,
) -> ControllerResult<()> {
    for _ in 0..attempts {
        if ctx.is_cancelled() {
            return Err(ControllerError::Cancelled);
        }

        let ready = match role {
            NodeRole::Primary => controller.supervisor.is_primary(supervisor_port).await,
            NodeRole::Replica => controller.supervisor.is_replica(supervisor_port).await,
        };
        if ready {
            return Ok(());
        }

        tokio::select! {
            _ = ctx.cancelled() => return Err(ControllerError::Cancelled),
            _ = tokio::time::sleep(READY_PROBE_INTERVAL) => {}
        }
    }

    Err(ControllerError::Timeout)
}

async fn resolve_haproxy_ports(
    controller: &PgClusterController,
    spec: &ClusterSpec,
    infra_id: &str,
) -> ControllerResult<(u16, u16)> {
    let primary = match spec.primary_port {
        Some(port) => {
            controller.db.infrastructure().reserve_port(port, infra_id).await?;
            port
        }
        None => {
            controller
                .db
                .infrastructure()
                .allocate_port(
                    controller.provisioning.port_range_start,
                    controller.provisioning.port_range_end,
                    infra_id,
                )
                .await?
        }
    };
    let replica = match spec.replica_port {
        Some(port) => {
            controller.db.infrastructure().reserve_port(port, infra_id).await?;
            port
        }
        None => {
            controller
                .db
                .infrastructure()
                .allocate_port(
                    controller.provisioning.port_range_start,
                    controller.provisioning.port_range_end,
                    infra_id,
                )
                .await?
        }
    };
    Ok((primary, replica))
}

/// Best-effort teardown of partial progress after a failed bootstrap.
async fn cleanup_partial(
    controller: &PgClusterController,
    infra_id: &str,
    network_name: &str,
    created: &Created,
) {
    if let Some(haproxy) = &created.haproxy {
        controller.remove_container_tolerant(haproxy).await;
    }

    for node in &created.nodes {
        controller.remove_container_tolerant(&node.container_id).await;
        if let Err(e) = controller.runtime.remove_volume(&node.volume_id, true).await {
            warn!(volume = %node.volume_id, "cleanup volume removal failed: {}", e);
        }
    }

    for etcd in &created.etcd {
        controller.remove_container_tolerant(&etcd.container_id).await;
    }

    if created.network {
        if let Err(e) = controller.runtime.remove_network(network_name).await {
            warn!(network = %network_name, "cleanup network removal failed: {}", e);
        }
    }

    if let Err(e) = controller.db.infrastructure().release_ports(infra_id).await {
        warn!(infra = %infra_id, "cleanup port release failed: {}", e);
    }
}
