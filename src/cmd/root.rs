//! Main daemon command - wires the subsystems and serves the API

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stackd::cache::Cache;
use stackd::config::Configuration;
use stackd::events::{
    DurableEventSink, EventBus, EventConsumer, LiveStreamHub, RuntimeEventBridge,
};
use stackd::postgres::{spawn_health_loop, PgClusterController};
use stackd::resource::{DockerServiceController, NginxGatewayController, ResourceController};
use stackd::router::{self, AppState};
use stackd::runtime::{ContainerRuntime, DockerRuntime};
use stackd::stack::StackOrchestrator;
use stackd::store::Database;

/// Run the daemon
pub async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = Arc::new(Configuration::load(config_path)?);

    info!("  API: {}:{}", config.api.host, config.api.port);
    info!("  Data directory: {}", config.system.data_directory.display());
    info!("  Docker socket: {}", config.docker.socket);

    if config.api.jwt_secret.is_empty() {
        warn!("STACKD_JWT_SECRET is not set; every bearer token will be rejected");
    }

    // Service lifetime token; every background job derives from it
    let lifetime = CancellationToken::new();

    // Persistence
    let db = Arc::new(Database::open(&config.system.database_path)?);

    // Container runtime (process-wide client)
    let docker = DockerRuntime::new(&config.docker)?;
    if let Err(e) = docker.ping().await {
        error!("Docker engine unreachable: {}", e);
        return Err(e.into());
    }
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    info!("Docker engine connected");

    // Cache
    let cache = Arc::new(Cache::new(&config.cache));
    if config.cache.enabled {
        if let Err(e) = cache.connect(&config.cache.url).await {
            warn!("Cache connection failed, continuing without: {}", e);
        }
    }

    // Event plane
    let bus = EventBus::new();
    let hub = Arc::new(LiveStreamHub::new(config.events.live_queue_depth));
    let sink = DurableEventSink::new(&config.events, &config.system);

    let (durable_tx, committed_rx) = sink.spawn(lifetime.clone());
    bus.attach_durable(durable_tx);
    bus.attach_live(hub.clone());

    let consumer = EventConsumer::new(cache.clone());
    let _consumer_task = consumer.spawn(committed_rx, lifetime.clone());

    // Controllers
    let services = Arc::new(DockerServiceController::new(
        runtime.clone(),
        db.clone(),
        config.provisioning.clone(),
    ));
    let gateways = Arc::new(NginxGatewayController::new(
        runtime.clone(),
        db.clone(),
        config.provisioning.clone(),
        config.system.data_directory.clone(),
    ));
    let clusters = Arc::new(PgClusterController::new(
        runtime.clone(),
        db.clone(),
        bus.clone(),
        config.postgres.clone(),
        config.provisioning.clone(),
        config.system.data_directory.clone(),
    ));

    // Orchestrator
    let mut orchestrator = StackOrchestrator::new(db.clone(), bus.clone(), lifetime.clone());
    orchestrator.register_controller(services.clone() as Arc<dyn ResourceController>);
    orchestrator.register_controller(gateways.clone() as Arc<dyn ResourceController>);
    orchestrator.register_controller(clusters.clone() as Arc<dyn ResourceController>);
    let orchestrator = Arc::new(orchestrator);

    // Runtime event bridge
    let bridge = RuntimeEventBridge::new(runtime.clone(), db.clone(), bus.clone());
    let _bridge_task = bridge.spawn(lifetime.clone());
    info!("Runtime event bridge started");

    // Cluster health loop
    let _health_task = spawn_health_loop(clusters.clone(), lifetime.clone());

    // HTTP surface
    let state = AppState {
        orchestrator,
        clusters,
        gateways,
        services,
        runtime,
        db,
        bus,
        hub,
        sink,
        cache,
        config: config.clone(),
        lifetime: lifetime.clone(),
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port).parse()?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let shutdown_token = lifetime.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("Failed to install CTRL+C handler");
            return;
        }
        warn!("Received shutdown signal, draining...");

        // Cancel background tasks; the sink flushes its tail on cancel
        shutdown_token.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    info!("Starting HTTP server on {}", bind_addr);
    axum_server::bind(bind_addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    info!("Daemon stopped");
    Ok(())
}
