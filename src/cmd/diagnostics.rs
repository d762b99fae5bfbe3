//! Diagnostics command - checks daemon prerequisites

use anyhow::Result;

use stackd::config::Configuration;
use stackd::runtime::{ContainerRuntime, DockerRuntime};
use stackd::store::Database;

pub async fn run(config_path: &str) -> Result<()> {
    println!("stackd v{}", env!("CARGO_PKG_VERSION"));

    let config = Configuration::load(config_path)?;
    println!("config:        {} (loaded)", config_path);
    println!("data dir:      {}", config.system.data_directory.display());
    println!("database:      {}", config.system.database_path.display());
    println!("event topic:   {} ({} partitions)", config.events.topic, config.events.partitions);
    println!(
        "cache:         {}",
        if config.cache.enabled { config.cache.url.as_str() } else { "disabled" }
    );

    match DockerRuntime::new(&config.docker) {
        Ok(runtime) => match runtime.ping().await {
            Ok(()) => {
                let version = runtime.version().await.unwrap_or_else(|_| "unknown".into());
                println!("docker:        ok (engine {})", version);
            }
            Err(e) => println!("docker:        UNREACHABLE ({})", e),
        },
        Err(e) => println!("docker:        FAILED to construct client ({})", e),
    }

    match Database::open(&config.system.database_path) {
        Ok(_) => println!("store:         ok"),
        Err(e) => println!("store:         FAILED ({})", e),
    }

    Ok(())
}
