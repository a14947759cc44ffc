//! Unit Spawner CLI

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use unit_spawner::{DockerRuntime, Spawner, SpawnerConfig};

#[derive(Parser)]
#[command(name = "unit-spawner")]
#[command(about = "Spawn a disposable container for every TCP connection", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.json")]
    config: PathBuf,

    /// Override the Docker socket path from the config
    #[arg(long)]
    docker_socket: Option<String>,

    /// Check the config and Docker connection, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("unit_spawner=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = SpawnerConfig::from_file(&cli.config)?;
    let socket = cli.docker_socket.unwrap_or_else(|| config.docker_socket.clone());

    let runtime = DockerRuntime::connect(&socket)?;
    runtime.ping().await?;
    tracing::info!(socket = %socket, "connected to docker");

    if cli.check {
        println!("Config {} OK, image '{}'", cli.config.display(), config.image);
        return Ok(());
    }

    let spawner = Spawner::new(config, Arc::new(runtime))?;
    let handle = spawner.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!(active_units = spawner.active_units(), "shutting down");
    handle.shutdown(spawner.config().shutdown_grace()).await?;

    Ok(())
}
