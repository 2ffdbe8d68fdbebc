use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use slick::{
    CaddyClient, DeploymentConfig, DeploymentCoordinator, DockerRuntime, HealthProbe,
    ProxyConfigBuilder,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Zero-downtime deployments with Docker and Caddy.
#[derive(Parser)]
#[command(name = "slick", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new instance, gate it on its health check and cut traffic over.
    Deploy {
        #[arg(short, long, default_value = "slick.yml")]
        config: PathBuf,
        /// Abort the deployment after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print the Caddyfile the rules render to for a given port.
    Caddyfile {
        #[arg(short, long, default_value = "slick.yml")]
        config: PathBuf,
        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with env filter, defaulting to info if RUST_LOG is unset.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,slick=debug,reqwest=info,hyper_util=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();

    match Cli::parse().command {
        Command::Deploy { config, timeout } => deploy(config, timeout).await,
        Command::Caddyfile { config, port } => {
            let config = DeploymentConfig::load(&config)?;
            print!(
                "{}",
                ProxyConfigBuilder::render_caddyfile(&config.caddy.rules, port)
            );
            Ok(())
        }
    }
}

async fn deploy(path: PathBuf, timeout: Option<u64>) -> anyhow::Result<()> {
    let config = DeploymentConfig::load(&path)?;
    let proxy = CaddyClient::new(
        &config.caddy.admin_api,
        config.caddy.push_timeout(),
        config.caddy.retry_policy(),
    )
    .context("Failed to build proxy admin client")?;
    let health = HealthProbe::new().context("Failed to build health check client")?;
    let runtime = DockerRuntime::new().context("Failed to connect to Docker")?;

    let mut coordinator =
        DeploymentCoordinator::new(config, Arc::new(runtime), Arc::new(proxy), Arc::new(health));
    if let Some(secs) = timeout {
        coordinator = coordinator.with_deadline(Duration::from_secs(secs));
    }

    coordinator
        .recover()
        .await
        .context("Failed to inspect running instances")?;

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling deployment");
                cancel.cancel();
            }
        }
    });

    let result = coordinator.deploy(cancel).await;
    ctrl_c.abort();

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(err) => {
            tracing::error!(
                app = %coordinator.config().app.name,
                phase = %err.phase(),
                outcome = %err.outcome(),
                error = %err,
                "deployment did not complete"
            );
            Err(err.into())
        }
    }
}
