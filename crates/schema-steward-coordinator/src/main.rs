use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use schema_steward_coordinator::service::{app, ServiceState};
use schema_steward_coordinator::ClaimCoordinator;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "schema-steward-coordinator")]
#[command(about = "Claim coordinator service for schema change executions")]
struct Args {
    #[arg(
        long,
        env = "STEWARD_COORDINATOR_DB",
        default_value = "./schema-steward-coordinator.sqlite3"
    )]
    db: PathBuf,
    #[arg(long, env = "STEWARD_COORDINATOR_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "STEWARD_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let args = Args::parse();
    let coordinator = ClaimCoordinator::new(&args.db);
    coordinator
        .migrate()
        .with_context(|| format!("failed to migrate {}", args.db.display()))?;

    let state = ServiceState::new(
        coordinator,
        Duration::from_millis(args.operation_timeout_ms),
    );
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "coordinator listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("coordinator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
}
