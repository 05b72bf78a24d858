use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use schema_steward_audit_core::{verify_chain, AuditSink};
use schema_steward_audit_sqlite::{latest_attempt_for_execution, SqliteAuditStore};
use schema_steward_control::{
    ControlPlane, HttpControlPlane, HttpControlPlaneConfig, KillSwitchGate, KillSwitchSource,
};
use schema_steward_coordinator::{ClaimCoordinator, LocalControlPlane};
use schema_steward_domain::AttemptId;
use schema_steward_orchestrator::{
    ExecutionOrchestrator, OrchestratorConfig, Poller, PollerConfig,
};
use schema_steward_target::{MySqlTarget, StaticTargetRegistry};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

mod config;

use config::{
    load_config_file, parse_connection_flag, AgentConfigFile, AgentSettings, ControlPlaneTarget,
    Overrides, DEFAULT_AUDIT_DB,
};

/// Largest pending page fetched when looking up a single execution.
const EXECUTE_LOOKUP_LIMIT: usize = 500;

#[derive(Debug, Parser)]
#[command(name = "schema-steward")]
#[command(about = "Autonomous executor for approved schema changes with a local audit trail")]
struct Cli {
    #[arg(long, global = true, env = "STEWARD_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the coordinator until interrupted.
    Run(AgentArgs),
    /// Drive one pending execution and print its report.
    Execute(ExecuteArgs),
    Audit(AuditArgs),
}

#[derive(Debug, Args)]
struct AgentArgs {
    #[arg(long, env = "STEWARD_AGENT_ID")]
    agent_id: Option<String>,
    #[arg(long, env = "STEWARD_COORDINATOR_URL")]
    coordinator_url: Option<String>,
    #[arg(long, env = "STEWARD_COORDINATOR_DB")]
    coordinator_db: Option<PathBuf>,
    #[arg(long)]
    api_token_env: Option<String>,
    #[arg(long, env = "STEWARD_CONTROL_TIMEOUT_MS")]
    control_timeout_ms: Option<u64>,
    #[arg(long, env = "STEWARD_AUDIT_DB")]
    audit_db: Option<PathBuf>,
    #[arg(long, env = "STEWARD_POLL_INTERVAL_SECS")]
    poll_interval_secs: Option<u64>,
    #[arg(long, env = "STEWARD_BATCH_SIZE")]
    batch_size: Option<usize>,
    #[arg(long, env = "STEWARD_OBSERVATION_WINDOW_SECS")]
    observation_window_secs: Option<u64>,
    /// `connection_id=DSN_ENV_VAR`; repeatable.
    #[arg(long = "connection")]
    connections: Vec<String>,
}

#[derive(Debug, Args)]
struct ExecuteArgs {
    #[arg(long)]
    execution_id: String,
    #[command(flatten)]
    agent: AgentArgs,
}

#[derive(Debug, Args)]
struct AuditArgs {
    #[arg(long, env = "STEWARD_AUDIT_DB")]
    audit_db: Option<PathBuf>,
    #[command(subcommand)]
    command: AuditSubcommand,
}

#[derive(Debug, Subcommand)]
enum AuditSubcommand {
    Attempts {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        execution_id: Option<String>,
    },
    Events {
        #[arg(long)]
        attempt_id: String,
    },
    /// Recompute the hash chain of one attempt.
    Verify {
        #[arg(long)]
        attempt_id: String,
    },
    Export {
        #[arg(long)]
        attempt_id: String,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => AgentConfigFile::default(),
    };

    match cli.command {
        Commands::Run(args) => run_command(file, args).await,
        Commands::Execute(args) => execute_command(file, args).await,
        Commands::Audit(args) => audit_command(&file, args),
    }
}

async fn run_command(file: AgentConfigFile, args: AgentArgs) -> Result<()> {
    let settings = AgentSettings::resolve(file, overrides_from(args)?)?;
    let orchestrator = Arc::new(build_orchestrator(&settings)?);
    let poller = Poller::new(
        orchestrator,
        PollerConfig {
            interval: settings.poll_interval,
            batch_size: settings.batch_size,
        },
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    info!(
        agent_id = %settings.agent_id,
        connections = ?settings.connection_ids(),
        "agent started"
    );

    let stats = poller.run(cancel).await;
    println!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

async fn execute_command(file: AgentConfigFile, args: ExecuteArgs) -> Result<()> {
    let settings = AgentSettings::resolve(file, overrides_from(args.agent)?)?;
    let orchestrator = build_orchestrator(&settings)?;

    let pending = orchestrator
        .control()
        .list_pending(EXECUTE_LOOKUP_LIMIT, &settings.connection_ids())
        .await?;
    let request = pending
        .into_iter()
        .find(|request| request.id == args.execution_id)
        .ok_or_else(|| {
            anyhow!(
                "execution {} is not pending for the served connections",
                args.execution_id
            )
        })?;

    let report = orchestrator.execute(request).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn audit_command(file: &AgentConfigFile, args: AuditArgs) -> Result<()> {
    let path = args
        .audit_db
        .or_else(|| file.audit_db.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_AUDIT_DB));
    let store = SqliteAuditStore::open(&path)?;
    store.migrate()?;

    match args.command {
        AuditSubcommand::Attempts {
            limit,
            execution_id,
        } => {
            let attempts = match execution_id {
                Some(execution_id) => latest_attempt_for_execution(&store, &execution_id)?
                    .into_iter()
                    .collect(),
                None => store.list_attempts(limit)?,
            };
            for attempt in attempts {
                println!("{}", serde_json::to_string(&attempt)?);
            }
        }
        AuditSubcommand::Events { attempt_id } => {
            let attempt_id = parse_attempt_id(&attempt_id)?;
            for row in store.list_events_for_attempt(attempt_id)? {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
        AuditSubcommand::Verify { attempt_id } => {
            let attempt_id = parse_attempt_id(&attempt_id)?;
            let rows = store.list_events_for_attempt(attempt_id)?;
            let report = verify_chain(attempt_id, &rows)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.chain_valid {
                return Err(anyhow!("audit chain for attempt {attempt_id} is broken"));
            }
        }
        AuditSubcommand::Export { attempt_id, out } => {
            let attempt_id = parse_attempt_id(&attempt_id)?;
            let attempt = store
                .get_attempt(attempt_id)?
                .ok_or_else(|| anyhow!("attempt not found: {attempt_id}"))?;
            let events = store.list_events_for_attempt(attempt_id)?;
            let snapshots = store.list_snapshots(attempt_id)?;
            let rollbacks = store.list_rollbacks(attempt_id)?;

            let output = File::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            let mut writer = BufWriter::new(output);
            writeln!(writer, "{}", serde_json::to_string(&json!({ "attempt": attempt }))?)?;
            for row in &events {
                writeln!(writer, "{}", serde_json::to_string(&json!({ "event": row }))?)?;
            }
            for snapshot in &snapshots {
                writeln!(writer, "{}", serde_json::to_string(&json!({ "snapshot": snapshot }))?)?;
            }
            for rollback in &rollbacks {
                writeln!(writer, "{}", serde_json::to_string(&json!({ "rollback": rollback }))?)?;
            }
            writer.flush()?;
            println!(
                "exported {} events for attempt {} to {}",
                events.len(),
                attempt_id,
                out.display()
            );
        }
    }
    Ok(())
}

fn overrides_from(args: AgentArgs) -> Result<Overrides> {
    let connections = args
        .connections
        .iter()
        .map(|raw| parse_connection_flag(raw))
        .collect::<Result<Vec<_>>>()?;
    Ok(Overrides {
        agent_id: args.agent_id,
        audit_db: args.audit_db,
        coordinator_url: args.coordinator_url,
        coordinator_db: args.coordinator_db,
        api_token_env: args.api_token_env,
        control_timeout_ms: args.control_timeout_ms,
        poll_interval_secs: args.poll_interval_secs,
        batch_size: args.batch_size,
        observation_window_secs: args.observation_window_secs,
        connections,
    })
}

fn build_orchestrator(settings: &AgentSettings) -> Result<ExecutionOrchestrator> {
    let (control, kill_switch_source): (Arc<dyn ControlPlane>, Arc<dyn KillSwitchSource>) =
        match &settings.control_plane {
            ControlPlaneTarget::Http {
                base_url,
                api_token_env,
            } => {
                let bearer_token = match api_token_env {
                    Some(name) => Some(
                        std::env::var(name)
                            .with_context(|| format!("api token variable {name} is not set"))?,
                    ),
                    None => None,
                };
                let client = Arc::new(HttpControlPlane::new(HttpControlPlaneConfig {
                    base_url: base_url.clone(),
                    bearer_token,
                    timeout: settings.control_timeout,
                })?);
                (client.clone(), client)
            }
            ControlPlaneTarget::Local { coordinator_db } => {
                let coordinator = ClaimCoordinator::new(coordinator_db);
                coordinator.migrate().with_context(|| {
                    format!("failed to migrate {}", coordinator_db.display())
                })?;
                let local = Arc::new(LocalControlPlane::new(coordinator));
                (local.clone(), local)
            }
        };

    let mut registry = StaticTargetRegistry::new();
    for connection in &settings.connections {
        let dsn = std::env::var(&connection.dsn_env).with_context(|| {
            format!(
                "dsn variable {} for connection {} is not set",
                connection.dsn_env, connection.connection_id
            )
        })?;
        registry.insert(connection.connection_id.clone(), Arc::new(MySqlTarget::new(dsn)));
    }

    let audit = SqliteAuditStore::open(&settings.audit_db)?;
    audit.migrate()?;

    Ok(ExecutionOrchestrator::new(
        control,
        KillSwitchGate::new(kill_switch_source).with_timeout(settings.control_timeout),
        Arc::new(registry),
        Arc::new(audit),
        OrchestratorConfig {
            agent_id: settings.agent_id.clone(),
            observation_window: settings.observation_window,
        },
    ))
}

fn parse_attempt_id(input: &str) -> Result<AttemptId> {
    Ulid::from_str(input)
        .map(AttemptId)
        .map_err(|err| anyhow!("invalid attempt id {input}: {err}"))
}

/// Cancel on ctrl-c or, on unix, SIGTERM. The in-flight execution finishes first.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            warn!(error = %err, "failed to listen for ctrl-c");
                        }
                    }
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "failed to listen for ctrl-c");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
        }
    }

    info!("stop requested; finishing in-flight execution");
    cancel.cancel();
}
