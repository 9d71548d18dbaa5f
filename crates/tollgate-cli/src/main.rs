//! tollgate - runs a worker pool over a task file, or checks one task
//! description against the admission checks.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tollgate_core::app::{DrainReport, OrchestratorStatus};
use tollgate_core::engine::OfflineBackend;
use tollgate_core::safety::SafetyGateway;
use tollgate_core::{AppBuilder, GatewayConfig, Role, RunMode, TaskSubmission};

#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(about = "Budget, safety and health gate in front of AI task dispatch")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit every task in a JSON file and run the pool until the queue is
    /// drained (or Ctrl-C pulls the kill switch).
    Run {
        /// JSON array of {description, role, min_spend, max_spend, priority}
        tasks: PathBuf,

        /// Keep running after the queue drains, until Ctrl-C
        #[arg(long)]
        until_killed: bool,

        /// Override TOLLGATE_WORKERS
        #[arg(short, long)]
        workers: Option<usize>,

        /// Append audit records to this JSON Lines file (overrides TOLLGATE_AUDIT_PATH)
        #[arg(long)]
        audit: Option<PathBuf>,
    },

    /// Evaluate a description against the admission checks and print the verdict.
    Check {
        description: String,

        #[arg(short, long, default_value = "guest")]
        role: Role,
    },
}

#[derive(Serialize)]
struct RunSummary {
    submitted: usize,
    drain: DrainReport,
    status: OrchestratorStatus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tollgate=info,tollgate_core=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = GatewayConfig::from_env()?;

    match cli.command {
        Command::Check { description, role } => {
            let gateway = SafetyGateway::new(&config.safety)?;
            let verdict = gateway.evaluate(&description, role);
            println!("{}", serde_json::to_string_pretty(&verdict)?);
        }
        Command::Run {
            tasks,
            until_killed,
            workers,
            audit,
        } => {
            if let Some(workers) = workers {
                config.worker.pool_size = workers;
            }
            if audit.is_some() {
                config.audit.jsonl_path = audit;
            }

            let raw = tokio::fs::read_to_string(&tasks)
                .await
                .with_context(|| format!("reading {}", tasks.display()))?;
            let submissions: Vec<TaskSubmission> =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", tasks.display()))?;

            let backend = config.router.backend.clone();
            let app = AppBuilder::new(config)
                .with_configured_audit()
                .await?
                .with_backend(backend, Arc::new(OfflineBackend::default()))?
                .build()?;

            let mut submitted = 0;
            for submission in submissions {
                match app.submit(submission).await {
                    Ok(id) => {
                        submitted += 1;
                        tracing::info!(task_id = %id, "submitted");
                    }
                    Err(err) => tracing::warn!(error = %err, "submission rejected"),
                }
            }

            let kill_switch = app.kill_switch.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    kill_switch.trigger();
                }
            });

            let orchestrator = app.orchestrator();
            let mode = if until_killed {
                RunMode::UntilKilled
            } else {
                RunMode::UntilIdle
            };
            let drain = orchestrator.run(mode).await?;
            let status = orchestrator.status().await?;
            let summary = RunSummary {
                submitted,
                drain,
                status,
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
