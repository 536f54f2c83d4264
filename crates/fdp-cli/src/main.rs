use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fdp_core::{ExecutionStatus, RunScope, RunTrigger};
use fdp_sync::{build_orchestrator, maybe_build_scheduler, ExecutionLog, PipelineConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "fdp-cli")]
#[command(about = "Financial disclosure pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and print the execution record.
    Run(RunArgs),
    /// Print a stored execution.
    Status { execution_id: Uuid },
    /// Serve the status API (and the scheduler when FDP_SCHEDULER_ENABLED is set).
    Serve,
    /// Trigger scheduled runs on FDP_SYNC_CRON until Ctrl-C.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Restrict the run to these sources; repeatable.
    #[arg(long = "source")]
    sources: Vec<String>,
    #[arg(long)]
    year: Option<i32>,
    #[arg(long)]
    full_refresh: bool,
    #[arg(long)]
    skip_quality_gate: bool,
}

impl RunArgs {
    fn trigger(self) -> RunTrigger {
        let trigger = RunTrigger {
            scope: RunScope {
                year: self.year,
                full_refresh: self.full_refresh,
            },
            skip_quality_gate: self.skip_quality_gate,
            ..RunTrigger::manual()
        };
        self.sources.into_iter().fold(trigger, |trigger, key| trigger.with_source(key))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "fdp=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let orchestrator = build_orchestrator(&config).await?;
            let execution = orchestrator.run(args.trigger()).await?;
            println!("{}", serde_json::to_string_pretty(&execution)?);
            if execution.status == ExecutionStatus::Failed {
                let cause = execution
                    .error
                    .map(|e| format!("{}: {}", e.phase, e.message))
                    .unwrap_or_default();
                bail!("execution {} failed ({cause})", execution.execution_id);
            }
        }
        Commands::Status { execution_id } => {
            let log = ExecutionLog::new(config.executions_dir());
            let Some(execution) = log.get(execution_id).await? else {
                bail!("execution {execution_id} not found in {}", log.dir().display());
            };
            println!("{}", serde_json::to_string_pretty(&execution)?);
        }
        Commands::Serve => {
            let mut sched = if config.scheduler_enabled {
                let orchestrator = Arc::new(build_orchestrator(&config).await?);
                maybe_build_scheduler(true, &config.sync_cron, orchestrator).await?
            } else {
                None
            };
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
            }
            let served = fdp_web::serve(&config).await;
            if let Some(sched) = sched.as_mut() {
                sched.shutdown().await.context("stopping scheduler")?;
            }
            served?;
        }
        Commands::Schedule => {
            let orchestrator = Arc::new(build_orchestrator(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(true, &config.sync_cron, orchestrator).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(cron = %config.sync_cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
