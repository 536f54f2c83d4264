use std::sync::Arc;

use anyhow::{Context, Result};
use fdp_core::RunTrigger;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::orchestrator::Orchestrator;

/// Builds (but does not start) a scheduler that fires a scheduled run on
/// `cron`. Returns `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    enabled: bool,
    cron: &str,
    orchestrator: Arc<Orchestrator>,
) -> Result<Option<JobScheduler>> {
    if !enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            tracing::info!("scheduled run triggered");
            match orchestrator.run(RunTrigger::scheduled()).await {
                Ok(execution) => tracing::info!(
                    execution_id = %execution.execution_id,
                    outcome = ?execution.outcome,
                    "scheduled run finished"
                ),
                Err(err) => tracing::error!(error = %format!("{err:#}"), "scheduled run could not be recorded"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
