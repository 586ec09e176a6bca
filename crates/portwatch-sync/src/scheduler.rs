use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::orchestrator::{SyncError, UpdateOrchestrator};

/// Cron-driven, non-forced updates. `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<UpdateOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.run_update(false).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    status = ?summary.status,
                    inserted = summary.inserted,
                    "scheduled update finished"
                ),
                Err(SyncError::RunInProgress) => {
                    warn!("scheduled update skipped; a run is already in progress")
                }
                Err(err) => warn!(error = %err, "scheduled update failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(%cron, "update scheduler configured");
    Ok(Some(sched))
}
