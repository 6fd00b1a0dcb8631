//! External drivers that keep calling `process_next_job` until a job drains.

use std::sync::Arc;

use anyhow::{Context, Result};
use rowsync_core::SyncSummary;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, info, warn};

use crate::progress::ProgressSender;
use crate::scheduler::{BatchScheduler, SchedulerError};

/// Run chunks back to back. `None` when no job was active.
pub async fn drive_until_idle(scheduler: &BatchScheduler) -> Result<Option<SyncSummary>> {
    loop {
        let outcome = match scheduler.process_next_job(ProgressSender::detached()).await {
            Ok(outcome) => outcome,
            Err(err)
                if matches!(
                    err.downcast_ref::<SchedulerError>(),
                    Some(SchedulerError::NoActiveJob)
                ) =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        if let (Some(index), Some(summary)) = (outcome.chunk_index, &outcome.chunk_summary) {
            info!(job_id = %outcome.job_id, chunk = index, "{}", summary.headline());
        }
        if !outcome.has_more {
            return Ok(outcome.job_summary);
        }
    }
}

/// One chunk per cron tick; idle and busy ticks are skipped quietly.
pub async fn build_cron_driver(cron: &str, scheduler: Arc<BatchScheduler>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = CronJob::new_async(cron, move |_uuid, _l| {
        let scheduler = scheduler.clone();
        Box::pin(async move {
            match scheduler.process_next_job(ProgressSender::detached()).await {
                Ok(outcome) if outcome.has_more => {
                    debug!(
                        job_id = %outcome.job_id,
                        chunk = ?outcome.chunk_index,
                        "chunk processed"
                    );
                }
                Ok(outcome) => {
                    let headline = outcome
                        .job_summary
                        .as_ref()
                        .map(SyncSummary::headline)
                        .unwrap_or_default();
                    info!(job_id = %outcome.job_id, "job drained by cron driver: {headline}");
                }
                Err(err) => match err.downcast_ref::<SchedulerError>() {
                    Some(SchedulerError::NoActiveJob | SchedulerError::Busy) => {
                        debug!("cron tick skipped: {err}");
                    }
                    _ => warn!("scheduled chunk failed: {err:#}"),
                },
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{JobRequest, SchedulerSettings, StartOutcome};
    use rowsync_adapters::InMemoryRemote;
    use rowsync_core::{JobType, ResourceType};
    use rowsync_storage::MemoryStateStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn drains_a_batch_job() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("notes.csv");
        let mut text = String::from("title\n");
        for n in 0..7 {
            text.push_str(&format!("Note {n}\n"));
        }
        std::fs::write(&path, text).unwrap();

        let remote = Arc::new(InMemoryRemote::new());
        let mut settings = SchedulerSettings {
            chunk_size: 3,
            ..SchedulerSettings::default()
        };
        settings.thresholds.note = 2;
        let scheduler =
            BatchScheduler::new(Arc::new(MemoryStateStore::new()), remote.clone(), settings);

        assert_eq!(drive_until_idle(&scheduler).await.unwrap(), None);

        let request = JobRequest {
            job_type: JobType::Import,
            resource: ResourceType::Note,
            input_path: Some(path),
            mapping: None,
            output_path: None,
            dry_run: false,
        };
        let started = scheduler.start_job(request, ProgressSender::detached()).await.unwrap();
        assert!(matches!(started, StartOutcome::BatchStarted { .. }));

        let summary = drive_until_idle(&scheduler).await.unwrap().unwrap();
        assert_eq!(summary.created, 7);
        assert_eq!(remote.count(ResourceType::Note).await, 7);
    }
}
