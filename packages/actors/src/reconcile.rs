//! Periodic sweep repairing jobs whose messages went missing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::{DbError, IdempotencyRepository, JobRepository};
use jobs_core::{ErrorDetails, JobMessage, JobMetrics, error_codes};

use crate::client::QueueClient;
use crate::messages::QueueError;
use crate::offload::{OffloadError, PayloadOffloader};
use crate::queue_actor::to_delta;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Offload(#[from] OffloadError),

    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Pending jobs given a fresh `JobCreated`.
    pub requeued: usize,
    /// Running jobs marked Failed because their work was dead-lettered or lost.
    pub failed: usize,
    pub purged_keys: usize,
}

pub struct Reconciler {
    jobs: JobRepository,
    idempotency: IdempotencyRepository,
    work: QueueClient,
    offloader: PayloadOffloader,
    metrics: Arc<dyn JobMetrics>,
    orphan_grace: Duration,
    stale_after: Duration,
    batch_size: usize,
}

impl Reconciler {
    pub fn new(
        jobs: JobRepository,
        idempotency: IdempotencyRepository,
        work: QueueClient,
        offloader: PayloadOffloader,
        metrics: Arc<dyn JobMetrics>,
        orphan_grace: Duration,
    ) -> Self {
        Self {
            jobs,
            idempotency,
            work,
            offloader,
            metrics,
            orphan_grace,
            stale_after: Duration::from_secs(300),
            batch_size: 100,
        }
    }

    /// Fail Running jobs with no queued message once they have not been
    /// updated for `stale_after`.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run one sweep.
    pub async fn run_once(&self) -> Result<ReconcileReport, ReconcileError> {
        let report = ReconcileReport {
            requeued: self.requeue_orphans().await?,
            failed: self.fail_stranded().await?,
            purged_keys: self.idempotency.purge_expired(Utc::now()).await?,
        };

        if report != ReconcileReport::default() {
            tracing::info!(
                requeued = report.requeued,
                failed = report.failed,
                purged_keys = report.purged_keys,
                "Reconciliation sweep repaired state"
            );
        }
        Ok(report)
    }

    /// Pending jobs past the grace period with nothing queued for them.
    async fn requeue_orphans(&self) -> Result<usize, ReconcileError> {
        let cutoff = Utc::now() - to_delta(self.orphan_grace);
        let stale = self.jobs.list_stale_pending(cutoff, self.batch_size).await?;

        let mut requeued = 0;
        for job in stale {
            if self.work.contains_job(&job.id).await? {
                continue;
            }
            let message = JobMessage::job_created(&job, job.correlation_id.clone())?;
            let message = self.offloader.offload(message).await?;
            tracing::warn!(
                job_id = %job.id,
                message_id = %message.message_id,
                correlation_id = %job.correlation_id,
                "Re-enqueueing orphaned pending job"
            );
            self.work.send(message, None).await?;
            requeued += 1;
        }
        Ok(requeued)
    }

    /// Running jobs with no live message: their `JobCreated` was
    /// dead-lettered, or it vanished and the job stopped moving.
    async fn fail_stranded(&self) -> Result<usize, ReconcileError> {
        let running = self.jobs.list_running(self.batch_size).await?;
        if running.is_empty() {
            return Ok(0);
        }
        let dead = self
            .work
            .dead_lettered_jobs(running.iter().map(|job| job.id.clone()).collect())
            .await?;
        let stale_before = Utc::now() - to_delta(self.stale_after);

        let mut failed = 0;
        for job in running {
            let error = if dead.contains(&job.id) {
                ErrorDetails::new(
                    error_codes::RETRY_EXHAUSTED,
                    "processing message was dead-lettered before the job finished",
                )
            } else if job.updated_at < stale_before {
                ErrorDetails::new(
                    error_codes::PROCESSING_LOST,
                    format!("no progress since {} and no message to resume it", job.updated_at),
                )
            } else {
                continue;
            };
            if self.work.contains_job(&job.id).await? {
                continue;
            }

            if self.jobs.fail(&job.id, &error).await?.is_some() {
                tracing::warn!(job_id = %job.id, code = %error.code, "Failed stranded running job");
                self.metrics.job_failed(job.job_type, &error.code);
                failed += 1;
            }
        }
        Ok(failed)
    }
}
