//! Read side and cancellation.

use std::sync::Arc;

use actors::{QueueClient, cancellation_message};
use bytes::Bytes;
use jobs_core::{
    Job, JobError, JobId, JobMetrics, JobResults, JobStatus, ListJobsParams, ListJobsQuery,
    ObjectReference, Page, ResultLocation,
};
use storage::{Storage, StorageError};

/// Detailed results of a completed job.
#[derive(Debug, Clone)]
pub enum ResultsPayload {
    Inline(JobResults),
    /// Raw bytes fetched from the object store.
    Stored {
        reference: ObjectReference,
        bytes: Bytes,
    },
}

#[derive(Clone)]
pub struct JobService {
    jobs: db::JobRepository,
    storage: Storage,
    events: QueueClient,
    metrics: Arc<dyn JobMetrics>,
}

impl JobService {
    pub fn new(
        jobs: db::JobRepository,
        storage: Storage,
        events: QueueClient,
        metrics: Arc<dyn JobMetrics>,
    ) -> Self {
        Self {
            jobs,
            storage,
            events,
            metrics,
        }
    }

    pub async fn list(&self, params: &ListJobsParams) -> Result<(ListJobsQuery, Page<Job>), JobError> {
        let query = ListJobsQuery::parse(params)?;
        let page = self.jobs.list(&query).await.map_err(store_error)?;
        Ok((query, page))
    }

    pub async fn get(&self, id: &JobId) -> Result<Job, JobError> {
        self.jobs
            .find(id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| JobError::NotFound(id.clone()))
    }

    /// Cancel a Pending or Running job.
    ///
    /// The store write happens here; a `JobCancelled` notification is then
    /// published so a worker holding the job can observe it.
    pub async fn cancel(&self, id: &JobId, reason: Option<String>) -> Result<Job, JobError> {
        let current = self.get(id).await?;
        check_cancellable(&current)?;

        let Some(cancelled) = self.jobs.cancel(id).await.map_err(store_error)? else {
            // Lost a race with a worker or another cancel.
            let latest = self.get(id).await?;
            check_cancellable(&latest)?;
            return Err(JobError::Conflict(format!(
                "job {id} changed while being cancelled"
            )));
        };

        tracing::info!(
            job_id = %id,
            previous_status = %current.status,
            correlation_id = %cancelled.correlation_id,
            "Job cancelled"
        );
        self.metrics.job_cancelled();

        match cancellation_message(&cancelled, reason) {
            Ok(message) => {
                if let Err(err) = self.events.send(message, None).await {
                    tracing::warn!(job_id = %id, error = %err, "Failed to publish JobCancelled");
                }
            }
            Err(err) => tracing::warn!(job_id = %id, error = %err, "Failed to encode JobCancelled"),
        }

        Ok(cancelled)
    }

    /// Results of a completed job, inline or fetched from the object store.
    pub async fn results(&self, id: &JobId) -> Result<ResultsPayload, JobError> {
        let job = self.get(id).await?;
        if job.status != JobStatus::Completed {
            return Err(JobError::NotCompleted {
                id: id.clone(),
                status: job.status,
            });
        }

        let result = job.result.ok_or_else(|| {
            JobError::Store(format!("completed job {id} has no result recorded"))
        })?;

        match result.location {
            ResultLocation::Inline { results } => Ok(ResultsPayload::Inline(results)),
            ResultLocation::Stored { reference } => {
                let bytes = self
                    .storage
                    .get_object(&reference)
                    .await
                    .map_err(|e| match e {
                        StorageError::NotFound(_) | StorageError::Expired(_) => {
                            JobError::NotFound(id.clone())
                        }
                        other => JobError::Storage(other.to_string()),
                    })?;
                Ok(ResultsPayload::Stored { reference, bytes })
            }
        }
    }
}

fn check_cancellable(job: &Job) -> Result<(), JobError> {
    match job.status {
        JobStatus::Pending | JobStatus::Running => Ok(()),
        JobStatus::Cancelled => Err(JobError::Conflict(format!(
            "job {} is already cancelled",
            job.id
        ))),
        status => Err(JobError::NotCancellable {
            id: job.id.clone(),
            status,
        }),
    }
}

fn store_error(err: db::DbError) -> JobError {
    JobError::Store(err.to_string())
}
