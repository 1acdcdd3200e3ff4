//! Job submission: validation, idempotency, persistence and enqueueing.

use std::sync::Arc;
use std::time::Duration;

use actors::{PayloadOffloader, QueueClient};
use db::{IdempotencyRepository, JobRepository, Reservation};
use jobs_core::{
    CONFIGURATION_VERSION, CorrelationId, DataSource, Job, JobConfiguration, JobError, JobId,
    JobMessage, JobMetrics, JobType,
};

use crate::dto::{SubmitJobRequest, status_url};

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 2000;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Attempts at finding an unused job id before giving up.
const ID_ATTEMPTS: usize = 5;

/// A duplicate submission waits this long, in steps, for the original job
/// record to land.
const DUPLICATE_WAIT_STEPS: u32 = 10;
const DUPLICATE_WAIT_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    /// Largest serialized inline dataset accepted on submission.
    pub inline_payload_limit_bytes: usize,
    pub idempotency_ttl: Duration,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            inline_payload_limit_bytes: 256 * 1024,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: JobId,
    pub status_url: String,
    /// The idempotency key matched an earlier submission; nothing was created.
    pub deduplicated: bool,
}

impl Submission {
    fn new(job_id: JobId, deduplicated: bool) -> Self {
        Self {
            status_url: status_url(&job_id),
            job_id,
            deduplicated,
        }
    }
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedJob {
    pub name: String,
    pub description: Option<String>,
    pub job_type: JobType,
    pub configuration: JobConfiguration,
}

/// Check a submission before anything is written.
pub fn validate(
    request: SubmitJobRequest,
    inline_payload_limit_bytes: usize,
) -> Result<ValidatedJob, JobError> {
    let name = request.name.trim().to_string();
    if name.is_empty() {
        return Err(JobError::Validation("name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(JobError::Validation(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }

    let description = request
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());
    if description
        .as_ref()
        .is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LEN)
    {
        return Err(JobError::Validation(format!(
            "description must be at most {MAX_DESCRIPTION_LEN} characters"
        )));
    }

    let configuration = request
        .configuration
        .ok_or_else(|| JobError::Validation("configuration is required".into()))?;
    if configuration.version != CONFIGURATION_VERSION {
        return Err(JobError::Validation(format!(
            "unsupported configuration version {} (expected {CONFIGURATION_VERSION})",
            configuration.version
        )));
    }
    if let Some(threshold) = configuration.pass_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(JobError::Validation(
                "pass_threshold must be between 0 and 1".into(),
            ));
        }
    }

    match &configuration.data_source {
        DataSource::Inline { items } => {
            if items.is_empty() {
                return Err(JobError::Validation("inline dataset must not be empty".into()));
            }
            if let Some(index) = items.iter().position(|item| item.prompt.trim().is_empty()) {
                return Err(JobError::Validation(format!(
                    "item {index} has an empty prompt"
                )));
            }
            let size = serde_json::to_vec(items)
                .map_err(|e| JobError::Validation(e.to_string()))?
                .len();
            if size > inline_payload_limit_bytes {
                return Err(JobError::Validation(format!(
                    "inline dataset is {size} bytes, above the {inline_payload_limit_bytes} byte limit; supply an object reference"
                )));
            }
        }
        DataSource::Location { key } => {
            if key.trim().is_empty() {
                return Err(JobError::Validation("dataset location must not be empty".into()));
            }
        }
        DataSource::Reference { .. } => {}
    }

    Ok(ValidatedJob {
        name,
        description,
        job_type: request.job_type.unwrap_or(JobType::BulkEvaluation),
        configuration,
    })
}

/// Idempotency keys are 1 to 255 visible ASCII characters.
pub fn validate_idempotency_key(key: &str) -> Result<(), JobError> {
    if key.is_empty()
        || key.len() > MAX_IDEMPOTENCY_KEY_LEN
        || !key.bytes().all(|b| b.is_ascii_graphic())
    {
        return Err(JobError::Validation(format!(
            "Idempotency-Key must be 1 to {MAX_IDEMPOTENCY_KEY_LEN} visible ASCII characters"
        )));
    }
    Ok(())
}

/// Persists jobs and enqueues their processing message.
#[derive(Clone)]
pub struct JobProducer {
    jobs: JobRepository,
    idempotency: IdempotencyRepository,
    work: QueueClient,
    offloader: PayloadOffloader,
    metrics: Arc<dyn JobMetrics>,
    settings: ProducerSettings,
}

impl JobProducer {
    pub fn new(
        jobs: JobRepository,
        idempotency: IdempotencyRepository,
        work: QueueClient,
        offloader: PayloadOffloader,
        metrics: Arc<dyn JobMetrics>,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            jobs,
            idempotency,
            work,
            offloader,
            metrics,
            settings,
        }
    }

    /// Submit a job.
    ///
    /// The job is persisted as Pending before its `JobCreated` message is
    /// enqueued. If enqueueing fails the job stays Pending and the
    /// reconciliation sweep picks it up later.
    pub async fn submit(
        &self,
        request: SubmitJobRequest,
        idempotency_key: Option<&str>,
        correlation_id: CorrelationId,
    ) -> Result<Submission, JobError> {
        let validated = validate(request, self.settings.inline_payload_limit_bytes)?;

        if let Some(key) = idempotency_key {
            validate_idempotency_key(key)?;
            if let Some(existing) = self.idempotency.lookup(key).await.map_err(store_error)? {
                return self.deduplicated(key, existing).await;
            }
        }

        let job_id = self.allocate_id().await?;

        if let Some(key) = idempotency_key {
            let ttl = chrono::Duration::from_std(self.settings.idempotency_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            match self
                .idempotency
                .reserve(key, &job_id, ttl)
                .await
                .map_err(store_error)?
            {
                Reservation::Reserved => {}
                Reservation::Existing(existing) => return self.deduplicated(key, existing).await,
            }
        }

        let mut job = Job::new(
            job_id.clone(),
            validated.name,
            validated.job_type,
            validated.configuration,
            correlation_id.clone(),
        );
        job.description = validated.description;

        if let Err(err) = self.jobs.create(&job).await {
            if let Some(key) = idempotency_key {
                if let Err(release_err) = self.idempotency.release(key).await {
                    tracing::warn!(key, error = %release_err, "Failed to release idempotency key");
                }
            }
            return Err(store_error(err));
        }

        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            correlation_id = %correlation_id,
            "Job created"
        );
        self.metrics.job_submitted(job.job_type);

        self.enqueue(&job, correlation_id).await?;
        Ok(Submission::new(job_id, false))
    }

    /// Answer a repeated key with the original job once its record exists.
    async fn deduplicated(&self, key: &str, job_id: JobId) -> Result<Submission, JobError> {
        for step in 1..=DUPLICATE_WAIT_STEPS {
            if self.jobs.exists(&job_id).await.map_err(store_error)? {
                tracing::info!(key, job_id = %job_id, "Duplicate submission; returning existing job");
                self.metrics.job_deduplicated();
                return Ok(Submission::new(job_id, true));
            }
            if step < DUPLICATE_WAIT_STEPS {
                tokio::time::sleep(DUPLICATE_WAIT_STEP).await;
            }
        }

        tracing::warn!(key, job_id = %job_id, "Idempotency key bound to a job that is not persisted");
        Err(JobError::Conflict(format!(
            "a submission with Idempotency-Key {key} is still in progress; retry later"
        )))
    }

    async fn allocate_id(&self) -> Result<JobId, JobError> {
        for _ in 0..ID_ATTEMPTS {
            let id = JobId::generate()
                .map_err(|e| JobError::Store(format!("random source unavailable: {e}")))?;
            if !self.jobs.exists(&id).await.map_err(store_error)? {
                return Ok(id);
            }
            tracing::warn!(job_id = %id, "Generated job id already in use");
        }
        Err(JobError::Conflict(format!(
            "no unused job id after {ID_ATTEMPTS} attempts"
        )))
    }

    async fn enqueue(&self, job: &Job, correlation_id: CorrelationId) -> Result<(), JobError> {
        let orphaned = |reason: &str| {
            tracing::warn!(
                job_id = %job.id,
                reason,
                "Job persisted but not enqueued; left pending for reconciliation"
            );
        };

        let message = JobMessage::job_created(job, correlation_id)
            .map_err(|e| JobError::Queue(e.to_string()))?;
        let message = match self.offloader.offload(message).await {
            Ok(message) => message,
            Err(err) => {
                orphaned("payload offload failed");
                return Err(JobError::Storage(err.to_string()));
            }
        };
        let message_id = message.message_id;

        if let Err(err) = self.work.send(message, None).await {
            orphaned("enqueue failed");
            return Err(JobError::Queue(err.to_string()));
        }

        tracing::debug!(job_id = %job.id, %message_id, "JobCreated enqueued");
        Ok(())
    }
}

fn store_error(err: db::DbError) -> JobError {
    JobError::Store(err.to_string())
}

#[cfg(test)]
mod tests {
    use jobs_core::{EvaluationItem, ObjectReference};

    use super::*;

    fn request(configuration: Option<JobConfiguration>) -> SubmitJobRequest {
        SubmitJobRequest {
            name: "nightly regression".to_string(),
            description: None,
            job_type: None,
            configuration,
        }
    }

    fn inline(n: usize) -> JobConfiguration {
        JobConfiguration::inline(
            (0..n)
                .map(|i| EvaluationItem::new(format!("q{i}"), format!("a{i}")))
                .collect(),
        )
    }

    fn rejected(result: Result<ValidatedJob, JobError>) -> String {
        match result {
            Err(JobError::Validation(msg)) => msg,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn accepts_a_well_formed_request() {
        let job = validate(request(Some(inline(3))), 1024 * 1024).unwrap();
        assert_eq!(job.name, "nightly regression");
        assert_eq!(job.job_type, JobType::BulkEvaluation);
    }

    #[test]
    fn rejects_missing_or_empty_fields() {
        let mut blank = request(Some(inline(1)));
        blank.name = "   ".to_string();
        assert!(rejected(validate(blank, 1024)).contains("name"));

        assert!(rejected(validate(request(None), 1024)).contains("configuration"));
        assert!(rejected(validate(request(Some(inline(0))), 1024)).contains("empty"));

        let mut config = inline(2);
        if let DataSource::Inline { items } = &mut config.data_source {
            items[1].prompt = " ".to_string();
        }
        assert!(rejected(validate(request(Some(config)), 1024)).contains("item 1"));
    }

    #[test]
    fn rejects_unsupported_version_and_threshold() {
        let mut config = inline(1);
        config.version = 2;
        assert!(rejected(validate(request(Some(config)), 1024)).contains("version"));

        let mut config = inline(1);
        config.pass_threshold = Some(1.5);
        assert!(rejected(validate(request(Some(config)), 1024)).contains("pass_threshold"));
    }

    #[test]
    fn oversized_inline_dataset_asks_for_a_reference() {
        let msg = rejected(validate(request(Some(inline(50))), 256));
        assert!(msg.contains("object reference"), "{msg}");

        let reference = ObjectReference::new(
            "datasets",
            "big.json",
            "application/json",
            10 * 1024 * 1024,
            "memory://datasets/big.json",
        );
        assert!(validate(request(Some(JobConfiguration::referenced(reference))), 256).is_ok());
    }

    #[test]
    fn idempotency_key_shape() {
        assert!(validate_idempotency_key("order-42").is_ok());
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key("has space").is_err());
        assert!(validate_idempotency_key(&"k".repeat(256)).is_err());
        assert!(validate_idempotency_key(&"k".repeat(255)).is_ok());
    }
}
