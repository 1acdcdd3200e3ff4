//! Job domain types for evaluation work tracked through its lifecycle.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::configuration::JobConfiguration;
use crate::message::{CorrelationId, MessageId};
use crate::object_ref::ObjectReference;

/// Prefix carried by every generated job id.
pub const JOB_ID_PREFIX: &str = "job_";

/// Number of random characters following the prefix.
pub const JOB_ID_SUFFIX_LEN: usize = 12;

const ID_ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Unique identifier for a job.
///
/// Generated ids look like `job_Xa81kQz0PwLm`. Ids read back from the store or
/// from a request path are accepted as-is; lookups of malformed ids simply
/// miss.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a new random job id from the OS random source.
    pub fn generate() -> Result<Self, getrandom::Error> {
        let mut suffix = String::with_capacity(JOB_ID_SUFFIX_LEN);
        let mut buf = [0u8; 32];

        while suffix.len() < JOB_ID_SUFFIX_LEN {
            getrandom::fill(&mut buf)?;
            // Rejection sampling keeps the alphabet uniform: 248 = 62 * 4.
            for byte in buf {
                if byte < 248 && suffix.len() < JOB_ID_SUFFIX_LEN {
                    suffix.push(ID_ALPHABET[(byte % 62) as usize] as char);
                }
            }
        }

        Ok(Self(format!("{JOB_ID_PREFIX}{suffix}")))
    }

    /// Wrap an existing id string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id has the shape produced by [`JobId::generate`].
    pub fn is_well_formed(&self) -> bool {
        self.0
            .strip_prefix(JOB_ID_PREFIX)
            .is_some_and(|s| s.len() == JOB_ID_SUFFIX_LEN && s.bytes().all(|b| b.is_ascii_alphanumeric()))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of evaluation work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    BulkEvaluation,
    SingleEvaluation,
    BatchProcessing,
}

impl JobType {
    pub const ALL: [JobType; 3] = [
        JobType::BulkEvaluation,
        JobType::SingleEvaluation,
        JobType::BatchProcessing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::BulkEvaluation => "bulk_evaluation",
            JobType::SingleEvaluation => "single_evaluation",
            JobType::BatchProcessing => "batch_processing",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "job type",
                value: s.to_string(),
            })
    }
}

/// Current status of a job in its lifecycle.
///
/// ```text
/// Pending ──► Running ──► Completed
///    │           │  └───► Failed
///    └───────────┴──────► Cancelled
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Persisted by the producer, waiting for a worker.
    #[default]
    Pending,
    /// Claimed by the worker holding the job's message.
    Running,
    /// All items processed and results stored.
    Completed,
    /// Retries exhausted or a non-retryable error occurred.
    Failed,
    /// Cancelled on request.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a cancellation request may be accepted.
    pub fn is_cancellable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "job status",
                value: s.to_string(),
            })
    }
}

/// A string did not name any variant of a closed enumeration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Progress counters for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_items: u32,
    pub completed_items: u32,
    pub percentage: u8,
}

impl JobProgress {
    /// Zeroed progress over `total_items`.
    pub fn new(total_items: u32) -> Self {
        Self {
            total_items,
            completed_items: 0,
            percentage: 0,
        }
    }

    /// Floor percentage; monotonic in `completed_items` for a fixed total.
    pub fn percentage_of(completed_items: u32, total_items: u32) -> u8 {
        if total_items == 0 {
            return 0;
        }
        let completed = u64::from(completed_items.min(total_items));
        (completed * 100 / u64::from(total_items)) as u8
    }

    /// Progress with `completed_items` done, clamped to the total.
    pub fn at(total_items: u32, completed_items: u32) -> Self {
        let completed_items = completed_items.min(total_items);
        Self {
            total_items,
            completed_items,
            percentage: Self::percentage_of(completed_items, total_items),
        }
    }

    /// Advance to `completed_items`, never moving backwards.
    ///
    /// Returns `true` if anything changed.
    pub fn advance_to(&mut self, completed_items: u32) -> bool {
        let next = Self::at(self.total_items, completed_items);
        if next.completed_items <= self.completed_items {
            return false;
        }
        *self = next;
        true
    }

    /// Progress of a finished job.
    pub fn finished(total_items: u32) -> Self {
        Self {
            total_items,
            completed_items: total_items,
            percentage: 100,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_items == self.total_items
    }
}

/// Well-known error codes recorded on failed jobs.
pub mod error_codes {
    pub const RETRY_EXHAUSTED: &str = "RETRY_EXHAUSTED";
    pub const SCORING_FAILED: &str = "SCORING_FAILED";
    pub const INVALID_CONFIGURATION: &str = "INVALID_CONFIGURATION";
    /// Running with no message left to drive it.
    pub const PROCESSING_LOST: &str = "PROCESSING_LOST";
}

/// Structured error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorDetails {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Outcome of scoring a single evaluation item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub score: f64,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Aggregate figures over all item results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total_items: u32,
    pub passed_items: u32,
    pub failed_items: u32,
    pub average_score: f64,
}

impl ResultSummary {
    pub fn from_items(items: &[ItemResult]) -> Self {
        let total_items = items.len() as u32;
        let passed_items = items.iter().filter(|r| r.passed).count() as u32;
        let average_score = if items.is_empty() {
            0.0
        } else {
            items.iter().map(|r| r.score).sum::<f64>() / items.len() as f64
        };
        Self {
            total_items,
            passed_items,
            failed_items: total_items - passed_items,
            average_score,
        }
    }
}

/// Full detailed results of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub summary: ResultSummary,
    pub items: Vec<ItemResult>,
    pub generated_at: DateTime<Utc>,
}

impl JobResults {
    pub fn new(job_id: JobId, items: Vec<ItemResult>) -> Self {
        Self {
            job_id,
            summary: ResultSummary::from_items(&items),
            items,
            generated_at: Utc::now(),
        }
    }
}

/// Where the detailed results of a completed job live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultLocation {
    /// Small result sets are kept on the job record.
    Inline { results: JobResults },
    /// Large result sets live in the object store.
    Stored { reference: ObjectReference },
}

/// Result of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub summary: ResultSummary,
    pub location: ResultLocation,
}

impl JobResult {
    pub fn reference(&self) -> Option<&ObjectReference> {
        match &self.location {
            ResultLocation::Stored { reference } => Some(reference),
            ResultLocation::Inline { .. } => None,
        }
    }
}

/// A job represents one evaluation run tracked from submission to a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion_at: Option<DateTime<Utc>>,
    pub configuration: JobConfiguration,
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    /// Number of times a worker claimed or resumed the job.
    #[serde(default)]
    pub attempts: u32,
    /// Message that moved the job to Running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<MessageId>,
    pub correlation_id: CorrelationId,
}

impl Job {
    /// Create a new pending job with zeroed progress.
    pub fn new(
        id: JobId,
        name: impl Into<String>,
        job_type: JobType,
        configuration: JobConfiguration,
        correlation_id: CorrelationId,
    ) -> Self {
        let now = Utc::now();
        let total_items = configuration.data_source.known_item_count().unwrap_or(0);
        Self {
            id,
            name: name.into(),
            description: None,
            job_type,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            estimated_completion_at: None,
            configuration,
            progress: JobProgress::new(total_items),
            error: None,
            result: None,
            attempts: 0,
            claimed_by: None,
            correlation_id,
        }
    }

    /// Set the description for this job.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
