//! Queue message contract between the producer and the workers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::configuration::JobConfiguration;
use crate::job::{ErrorDetails, Job, JobId, JobProgress, JobType, ResultSummary};
use crate::object_ref::ObjectReference;

/// Unique identifier for a queue message, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Ulid);

impl MessageId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Longest trace header accepted verbatim as a correlation id.
pub const MAX_CORRELATION_ID_LEN: usize = 512;

/// Identifier propagated from the submitting request through every message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh correlation id for work that has no inbound trace context.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Use an inbound trace header unchanged, or generate one when absent.
    pub fn from_trace_header(header: Option<&str>) -> Self {
        match header {
            Some(value)
                if !value.trim().is_empty()
                    && value.len() <= MAX_CORRELATION_ID_LEN
                    && value.bytes().all(|b| b.is_ascii_graphic()) =>
            {
                Self(value.to_string())
            }
            _ => Self::generate(),
        }
    }

    /// Wrap a previously issued correlation id.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a job message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    JobCreated,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

/// Which job fields a message of a given type allows the worker to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermittedMutation {
    /// Full lifecycle: claim, progress, result, terminal status.
    Lifecycle,
    /// Status to Cancelled only.
    Cancellation,
    /// Monotonic progress merge only.
    Progress,
    /// Notification; the job is not touched.
    None,
}

impl MessageType {
    pub fn permitted_mutation(self) -> PermittedMutation {
        match self {
            MessageType::JobCreated => PermittedMutation::Lifecycle,
            MessageType::JobCancelled => PermittedMutation::Cancellation,
            MessageType::JobProgress => PermittedMutation::Progress,
            MessageType::JobStarted | MessageType::JobCompleted | MessageType::JobFailed => {
                PermittedMutation::None
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::JobCreated => "JobCreated",
            MessageType::JobStarted => "JobStarted",
            MessageType::JobProgress => "JobProgress",
            MessageType::JobCompleted => "JobCompleted",
            MessageType::JobFailed => "JobFailed",
            MessageType::JobCancelled => "JobCancelled",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `JobCreated` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedPayload {
    pub job_type: JobType,
    pub configuration: JobConfiguration,
}

/// Payload of a `JobStarted` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartedPayload {
    pub worker_id: String,
    pub attempt: u32,
}

/// Payload of a `JobProgress` message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub progress: JobProgress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion_at: Option<DateTime<Utc>>,
}

/// Payload of a `JobCompleted` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedPayload {
    pub summary: ResultSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_reference: Option<ObjectReference>,
    pub duration_ms: u64,
}

/// Payload of a `JobFailed` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPayload {
    pub error: ErrorDetails,
    pub dead_lettered: bool,
}

/// Payload of a `JobCancelled` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelledPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A message travelling through the queue. Always about exactly one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub message_id: MessageId,
    pub job_id: JobId,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    /// Type specific body; `null` when offloaded to `object_refs`.
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_refs: Vec<ObjectReference>,
}

impl JobMessage {
    /// Build a message with a typed payload.
    pub fn new<P: Serialize>(
        job_id: JobId,
        message_type: MessageType,
        correlation_id: CorrelationId,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: MessageId::new(),
            job_id,
            message_type,
            created_at: Utc::now(),
            correlation_id,
            payload: serde_json::to_value(payload)?,
            object_refs: Vec::new(),
        })
    }

    /// The `JobCreated` message for a freshly persisted job.
    pub fn job_created(job: &Job, correlation_id: CorrelationId) -> Result<Self, serde_json::Error> {
        Self::new(
            job.id.clone(),
            MessageType::JobCreated,
            correlation_id,
            &CreatedPayload {
                job_type: job.job_type,
                configuration: job.configuration.clone(),
            },
        )
    }

    /// Whether the body lives in the object store.
    pub fn is_offloaded(&self) -> bool {
        !self.object_refs.is_empty()
    }

    /// Decode the inline payload into its typed form.
    pub fn decode_payload<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Serialized size of the payload in bytes.
    pub fn payload_size(&self) -> Result<usize, serde_json::Error> {
        Ok(serde_json::to_vec(&self.payload)?.len())
    }

    /// Serialized size of the whole message in bytes.
    pub fn encoded_size(&self) -> Result<usize, serde_json::Error> {
        Ok(serde_json::to_vec(self)?.len())
    }
}
