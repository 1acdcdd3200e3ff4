//! Core domain types for the evaluation job system.
//!
//! This crate contains shared types used across all packages:
//! - Job, JobStatus and JobConfiguration for evaluation work
//! - JobMessage for the queue contract
//! - ObjectReference for payloads held in the object store
//! - list query validation, the error taxonomy and the metrics seam

mod configuration;
mod error;
mod job;
mod message;
mod metrics;
mod object_ref;
mod query;

pub use configuration::{
    CONFIGURATION_VERSION, DEFAULT_PASS_THRESHOLD, DataSource, EvaluationItem, JobConfiguration,
};
pub use error::JobError;
pub use job::{
    ErrorDetails, ItemResult, JOB_ID_PREFIX, JOB_ID_SUFFIX_LEN, Job, JobId, JobProgress,
    JobResult, JobResults, JobStatus, JobType, ResultLocation, ResultSummary, UnknownVariant,
    error_codes,
};
pub use message::{
    CancelledPayload, CompletedPayload, CorrelationId, CreatedPayload, FailedPayload,
    JobMessage, MAX_CORRELATION_ID_LEN, MessageId, MessageType, PermittedMutation,
    ProgressPayload, StartedPayload,
};
pub use metrics::{CountingMetrics, JobMetrics, NoopMetrics};
pub use object_ref::ObjectReference;
pub use query::{
    DEFAULT_PAGE_SIZE, JobFilter, ListJobsParams, ListJobsQuery, MAX_PAGE_SIZE, Page,
    Pagination, SortField, SortOrder,
};
