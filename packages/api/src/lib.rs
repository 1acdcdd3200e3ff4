//! HTTP surface of the evaluation job system.
//!
//! - job submission with idempotency (`POST /jobs`)
//! - listing, lookup, cancellation and result download
//! - environment configuration and process wiring

mod config;
mod dto;
mod errors;
mod init;
mod producer;
mod routes;
mod service;

pub use config::{AppConfig, ConfigError};
pub use dto::{
    CancelJobRequest, JobListResponse, JobView, ResultView, SubmitJobRequest, SubmitJobResponse,
};
pub use errors::{job_error_to_response, json_error};
pub use init::{AppServices, InitError, Runtime, start};
pub use producer::{
    JobProducer, MAX_DESCRIPTION_LEN, MAX_IDEMPOTENCY_KEY_LEN, MAX_NAME_LEN, ProducerSettings,
    Submission, ValidatedJob, validate, validate_idempotency_key,
};
pub use routes::{CORRELATION_HEADER, IDEMPOTENCY_HEADER, TRACE_HEADER, router};
pub use service::{JobService, ResultsPayload};
