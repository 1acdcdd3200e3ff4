use chrono::{DateTime, Utc};
use jobs_core::{
    ErrorDetails, Job, JobConfiguration, JobId, JobProgress, JobStatus, JobType, Pagination,
    ResultLocation, ResultSummary,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Defaults to `bulk_evaluation`.
    #[serde(default, rename = "type", alias = "job_type")]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub configuration: Option<JobConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelJobRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Result block of a job as clients see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultView {
    pub summary: ResultSummary,
    /// `inline` or `stored`.
    pub storage: String,
    pub results_url: String,
}

/// Public representation of a job. Internal bookkeeping is not exposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
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
    pub progress: JobProgress,
    pub configuration: JobConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultView>,
}

pub fn status_url(id: &JobId) -> String {
    format!("/jobs/{id}")
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let result = job.result.map(|r| ResultView {
            summary: r.summary,
            storage: match r.location {
                ResultLocation::Inline { .. } => "inline".to_string(),
                ResultLocation::Stored { .. } => "stored".to_string(),
            },
            results_url: format!("/jobs/{}/results", job.id),
        });

        Self {
            id: job.id,
            name: job.name,
            description: job.description,
            job_type: job.job_type,
            status: job.status,
            created_at: job.created_at,
            updated_at: job.updated_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            estimated_completion_at: job.estimated_completion_at,
            progress: job.progress,
            configuration: job.configuration,
            error: job.error,
            result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
    pub pagination: Pagination,
}
