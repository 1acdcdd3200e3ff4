//! Job repository: persistence and conditional lifecycle updates.

use chrono::{DateTime, Utc};
use jobs_core::{
    CorrelationId, ErrorDetails, Job, JobId, JobProgress, JobResult, JobStatus, JobType,
    ListJobsQuery, MessageId, Page,
};
use serde::{Deserialize, Serialize};

use crate::{Database, DbError};

const TABLE: &str = "job";

/// Repository for job persistence operations.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
}

/// Stored shape of a job. Mapped explicitly to and from [`Job`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job_id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    job_type: String,
    status: String,
    created_at: i64,
    updated_at: i64,
    #[serde(default)]
    started_at: Option<i64>,
    #[serde(default)]
    completed_at: Option<i64>,
    #[serde(default)]
    estimated_completion_at: Option<i64>,
    configuration: String,
    total_items: i64,
    completed_items: i64,
    percentage: i64,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Option<String>,
    attempts: i64,
    #[serde(default)]
    claimed_by: Option<String>,
    correlation_id: String,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    total: i64,
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(field: &str, ms: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::Serialization(format!("{field}: timestamp out of range: {ms}")))
}

fn opt_from_millis(field: &str, ms: Option<i64>) -> Result<Option<DateTime<Utc>>, DbError> {
    ms.map(|ms| from_millis(field, ms)).transpose()
}

fn to_u32(field: &str, value: i64) -> Result<u32, DbError> {
    u32::try_from(value)
        .map_err(|_| DbError::Serialization(format!("{field}: value out of range: {value}")))
}

impl JobRecord {
    fn from_job(job: &Job) -> Result<Self, DbError> {
        Ok(Self {
            job_id: job.id.to_string(),
            name: job.name.clone(),
            description: job.description.clone(),
            job_type: job.job_type.as_str().to_string(),
            status: job.status.as_str().to_string(),
            created_at: millis(job.created_at),
            updated_at: millis(job.updated_at),
            started_at: job.started_at.map(millis),
            completed_at: job.completed_at.map(millis),
            estimated_completion_at: job.estimated_completion_at.map(millis),
            configuration: serde_json::to_string(&job.configuration)?,
            total_items: i64::from(job.progress.total_items),
            completed_items: i64::from(job.progress.completed_items),
            percentage: i64::from(job.progress.percentage),
            error: job.error.as_ref().map(serde_json::to_string).transpose()?,
            result: job.result.as_ref().map(serde_json::to_string).transpose()?,
            attempts: i64::from(job.attempts),
            claimed_by: job.claimed_by.map(|m| m.to_string()),
            correlation_id: job.correlation_id.to_string(),
        })
    }

    fn into_job(self) -> Result<Job, DbError> {
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let job_type = self
            .job_type
            .parse::<JobType>()
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        let claimed_by = self
            .claimed_by
            .as_deref()
            .map(MessageId::parse)
            .transpose()
            .map_err(|e| DbError::Serialization(format!("claimed_by: {e}")))?;
        let total_items = to_u32("total_items", self.total_items)?;
        let completed_items = to_u32("completed_items", self.completed_items)?;
        let percentage = u8::try_from(self.percentage)
            .map_err(|_| DbError::Serialization(format!("percentage: {}", self.percentage)))?;

        Ok(Job {
            id: JobId::from_string(self.job_id),
            name: self.name,
            description: self.description,
            job_type,
            status,
            created_at: from_millis("created_at", self.created_at)?,
            updated_at: from_millis("updated_at", self.updated_at)?,
            started_at: opt_from_millis("started_at", self.started_at)?,
            completed_at: opt_from_millis("completed_at", self.completed_at)?,
            estimated_completion_at: opt_from_millis(
                "estimated_completion_at",
                self.estimated_completion_at,
            )?,
            configuration: serde_json::from_str(&self.configuration)?,
            progress: JobProgress {
                total_items,
                completed_items,
                percentage,
            },
            error: self.error.as_deref().map(serde_json::from_str).transpose()?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            attempts: to_u32("attempts", self.attempts)?,
            claimed_by,
            correlation_id: CorrelationId::from_string(self.correlation_id),
        })
    }
}

fn first_job(records: Vec<JobRecord>) -> Result<Option<Job>, DbError> {
    records.into_iter().next().map(JobRecord::into_job).transpose()
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new job in the database.
    pub async fn create(&self, job: &Job) -> Result<Job, DbError> {
        let record = JobRecord::from_job(job)?;

        let created: Option<JobRecord> = self
            .db
            .create((TABLE, job.id.to_string()))
            .content(record)
            .await?;

        created
            .ok_or_else(|| DbError::Query("Failed to create job".into()))?
            .into_job()
    }

    /// Get a job by ID, or `NotFound`.
    pub async fn get(&self, id: &JobId) -> Result<Job, DbError> {
        self.find(id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {id}")))
    }

    /// Get a job by ID if it exists.
    pub async fn find(&self, id: &JobId) -> Result<Option<Job>, DbError> {
        let record: Option<JobRecord> = self.db.select((TABLE, id.to_string())).await?;
        record.map(JobRecord::into_job).transpose()
    }

    /// Check if a job id is taken.
    pub async fn exists(&self, id: &JobId) -> Result<bool, DbError> {
        let record: Option<JobRecord> = self.db.select((TABLE, id.to_string())).await?;
        Ok(record.is_some())
    }

    /// List jobs matching the filter, sorted with the job id as tie-breaker,
    /// together with the total count over the whole filter.
    pub async fn list(&self, query: &ListJobsQuery) -> Result<Page<Job>, DbError> {
        let mut conditions = Vec::new();
        if query.filter.status.is_some() {
            conditions.push("status = $status");
        }
        if query.filter.job_type.is_some() {
            conditions.push("job_type = $job_type");
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let direction = query.order.keyword();
        let sql = format!(
            "SELECT * FROM job {where_clause} ORDER BY {column} {direction}, job_id {direction} LIMIT $limit START $start;
             SELECT count() AS total FROM job {where_clause} GROUP ALL;",
            column = query.sort.column(),
        );

        let status = query.filter.status.map(|s| s.as_str().to_string());
        let job_type = query.filter.job_type.map(|t| t.as_str().to_string());

        let mut response = self
            .db
            .query(sql)
            .bind(("status", status))
            .bind(("job_type", job_type))
            .bind(("limit", i64::from(query.page_size)))
            .bind(("start", query.offset() as i64))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        let counts: Vec<CountRow> = response.take(1)?;
        let total = counts.first().map_or(0, |c| c.total.max(0) as u64);

        let items = records
            .into_iter()
            .map(JobRecord::into_job)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page { items, total })
    }

    /// Move a Pending job to Running on behalf of `message_id`.
    ///
    /// Returns `None` when the job is no longer Pending.
    pub async fn claim(&self, id: &JobId, message_id: MessageId) -> Result<Option<Job>, DbError> {
        let now = millis(Utc::now());
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('job', $id)
                 SET status = 'running', started_at = $now, updated_at = $now,
                     attempts += 1, claimed_by = $message_id
                 WHERE status = 'pending'
                 RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("now", now))
            .bind(("message_id", message_id.to_string()))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        first_job(records)
    }

    /// Record a resumed attempt of a Running job by the message that claimed it.
    pub async fn resume(&self, id: &JobId, message_id: MessageId) -> Result<Option<Job>, DbError> {
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('job', $id)
                 SET attempts += 1, updated_at = $now
                 WHERE status = 'running' AND claimed_by = $message_id
                 RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("now", millis(Utc::now())))
            .bind(("message_id", message_id.to_string()))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        first_job(records)
    }

    /// Merge progress into a Running job. Never moves `completed_items` backwards.
    ///
    /// Returns `None` when nothing was written (job not Running, or stale progress).
    pub async fn update_progress(
        &self,
        id: &JobId,
        progress: JobProgress,
        estimated_completion_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Job>, DbError> {
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('job', $id)
                 SET total_items = $total, completed_items = $completed, percentage = $percentage,
                     estimated_completion_at = $eta, updated_at = $now
                 WHERE status = 'running' AND completed_items <= $completed
                 RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("total", i64::from(progress.total_items)))
            .bind(("completed", i64::from(progress.completed_items)))
            .bind(("percentage", i64::from(progress.percentage)))
            .bind(("eta", estimated_completion_at.map(millis)))
            .bind(("now", millis(Utc::now())))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        first_job(records)
    }

    /// Mark a Running job Completed with its result and full progress.
    pub async fn complete(&self, id: &JobId, result: &JobResult) -> Result<Option<Job>, DbError> {
        let now = millis(Utc::now());
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('job', $id)
                 SET status = 'completed', completed_at = $now, updated_at = $now,
                     total_items = $total, completed_items = $total, percentage = 100,
                     estimated_completion_at = NONE, result = $result
                 WHERE status = 'running'
                 RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("now", now))
            .bind(("total", i64::from(result.summary.total_items)))
            .bind(("result", serde_json::to_string(result)?))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        first_job(records)
    }

    /// Mark a Running job Failed with structured error details.
    pub async fn fail(&self, id: &JobId, error: &ErrorDetails) -> Result<Option<Job>, DbError> {
        let now = millis(Utc::now());
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('job', $id)
                 SET status = 'failed', completed_at = $now, updated_at = $now,
                     estimated_completion_at = NONE, error = $error
                 WHERE status = 'running'
                 RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("now", now))
            .bind(("error", serde_json::to_string(error)?))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        first_job(records)
    }

    /// Cancel a Pending or Running job.
    ///
    /// Returns `None` when the job is already terminal.
    pub async fn cancel(&self, id: &JobId) -> Result<Option<Job>, DbError> {
        let now = millis(Utc::now());
        let mut response = self
            .db
            .query(
                "UPDATE type::thing('job', $id)
                 SET status = 'cancelled', completed_at = $now, updated_at = $now,
                     estimated_completion_at = NONE
                 WHERE status IN ['pending', 'running']
                 RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("now", now))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        first_job(records)
    }

    /// Pending jobs created before `cutoff`, oldest first.
    pub async fn list_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, DbError> {
        let mut response = self
            .db
            .query(
                "SELECT * FROM job
                 WHERE status = 'pending' AND created_at < $cutoff
                 ORDER BY created_at ASC
                 LIMIT $limit",
            )
            .bind(("cutoff", millis(cutoff)))
            .bind(("limit", limit as i64))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        records.into_iter().map(JobRecord::into_job).collect()
    }

    /// Running jobs, least recently updated first.
    pub async fn list_running(&self, limit: usize) -> Result<Vec<Job>, DbError> {
        let mut response = self
            .db
            .query(
                "SELECT * FROM job
                 WHERE status = 'running'
                 ORDER BY updated_at ASC
                 LIMIT $limit",
            )
            .bind(("limit", limit as i64))
            .await?;

        let records: Vec<JobRecord> = response.take(0)?;
        records.into_iter().map(JobRecord::into_job).collect()
    }
}
