use chrono::{DateTime, Duration};
use jobs_core::{CorrelationId, EvaluationItem, Job, JobConfiguration, JobId, JobType};

use db::{DbConfig, DbError, Stores};

/// Fresh in-memory database per test; nothing is shared between tests.
pub async fn setup_db() -> Result<Stores, DbError> {
    db::init(&DbConfig::memory()).await
}

pub fn sample_job(name: &str, items: usize) -> Job {
    let items = (0..items)
        .map(|i| EvaluationItem::new(format!("prompt {i}"), format!("answer {i}")))
        .collect();
    Job::new(
        JobId::generate().expect("random source"),
        name,
        JobType::BulkEvaluation,
        JobConfiguration::inline(items),
        CorrelationId::generate(),
    )
}

/// Job whose creation time is `offset_secs` after a fixed base.
pub fn job_created_at(name: &str, offset_secs: i64) -> Job {
    let mut job = sample_job(name, 1);
    let base = DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp");
    job.created_at = base + Duration::seconds(offset_secs);
    job.updated_at = job.created_at;
    job
}
