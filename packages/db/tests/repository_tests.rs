#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;

use chrono::{Duration, Utc};
use jobs_core::{
    ErrorDetails, JobFilter, JobProgress, JobResult, JobResults, JobStatus, JobType,
    ListJobsQuery, MessageId, ResultLocation, SortField, SortOrder, error_codes,
};

use db::{DbError, Reservation};

use common::{job_created_at, sample_job, setup_db};

#[tokio::test]
async fn created_job_reads_back_pending_with_zero_progress() -> Result<(), Box<dyn Error>> {
    let stores = setup_db().await?;
    let job = sample_job("roundtrip", 3).with_description("three items");

    stores.jobs.create(&job).await?;
    let loaded = stores.jobs.get(&job.id).await?;

    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.status, JobStatus::Pending);
    assert_eq!(loaded.progress, JobProgress::new(3));
    assert_eq!(loaded.description.as_deref(), Some("three items"));
    assert_eq!(loaded.configuration, job.configuration);
    assert_eq!(loaded.correlation_id, job.correlation_id);
    assert_eq!(loaded.created_at.timestamp_millis(), job.created_at.timestamp_millis());
    assert!(stores.jobs.exists(&job.id).await?);

    let missing = stores.jobs.get(&jobs_core::JobId::from_string("job_nothinghere")).await;
    assert!(matches!(missing, Err(DbError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn claim_only_succeeds_once() -> Result<(), Box<dyn Error>> {
    let stores = setup_db().await?;
    let job = sample_job("claim", 2);
    stores.jobs.create(&job).await?;

    let message = MessageId::new();
    let claimed = stores.jobs.claim(&job.id, message).await?.expect("claimed");
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.claimed_by, Some(message));
    assert!(claimed.started_at.is_some());

    assert!(stores.jobs.claim(&job.id, MessageId::new()).await?.is_none());

    // Only the claiming message may resume.
    assert!(stores.jobs.resume(&job.id, MessageId::new()).await?.is_none());
    let resumed = stores.jobs.resume(&job.id, message).await?.expect("resumed");
    assert_eq!(resumed.attempts, 2);
    Ok(())
}

#[tokio::test]
async fn progress_never_moves_backwards() -> Result<(), Box<dyn Error>> {
    let stores = setup_db().await?;
    let job = sample_job("progress", 4);
    stores.jobs.create(&job).await?;

    // Not running yet: nothing is written.
    assert!(stores.jobs.update_progress(&job.id, JobProgress::at(4, 1), None).await?.is_none());

    stores.jobs.claim(&job.id, MessageId::new()).await?;
    let eta = Utc::now() + Duration::seconds(30);
    let updated = stores
        .jobs
        .update_progress(&job.id, JobProgress::at(4, 3), Some(eta))
        .await?
        .expect("progress written");
    assert_eq!(updated.progress.completed_items, 3);
    assert_eq!(updated.progress.percentage, 75);
    assert!(updated.estimated_completion_at.is_some());

    assert!(stores.jobs.update_progress(&job.id, JobProgress::at(4, 2), None).await?.is_none());
    let loaded = stores.jobs.get(&job.id).await?;
    assert_eq!(loaded.progress.completed_items, 3);
    Ok(())
}

#[tokio::test]
async fn terminal_jobs_are_never_regressed() -> Result<(), Box<dyn Error>> {
    let stores = setup_db().await?;
    let job = sample_job("terminal", 1);
    stores.jobs.create(&job).await?;
    stores.jobs.claim(&job.id, MessageId::new()).await?;

    let results = JobResults::new(job.id.clone(), Vec::new());
    let result = JobResult {
        summary: results.summary,
        location: ResultLocation::Inline { results },
    };
    let completed = stores.jobs.complete(&job.id, &result).await?.expect("completed");
    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.progress.percentage, 100);
    assert!(completed.completed_at.is_some());
    assert_eq!(completed.result, Some(result));

    let error = ErrorDetails::new(error_codes::SCORING_FAILED, "late failure");
    assert!(stores.jobs.fail(&job.id, &error).await?.is_none());
    assert!(stores.jobs.cancel(&job.id).await?.is_none());
    assert!(stores.jobs.claim(&job.id, MessageId::new()).await?.is_none());
    assert!(stores.jobs.update_progress(&job.id, JobProgress::at(1, 0), None).await?.is_none());

    assert_eq!(stores.jobs.get(&job.id).await?.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn failed_job_keeps_error_details() -> Result<(), Box<dyn Error>> {
    let stores = setup_db().await?;
    let job = sample_job("failing", 1);
    stores.jobs.create(&job).await?;

    let error = ErrorDetails::new(error_codes::RETRY_EXHAUSTED, "scorer kept timing out");
    // Pending jobs cannot fail directly.
    assert!(stores.jobs.fail(&job.id, &error).await?.is_none());

    stores.jobs.claim(&job.id, MessageId::new()).await?;
    let failed = stores.jobs.fail(&job.id, &error).await?.expect("failed");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error, Some(error));
    Ok(())
}

#[tokio::test]
async fn cancel_pending_and_running_jobs() -> Result<(), Box<dyn Error>> {
    let stores = setup_db().await?;
    let pending = sample_job("pending", 1);
    let running = sample_job("running", 1);
    stores.jobs.create(&pending).await?;
    stores.jobs.create(&running).await?;
    stores.jobs.claim(&running.id, MessageId::new()).await?;

    let cancelled = stores.jobs.cancel(&pending.id).await?.expect("cancelled");
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(stores.jobs.cancel(&running.id).await?.is_some());

    // Cancellation is absorbing.
    assert!(stores.jobs.cancel(&pending.id).await?.is_none());
    assert!(stores.jobs.claim(&pending.id, MessageId::new()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn second_page_returns_items_eleven_to_twenty() -> Result<(), Box<dyn Error>> {
    let stores = setup_db().await?;
    let mut ids = Vec::new();
    for i in 0..25 {
        let job = job_created_at(&format!("job {i:02}"), i);
        ids.push(job.id.clone());
        stores.jobs.create(&job).await?;
    }

    let query = ListJobsQuery {
        page: 2,
        page_size: 10,
        order: SortOrder::Asc,
        ..ListJobsQuery::default()
    };
    let page = stores.jobs.list(&query).await?;
    assert_eq!(page.total, 25);
    let got: Vec<_> = page.items.iter().map(|j| j.id.clone()).collect();
    assert_eq!(got, ids[10..20].to_vec());

    // Default order is newest first.
    let newest = stores.jobs.list(&ListJobsQuery::default()).await?;
    assert_eq!(newest.items.first().map(|j| j.id.clone()), ids.last().cloned());
    Ok(())
}

#[tokio::test]
async fn list_filters_and_sorts_by_name() -> Result<(), Box<dyn Error>> {
    let stores = setup_db().await?;
    let mut single = sample_job("bravo", 1);
    single.job_type = JobType::SingleEvaluation;
    let alpha = sample_job("alpha", 1);
    let charlie = sample_job("charlie", 1);
    for job in [&single, &alpha, &charlie] {
        stores.jobs.create(job).await?;
    }
    stores.jobs.claim(&charlie.id, MessageId::new()).await?;

    let by_name = stores
        .jobs
        .list(&ListJobsQuery {
            sort: SortField::Name,
            order: SortOrder::Asc,
            ..ListJobsQuery::default()
        })
        .await?;
    let names: Vec<_> = by_name.items.iter().map(|j| j.name.as_str()).collect();
    assert_eq!(names, ["alpha", "bravo", "charlie"]);

    let running = stores
        .jobs
        .list(&ListJobsQuery {
            filter: JobFilter {
                status: Some(JobStatus::Running),
                job_type: None,
            },
            ..ListJobsQuery::default()
        })
        .await?;
    assert_eq!(running.total, 1);
    assert_eq!(running.items[0].id, charlie.id);

    let singles = stores
        .jobs
        .list(&ListJobsQuery {
            filter: JobFilter {
                status: Some(JobStatus::Pending),
                job_type: Some(JobType::SingleEvaluation),
            },
            ..ListJobsQuery::default()
        })
        .await?;
    assert_eq!(singles.total, 1);
    assert_eq!(singles.items[0].id, single.id);

    let none = stores
        .jobs
        .list(&ListJobsQuery {
            filter: JobFilter {
                status: Some(JobStatus::Failed),
                job_type: None,
            },
            ..ListJobsQuery::default()
        })
        .await?;
    assert_eq!(none.total, 0);
    assert!(none.items.is_empty());
    Ok(())
}

#[tokio::test]
async fn stale_pending_and_running_sweeps() -> Result<(), Box<dyn Error>> {
    let stores = setup_db().await?;
    let old = job_created_at("old", 0);
    let fresh = sample_job("fresh", 1);
    let running = job_created_at("running", 1);
    for job in [&old, &fresh, &running] {
        stores.jobs.create(job).await?;
    }
    stores.jobs.claim(&running.id, MessageId::new()).await?;

    let cutoff = Utc::now() - Duration::minutes(5);
    let stale = stores.jobs.list_stale_pending(cutoff, 10).await?;
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, old.id);

    let in_progress = stores.jobs.list_running(10).await?;
    assert_eq!(in_progress.len(), 1);
    assert_eq!(in_progress[0].id, running.id);
    Ok(())
}

#[tokio::test]
async fn idempotency_key_binds_one_job() -> Result<(), Box<dyn Error>> {
    let stores = setup_db().await?;
    let first = sample_job("first", 1);
    let second = sample_job("second", 1);
    let ttl = Duration::hours(1);

    let reserved = stores.idempotency.reserve("client-key-1", &first.id, ttl).await?;
    assert_eq!(reserved, Reservation::Reserved);

    let again = stores.idempotency.reserve("client-key-1", &second.id, ttl).await?;
    assert_eq!(again, Reservation::Existing(first.id.clone()));
    assert_eq!(stores.idempotency.lookup("client-key-1").await?, Some(first.id.clone()));

    stores.idempotency.release("client-key-1").await?;
    assert_eq!(stores.idempotency.lookup("client-key-1").await?, None);
    let rebound = stores.idempotency.reserve("client-key-1", &second.id, ttl).await?;
    assert_eq!(rebound, Reservation::Reserved);
    Ok(())
}

#[tokio::test]
async fn expired_keys_are_replaced_and_purged() -> Result<(), Box<dyn Error>> {
    let stores = setup_db().await?;
    let first = sample_job("first", 1);
    let second = sample_job("second", 1);

    stores
        .idempotency
        .reserve("short-lived", &first.id, Duration::milliseconds(-1))
        .await?;
    assert_eq!(stores.idempotency.lookup("short-lived").await?, None);

    // An expired reservation does not block a new one.
    let reserved = stores
        .idempotency
        .reserve("short-lived", &second.id, Duration::milliseconds(-1))
        .await?;
    assert_eq!(reserved, Reservation::Reserved);

    stores
        .idempotency
        .reserve("long-lived", &first.id, Duration::hours(1))
        .await?;
    let purged = stores.idempotency.purge_expired(Utc::now()).await?;
    assert_eq!(purged, 1);
    assert_eq!(stores.idempotency.lookup("long-lived").await?, Some(first.id));
    Ok(())
}
