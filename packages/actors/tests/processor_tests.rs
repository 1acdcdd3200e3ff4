mod common;

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use actors::{
    Disposition, FnScorer, INVALID_PAYLOAD, JOB_NOT_FOUND, PayloadOffloader, QueueSettings,
    RESULTS_CONTAINER, Score, ScoreError, SimilarityScorer, WORK_QUEUE, cancellation_message,
};
use jobs_core::{
    CorrelationId, CountingMetrics, DataSource, JobConfiguration, JobId, JobMessage, JobProgress,
    JobResults, JobStatus, MessageId, MessageType, ProgressPayload, ResultLocation, error_codes,
};

use common::{fast_settings, harness, harness_with_work, inline_job, items, job_with};

#[tokio::test]
async fn three_item_job_runs_to_completion() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let job = inline_job("three items", 3);
    h.submit(&job).await;

    let delivery = h.work.receive().await?.expect("delivery");
    let disposition = processor.process("worker-1", &h.work, delivery).await;
    assert_eq!(disposition, Disposition::Completed);

    let done = h.stores.jobs.get(&job.id).await?;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, JobProgress::finished(3));
    assert!(done.completed_at.is_some());
    assert_eq!(done.attempts, 1);

    let result = done.result.expect("result recorded");
    assert_eq!(result.summary.total_items, 3);
    assert_eq!(result.summary.passed_items, 3);
    match result.location {
        ResultLocation::Inline { results } => {
            assert_eq!(results.items.len(), 3);
            assert_eq!(results.items[2].item_id.as_deref(), Some("item-2"));
        }
        other => panic!("expected inline results, got {other:?}"),
    }

    let stats = h.work.stats().await?;
    assert_eq!((stats.ready, stats.in_flight, stats.dead_lettered), (0, 0, 0));
    assert_eq!(
        h.event_types().await,
        vec![
            MessageType::JobStarted,
            MessageType::JobProgress,
            MessageType::JobProgress,
            MessageType::JobCompleted,
        ]
    );
    assert_eq!(CountingMetrics::get(&h.metrics.started), 1);
    assert_eq!(CountingMetrics::get(&h.metrics.completed), 1);
    Ok(())
}

#[tokio::test]
async fn always_failing_scorer_exhausts_retries_and_dead_letters() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(
        FnScorer::new(|_, _| Box::pin(async { Err(ScoreError::Transient("upstream busy".into())) })),
        fast_settings(),
    );
    let job = inline_job("flaky", 2);
    h.submit(&job).await;

    let delivery = h.work.receive().await?.expect("delivery");
    let disposition = processor.process("worker-1", &h.work, delivery).await;
    assert_eq!(
        disposition,
        Disposition::DeadLettered {
            reason: error_codes::RETRY_EXHAUSTED.to_string()
        }
    );

    let failed = h.stores.jobs.get(&job.id).await?;
    assert_eq!(failed.status, JobStatus::Failed);
    let error = failed.error.expect("error recorded");
    assert_eq!(error.code, error_codes::RETRY_EXHAUSTED);

    let dead = h.work.peek_dead_letters(10).await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.job_id, job.id);
    assert_eq!(dead[0].reason, error_codes::RETRY_EXHAUSTED);

    assert_eq!(CountingMetrics::get(&h.metrics.failed), 1);
    assert_eq!(CountingMetrics::get(&h.metrics.dead_lettered), 1);
    assert_eq!(CountingMetrics::get(&h.metrics.retried), 1);
    assert!(h.event_types().await.contains(&MessageType::JobFailed));
    Ok(())
}

#[tokio::test]
async fn permanent_scoring_failure_fails_without_retry() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let processor = h.processor(
        FnScorer::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(ScoreError::Permanent("prompt rejected".into())) })
        }),
        fast_settings(),
    );
    let job = inline_job("rejected", 2);
    h.submit(&job).await;

    let delivery = h.work.receive().await?.expect("delivery");
    let disposition = processor.process("worker-1", &h.work, delivery).await;
    assert_eq!(
        disposition,
        Disposition::Failed {
            code: error_codes::SCORING_FAILED.to_string()
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let failed = h.stores.jobs.get(&job.id).await?;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.map(|e| e.code).as_deref(), Some(error_codes::SCORING_FAILED));
    let stats = h.work.stats().await?;
    assert_eq!((stats.in_flight, stats.dead_lettered), (0, 0));
    Ok(())
}

#[tokio::test]
async fn cancellation_during_processing_stops_the_job() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let job = inline_job("cancel me", 5);
    let calls = Arc::new(AtomicU32::new(0));

    let jobs = h.stores.jobs.clone();
    let job_id = job.id.clone();
    let counter = calls.clone();
    let processor = h.processor(
        FnScorer::new(move |_, _| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            let jobs = jobs.clone();
            let job_id = job_id.clone();
            Box::pin(async move {
                if first {
                    let _ = jobs.cancel(&job_id).await;
                }
                Ok(Score::new(1.0))
            })
        }),
        fast_settings(),
    );
    h.submit(&job).await;

    let delivery = h.work.receive().await?.expect("delivery");
    let disposition = processor.process("worker-1", &h.work, delivery).await;
    assert_eq!(disposition, Disposition::Cancelled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let cancelled = h.stores.jobs.get(&job.id).await?;
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.progress.completed_items < cancelled.progress.total_items);
    assert!(cancelled.result.is_none());

    let stats = h.work.stats().await?;
    assert_eq!((stats.ready, stats.in_flight, stats.dead_lettered), (0, 0, 0));
    Ok(())
}

#[tokio::test]
async fn cancellation_beats_a_failure_that_would_dead_letter() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let job = inline_job("cancelled then exhausted", 2);

    let jobs = h.stores.jobs.clone();
    let job_id = job.id.clone();
    let processor = h.processor(
        FnScorer::new(move |_, _| {
            let jobs = jobs.clone();
            let job_id = job_id.clone();
            Box::pin(async move {
                let _ = jobs.cancel(&job_id).await;
                Err(ScoreError::Transient("upstream busy".into()))
            })
        }),
        fast_settings(),
    );
    h.submit(&job).await;

    let delivery = h.work.receive().await?.expect("delivery");
    let disposition = processor.process("worker-1", &h.work, delivery).await;
    assert_eq!(disposition, Disposition::Cancelled);

    assert_eq!(h.stores.jobs.get(&job.id).await?.status, JobStatus::Cancelled);
    let stats = h.work.stats().await?;
    assert_eq!((stats.ready, stats.in_flight, stats.dead_lettered), (0, 0, 0));
    assert_eq!(CountingMetrics::get(&h.metrics.failed), 0);
    assert_eq!(CountingMetrics::get(&h.metrics.dead_lettered), 0);
    Ok(())
}

#[tokio::test]
async fn slow_item_keeps_its_lease_until_scored() -> Result<(), Box<dyn Error>> {
    let h = harness_with_work(
        QueueSettings::new(WORK_QUEUE).with_lock_duration(Duration::from_millis(600)),
    )
    .await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let processor = h.processor(
        FnScorer::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                Ok(Score::new(1.0))
            })
        }),
        fast_settings(),
    );
    let job = inline_job("slow item", 1);
    h.submit(&job).await;

    let delivery = h.work.receive().await?.expect("delivery");
    let competing = async {
        // Well past the original lock.
        tokio::time::sleep(Duration::from_millis(1000)).await;
        h.work.receive().await
    };
    let (disposition, competing) = tokio::join!(
        processor.process("worker-1", &h.work, delivery),
        competing
    );

    assert_eq!(disposition, Disposition::Completed);
    assert!(competing?.is_none(), "message was redelivered while held");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.stores.jobs.get(&job.id).await?.status, JobStatus::Completed);
    let stats = h.work.stats().await?;
    assert_eq!((stats.ready, stats.in_flight, stats.dead_lettered), (0, 0, 0));
    Ok(())
}

#[tokio::test]
async fn redelivery_for_a_job_running_elsewhere_is_a_duplicate() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let job = inline_job("already running", 1);
    h.submit(&job).await;
    h.stores.jobs.claim(&job.id, MessageId::new()).await?.expect("claimed");

    let delivery = h.work.receive().await?.expect("delivery");
    let disposition = processor.process("worker-1", &h.work, delivery).await;
    assert_eq!(disposition, Disposition::Duplicate);

    let running = h.stores.jobs.get(&job.id).await?;
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.attempts, 1);
    assert_eq!(h.work.stats().await?.in_flight, 0);
    Ok(())
}

#[tokio::test]
async fn redelivery_for_a_terminal_job_is_acknowledged() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let job = inline_job("finished", 1);
    h.submit(&job).await;

    let first = h.work.receive().await?.expect("delivery");
    assert_eq!(
        processor.process("worker-1", &h.work, first).await,
        Disposition::Completed
    );

    // The same JobCreated arrives again, e.g. after a lost acknowledgement.
    let again = JobMessage::job_created(&job, job.correlation_id.clone())?;
    h.work.send(again, None).await?;
    let second = h.work.receive().await?.expect("redelivery");
    assert_eq!(
        processor.process("worker-2", &h.work, second).await,
        Disposition::Acknowledged
    );

    let done = h.stores.jobs.get(&job.id).await?;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 1);
    Ok(())
}

#[tokio::test]
async fn job_created_for_unknown_job_is_dead_lettered() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let ghost = inline_job("never stored", 1);
    h.work
        .send(JobMessage::job_created(&ghost, CorrelationId::generate())?, None)
        .await?;

    let delivery = h.work.receive().await?.expect("delivery");
    let disposition = processor.process("worker-1", &h.work, delivery).await;
    assert_eq!(
        disposition,
        Disposition::DeadLettered {
            reason: JOB_NOT_FOUND.to_string()
        }
    );
    assert_eq!(h.work.peek_dead_letters(10).await?[0].reason, JOB_NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn missing_dataset_fails_with_invalid_configuration() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let mut configuration = JobConfiguration::inline(Vec::new());
    configuration.data_source = DataSource::Location {
        key: "uploads/missing.json".to_string(),
    };
    let job = job_with("no dataset", configuration);
    h.submit(&job).await;

    let delivery = h.work.receive().await?.expect("delivery");
    let disposition = processor.process("worker-1", &h.work, delivery).await;
    assert_eq!(
        disposition,
        Disposition::Failed {
            code: error_codes::INVALID_CONFIGURATION.to_string()
        }
    );
    let failed = h.stores.jobs.get(&job.id).await?;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(h.work.stats().await?.dead_lettered, 0);
    Ok(())
}

#[tokio::test]
async fn referenced_dataset_is_loaded_from_storage() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let reference = h
        .storage
        .put_json("uploads", "dataset.json", &items(2), None)
        .await?;
    let job = job_with("referenced", JobConfiguration::referenced(reference));
    assert_eq!(job.progress.total_items, 0);
    h.submit(&job).await;

    let delivery = h.work.receive().await?.expect("delivery");
    assert_eq!(
        processor.process("worker-1", &h.work, delivery).await,
        Disposition::Completed
    );
    let done = h.stores.jobs.get(&job.id).await?;
    assert_eq!(done.progress, JobProgress::finished(2));
    Ok(())
}

#[tokio::test]
async fn large_results_are_stored_by_reference() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let mut settings = fast_settings();
    settings.result_inline_limit_bytes = 16;
    let processor = h.processor(SimilarityScorer, settings);
    let job = inline_job("big results", 3);
    h.submit(&job).await;

    let delivery = h.work.receive().await?.expect("delivery");
    assert_eq!(
        processor.process("worker-1", &h.work, delivery).await,
        Disposition::Completed
    );

    let done = h.stores.jobs.get(&job.id).await?;
    let result = done.result.expect("result recorded");
    let reference = result.reference().expect("stored result").clone();
    assert_eq!(reference.container, RESULTS_CONTAINER);
    assert_eq!(reference.object_name, format!("{}/results.json", job.id));

    let stored: JobResults = h.storage.get_json(&reference).await?;
    assert_eq!(stored.job_id, job.id);
    assert_eq!(stored.items.len(), 3);
    assert_eq!(stored.summary, result.summary);
    Ok(())
}

#[tokio::test]
async fn offloaded_job_created_payload_is_resolved() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let job = inline_job("offloaded", 4);
    h.stores.jobs.create(&job).await?;

    let offloader = PayloadOffloader::new(h.storage.clone(), 32);
    let message = offloader
        .offload(JobMessage::job_created(&job, job.correlation_id.clone())?)
        .await?;
    assert!(message.is_offloaded());
    let payload = message.object_refs[0].clone();
    h.work.send(message, None).await?;

    let delivery = h.work.receive().await?.expect("delivery");
    assert_eq!(
        processor.process("worker-1", &h.work, delivery).await,
        Disposition::Completed
    );

    // Settled messages do not leave their payload behind.
    assert!(matches!(
        h.storage.get_object(&payload).await,
        Err(storage::StorageError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn redelivered_claim_resumes_the_running_job() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let job = inline_job("resumed", 2);
    let message = h.submit(&job).await;

    // A previous worker claimed the job with this message, then lost its lease.
    let first = h.work.receive().await?.expect("delivery");
    h.stores.jobs.claim(&job.id, message.message_id).await?.expect("claimed");
    h.work.abandon(first.lock, Duration::ZERO).await?;

    let second = h.work.receive().await?.expect("redelivery");
    assert_eq!(second.delivery_count, 2);
    assert_eq!(
        processor.process("worker-2", &h.work, second).await,
        Disposition::Completed
    );

    let done = h.stores.jobs.get(&job.id).await?;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 2);
    Ok(())
}

#[tokio::test]
async fn lost_lease_stops_without_completing() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let job = inline_job("lease lost", 1);
    h.submit(&job).await;

    let delivery = h.work.receive().await?.expect("delivery");
    // Another party settles the message, invalidating this lock.
    h.work.complete(delivery.lock).await?;

    let disposition = processor.process("worker-1", &h.work, delivery).await;
    assert_eq!(disposition, Disposition::LockLost);

    let running = h.stores.jobs.get(&job.id).await?;
    assert_eq!(running.status, JobStatus::Running);
    assert!(running.result.is_none());
    Ok(())
}

#[tokio::test]
async fn progress_messages_merge_monotonically() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let job = inline_job("progress", 4);
    h.stores.jobs.create(&job).await?;
    h.stores.jobs.claim(&job.id, MessageId::new()).await?;

    for completed in [2, 1] {
        let message = JobMessage::new(
            job.id.clone(),
            MessageType::JobProgress,
            job.correlation_id.clone(),
            &ProgressPayload {
                progress: JobProgress::at(4, completed),
                estimated_completion_at: None,
            },
        )?;
        h.events.send(message, None).await?;
        let delivery = h.events.receive().await?.expect("delivery");
        assert_eq!(
            processor.process("worker-1", &h.events, delivery).await,
            Disposition::Acknowledged
        );
    }

    let running = h.stores.jobs.get(&job.id).await?;
    assert_eq!(running.progress, JobProgress::at(4, 2));
    Ok(())
}

#[tokio::test]
async fn malformed_progress_payload_is_dead_lettered() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let message = JobMessage::new(
        JobId::from_string("job_malformed01"),
        MessageType::JobProgress,
        CorrelationId::generate(),
        &serde_json::json!({ "unexpected": true }),
    )?;
    h.events.send(message, None).await?;

    let delivery = h.events.receive().await?.expect("delivery");
    assert_eq!(
        processor.process("worker-1", &h.events, delivery).await,
        Disposition::DeadLettered {
            reason: INVALID_PAYLOAD.to_string()
        }
    );
    Ok(())
}

#[tokio::test]
async fn job_cancelled_message_cancels_pending_job() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let job = inline_job("to cancel", 1);
    h.stores.jobs.create(&job).await?;

    h.events
        .send(cancellation_message(&job, Some("operator request".into()))?, None)
        .await?;
    let delivery = h.events.receive().await?.expect("delivery");
    assert_eq!(
        processor.process("worker-1", &h.events, delivery).await,
        Disposition::Acknowledged
    );

    let cancelled = h.stores.jobs.get(&job.id).await?;
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(CountingMetrics::get(&h.metrics.cancelled), 1);
    Ok(())
}

#[tokio::test]
async fn notifications_are_acknowledged_without_touching_the_job() -> Result<(), Box<dyn Error>> {
    let h = harness().await;
    let processor = h.processor(SimilarityScorer, fast_settings());
    let job = inline_job("notified", 1);
    h.stores.jobs.create(&job).await?;

    let message = JobMessage::new(
        job.id.clone(),
        MessageType::JobCompleted,
        job.correlation_id.clone(),
        &serde_json::json!({}),
    )?;
    h.events.send(message, None).await?;
    let delivery = h.events.receive().await?.expect("delivery");
    assert_eq!(
        processor.process("worker-1", &h.events, delivery).await,
        Disposition::Acknowledged
    );
    assert_eq!(h.stores.jobs.get(&job.id).await?.status, JobStatus::Pending);
    Ok(())
}
