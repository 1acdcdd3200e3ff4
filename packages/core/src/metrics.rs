//! Metrics seam invoked at job transition points.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::job::JobType;

/// Receives lifecycle counters. Implementations must be cheap and never fail.
pub trait JobMetrics: Send + Sync + 'static {
    fn job_submitted(&self, _job_type: JobType) {}
    fn job_deduplicated(&self) {}
    fn job_started(&self, _job_type: JobType) {}
    fn job_completed(&self, _job_type: JobType, _duration_ms: u64) {}
    fn job_failed(&self, _job_type: JobType, _code: &str) {}
    fn job_cancelled(&self) {}
    fn item_retried(&self) {}
    fn message_dead_lettered(&self) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl JobMetrics for NoopMetrics {}

/// In-memory counters, mainly for tests and the health endpoint.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    pub submitted: AtomicU64,
    pub deduplicated: AtomicU64,
    pub started: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
}

impl CountingMetrics {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl JobMetrics for CountingMetrics {
    fn job_submitted(&self, _job_type: JobType) {
        bump(&self.submitted);
    }

    fn job_deduplicated(&self) {
        bump(&self.deduplicated);
    }

    fn job_started(&self, _job_type: JobType) {
        bump(&self.started);
    }

    fn job_completed(&self, _job_type: JobType, _duration_ms: u64) {
        bump(&self.completed);
    }

    fn job_failed(&self, _job_type: JobType, _code: &str) {
        bump(&self.failed);
    }

    fn job_cancelled(&self) {
        bump(&self.cancelled);
    }

    fn item_retried(&self) {
        bump(&self.retried);
    }

    fn message_dead_lettered(&self) {
        bump(&self.dead_lettered);
    }
}
