//! Idempotency key reservations for job submission.

use chrono::{DateTime, Duration, Utc};
use jobs_core::JobId;
use serde::{Deserialize, Serialize};

use crate::{Database, DbError};

const TABLE: &str = "idempotency_key";

/// Repository for idempotency key reservations.
#[derive(Clone)]
pub struct IdempotencyRepository {
    db: Database,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdempotencyRecord {
    job_id: String,
    created_at: i64,
    expires_at: i64,
}

/// Outcome of reserving an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The key is now bound to the requested job id.
    Reserved,
    /// A live reservation already binds the key to this job id.
    Existing(JobId),
}

impl IdempotencyRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Atomically bind `key` to `job_id` for `ttl`.
    ///
    /// Record creation is keyed by the idempotency key, so of two concurrent
    /// reservations exactly one wins; the loser sees the winner's job id.
    pub async fn reserve(
        &self,
        key: &str,
        job_id: &JobId,
        ttl: Duration,
    ) -> Result<Reservation, DbError> {
        // One retry covers an expired record that has not been purged yet.
        for _ in 0..2 {
            let now = Utc::now();
            let record = IdempotencyRecord {
                job_id: job_id.to_string(),
                created_at: now.timestamp_millis(),
                expires_at: (now + ttl).timestamp_millis(),
            };

            let created: Result<Option<IdempotencyRecord>, surrealdb::Error> = self
                .db
                .create((TABLE, key.to_string()))
                .content(record)
                .await;

            let create_err = match created {
                Ok(Some(_)) => return Ok(Reservation::Reserved),
                Ok(None) => return Err(DbError::Query("Failed to reserve idempotency key".into())),
                Err(err) => err,
            };

            let existing: Option<IdempotencyRecord> =
                self.db.select((TABLE, key.to_string())).await?;
            match existing {
                Some(existing) if existing.expires_at > now.timestamp_millis() => {
                    tracing::debug!(key, job_id = %existing.job_id, "Idempotency key already reserved");
                    return Ok(Reservation::Existing(JobId::from_string(existing.job_id)));
                }
                Some(_) => {
                    tracing::debug!(key, "Replacing expired idempotency key");
                    let _: Option<IdempotencyRecord> =
                        self.db.delete((TABLE, key.to_string())).await?;
                }
                None => return Err(create_err.into()),
            }
        }

        Err(DbError::Query(format!(
            "idempotency key {key} could not be reserved"
        )))
    }

    /// Look up a live reservation.
    pub async fn lookup(&self, key: &str) -> Result<Option<JobId>, DbError> {
        let record: Option<IdempotencyRecord> = self.db.select((TABLE, key.to_string())).await?;
        let now = Utc::now().timestamp_millis();
        Ok(record
            .filter(|r| r.expires_at > now)
            .map(|r| JobId::from_string(r.job_id)))
    }

    /// Drop a reservation, e.g. when the job could not be persisted.
    pub async fn release(&self, key: &str) -> Result<(), DbError> {
        let _: Option<IdempotencyRecord> = self.db.delete((TABLE, key.to_string())).await?;
        Ok(())
    }

    /// Delete reservations that expired at or before `now`. Returns how many were removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let mut response = self
            .db
            .query("DELETE idempotency_key WHERE expires_at <= $now RETURN BEFORE")
            .bind(("now", now.timestamp_millis()))
            .await?;

        let removed: Vec<IdempotencyRecord> = response.take(0)?;
        Ok(removed.len())
    }
}
