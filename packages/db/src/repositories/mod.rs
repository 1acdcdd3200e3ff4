//! Repository implementations for database operations.

mod idempotency_repo;
mod job_repo;

pub use idempotency_repo::{IdempotencyRepository, Reservation};
pub use job_repo::JobRepository;
