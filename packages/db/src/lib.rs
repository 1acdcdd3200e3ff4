//! SurrealDB integration for the evaluation job system.
//!
//! This crate provides database connectivity and repositories for
//! persisting jobs and idempotency keys.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
pub mod repositories;

pub use connection::{Database, DbConfig, DbError, connect};
pub use repositories::{IdempotencyRepository, JobRepository, Reservation};
pub use schema::init_schema;

/// Repositories sharing one connection.
#[derive(Clone)]
pub struct Stores {
    pub jobs: JobRepository,
    pub idempotency: IdempotencyRepository,
}

impl Stores {
    pub fn new(db: Database) -> Self {
        Self {
            jobs: JobRepository::new(db.clone()),
            idempotency: IdempotencyRepository::new(db),
        }
    }
}

/// Connect with the given configuration and build the repositories.
///
/// This should be called once at application startup.
pub async fn init(config: &DbConfig) -> Result<Stores, DbError> {
    let db = connect(config).await?;
    Ok(Stores::new(db))
}
