//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables, fields, and indexes. Safe to run on
/// every start.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(IDEMPOTENCY_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema. Timestamps are unix milliseconds; structured columns
/// (configuration, error, result) hold JSON text.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON job TYPE string;
DEFINE FIELD IF NOT EXISTS name ON job TYPE string;
DEFINE FIELD IF NOT EXISTS description ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS job_type ON job TYPE string;
DEFINE FIELD IF NOT EXISTS status ON job TYPE string;
DEFINE FIELD IF NOT EXISTS created_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS updated_at ON job TYPE int;
DEFINE FIELD IF NOT EXISTS started_at ON job TYPE option<int>;
DEFINE FIELD IF NOT EXISTS completed_at ON job TYPE option<int>;
DEFINE FIELD IF NOT EXISTS estimated_completion_at ON job TYPE option<int>;
DEFINE FIELD IF NOT EXISTS configuration ON job TYPE string;
DEFINE FIELD IF NOT EXISTS total_items ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS completed_items ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS percentage ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS error ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS result ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS attempts ON job TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS claimed_by ON job TYPE option<string>;
DEFINE FIELD IF NOT EXISTS correlation_id ON job TYPE string;

-- Indexes for list filters and sorting
DEFINE INDEX IF NOT EXISTS job_job_id ON job FIELDS job_id UNIQUE;
DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_type ON job FIELDS job_type;
DEFINE INDEX IF NOT EXISTS job_created ON job FIELDS created_at;
"#;

/// Idempotency reservations keyed by the client supplied key.
const IDEMPOTENCY_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS idempotency_key SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS job_id ON idempotency_key TYPE string;
DEFINE FIELD IF NOT EXISTS created_at ON idempotency_key TYPE int;
DEFINE FIELD IF NOT EXISTS expires_at ON idempotency_key TYPE int;

DEFINE INDEX IF NOT EXISTS idempotency_expires ON idempotency_key FIELDS expires_at;
"#;
