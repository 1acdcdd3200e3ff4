//! Pointers to payloads held in the object store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Indirection pointer to a blob in the object store.
///
/// Jobs and messages only hold these pointers; nothing guarantees the blob
/// still exists when the reference is followed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub id: String,
    pub container: String,
    pub object_name: String,
    pub content_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Backend specific locator, e.g. `s3://results/job_x/results.json`.
    pub locator: String,
}

impl ObjectReference {
    pub fn new(
        container: impl Into<String>,
        object_name: impl Into<String>,
        content_type: impl Into<String>,
        size: u64,
        locator: impl Into<String>,
    ) -> Self {
        Self {
            id: Ulid::new().to_string(),
            container: container.into(),
            object_name: object_name.into(),
            content_type: content_type.into(),
            size,
            created_at: Utc::now(),
            expires_at: None,
            locator: locator.into(),
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Object key relative to the store root.
    pub fn key(&self) -> String {
        format!("{}/{}", self.container, self.object_name)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
