//! Moves oversized message payloads into the object store and back.

use jobs_core::JobMessage;
use storage::{Storage, StorageError};

/// Container holding offloaded message payloads.
pub const MESSAGE_CONTAINER: &str = "messages";

#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("message {0} carries neither a payload nor a reference")]
    MissingPayload(String),
}

/// Keeps message payloads under `inline_limit` bytes by storing larger ones.
#[derive(Clone)]
pub struct PayloadOffloader {
    storage: Storage,
    inline_limit: usize,
    ttl: Option<chrono::Duration>,
}

impl PayloadOffloader {
    pub fn new(storage: Storage, inline_limit: usize) -> Self {
        Self {
            storage,
            inline_limit,
            ttl: None,
        }
    }

    /// Expire offloaded payloads after `ttl`.
    pub fn with_ttl(mut self, ttl: Option<chrono::Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Replace the payload with an object reference when it is too large to
    /// travel inline. Messages already offloaded are returned unchanged.
    pub async fn offload(&self, mut message: JobMessage) -> Result<JobMessage, OffloadError> {
        if message.is_offloaded() {
            return Ok(message);
        }
        let size = message.payload_size()?;
        if size <= self.inline_limit {
            return Ok(message);
        }

        let object_name = format!("{}/{}.json", message.job_id, message.message_id);
        let reference = self
            .storage
            .put_json(MESSAGE_CONTAINER, &object_name, &message.payload, self.ttl)
            .await?;

        tracing::debug!(
            message_id = %message.message_id,
            job_id = %message.job_id,
            size,
            locator = %reference.locator,
            "Offloaded message payload"
        );

        message.payload = serde_json::Value::Null;
        message.object_refs = vec![reference];
        Ok(message)
    }

    /// Return the message with its payload inline, fetching it when offloaded.
    pub async fn resolve(&self, message: &JobMessage) -> Result<JobMessage, OffloadError> {
        if !message.is_offloaded() {
            return Ok(message.clone());
        }
        let reference = message
            .object_refs
            .first()
            .ok_or_else(|| OffloadError::MissingPayload(message.message_id.to_string()))?;

        let payload: serde_json::Value = self.storage.get_json(reference).await?;
        let mut resolved = message.clone();
        resolved.payload = payload;
        resolved.object_refs.clear();
        Ok(resolved)
    }

    /// Delete the payload objects of a message that was settled.
    pub async fn discard(&self, message: &JobMessage) -> Result<(), OffloadError> {
        for reference in message
            .object_refs
            .iter()
            .filter(|r| r.container == MESSAGE_CONTAINER)
        {
            self.storage.delete(&reference.key()).await?;
            tracing::debug!(
                message_id = %message.message_id,
                locator = %reference.locator,
                "Discarded offloaded payload"
            );
        }
        Ok(())
    }
}
