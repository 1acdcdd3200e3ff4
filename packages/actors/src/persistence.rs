//! File-based snapshots of queue state.

use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Snapshot persistence for queue actors.
///
/// One JSON file per queue under `base_dir`, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct StatePersistence {
    /// Base directory for state files.
    base_dir: PathBuf,
}

impl StatePersistence {
    /// Create a new persistence instance.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Ensure the base directory exists.
    pub async fn init(&self) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.base_dir).await?;
        Ok(())
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{name}.json"))
    }

    /// Save state to a file.
    pub async fn save<T: Serialize>(&self, name: &str, state: &T) -> Result<(), PersistenceError> {
        let path = self.path_for(name);
        let json = serde_json::to_vec_pretty(state)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = self.base_dir.join(format!("{name}.json.tmp"));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &path).await?;

        tracing::debug!("Saved state to {:?}", path);
        Ok(())
    }

    /// Load state from a file, or `None` when nothing was saved yet.
    pub async fn load<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, PersistenceError> {
        let path = self.path_for(name);

        let json = match fs::read(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: T = serde_json::from_slice(&json)?;
        tracing::debug!("Loaded state from {:?}", path);

        Ok(Some(state))
    }
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
