//! JSON repository for persisted state
//!
//! Every persisted entity (queue mirror, backup index, rollback points,
//! usage aggregates) goes through a `JsonStore`, which guarantees atomic
//! writes (temp file + rename), single-writer discipline per file, and a
//! schema-version envelope so future readers can migrate.

use crate::{NocturnalError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Versioned<T> {
    schema_version: u32,
    data: T,
}

/// Single-file JSON repository
///
/// Concurrent writers for the same file are prohibited; the internal lock
/// serializes them. Distinct files get distinct stores.
pub struct JsonStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Atomically persist `value`: serialize to a sibling temp file, then
    /// rename over the target.
    pub async fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let envelope = Versioned {
            schema_version: SCHEMA_VERSION,
            data: value,
        };
        let json = serde_json::to_vec_pretty(&envelope)?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;

        debug!("Persisted {} ({} bytes)", self.path.display(), json.len());
        Ok(())
    }

    /// Load the stored value, or None when the file does not exist yet.
    pub async fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let _guard = self.lock.lock().await;

        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = tokio::fs::read(&self.path).await?;
        let envelope: Versioned<T> = serde_json::from_slice(&bytes)?;

        if envelope.schema_version > SCHEMA_VERSION {
            warn!(
                "{} written by a newer schema (v{} > v{})",
                self.path.display(),
                envelope.schema_version,
                SCHEMA_VERSION
            );
            return Err(NocturnalError::Validation(format!(
                "unsupported schema version {} in {}",
                envelope.schema_version,
                self.path.display()
            )));
        }

        Ok(Some(envelope.data))
    }

    /// Load with a fallback default for first runs.
    pub async fn load_or_default<T: DeserializeOwned + Default>(&self) -> Result<T> {
        Ok(self.load().await?.unwrap_or_default())
    }
}
