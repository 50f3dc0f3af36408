// ABOUTME: Watermark persistence for per-table sync anchors
// ABOUTME: File-backed store with one version file per table, plus an in-memory twin

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

use super::error::SyncError;

/// Durable key-value store for per-table watermarks.
///
/// A watermark is the last change-tracking version successfully published
/// for a table. Absence is a valid default: `get` returns 0 for a table
/// that has never been synced, never an error.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Last persisted version for the table, or 0 if never set.
    async fn get(&self, table: &str) -> Result<i64, SyncError>;

    /// Durably overwrite the version for the table. Last write wins.
    async fn set(&self, table: &str, version: i64) -> Result<(), SyncError>;

    /// Idempotently create a zero entry for the table if none exists.
    /// Run once at startup for every configured table.
    async fn initialize_if_absent(&self, table: &str) -> Result<(), SyncError>;
}

#[async_trait]
impl<T: WatermarkStore + ?Sized> WatermarkStore for std::sync::Arc<T> {
    async fn get(&self, table: &str) -> Result<i64, SyncError> {
        (**self).get(table).await
    }

    async fn set(&self, table: &str, version: i64) -> Result<(), SyncError> {
        (**self).set(table, version).await
    }

    async fn initialize_if_absent(&self, table: &str) -> Result<(), SyncError> {
        (**self).initialize_if_absent(table).await
    }
}

/// File-backed watermark store.
///
/// Each table gets one file under the store directory, named
/// `<table>.version`, containing the decimal string encoding of the
/// version. Writes go through a temp file and a rename so a crash never
/// leaves a half-written value behind.
pub struct FileWatermarkStore {
    dir: PathBuf,
}

impl FileWatermarkStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            SyncError::StoreUnavailable(format!(
                "failed to create watermark directory {:?}: {}",
                dir, e
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.version", table))
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn get(&self, table: &str) -> Result<i64, SyncError> {
        let path = self.file_path(table);
        match fs::read_to_string(&path).await {
            Ok(contents) => contents.trim().parse::<i64>().map_err(|_| {
                SyncError::StoreUnavailable(format!(
                    "corrupt watermark for '{}': can't parse the stored value '{}'",
                    table,
                    contents.trim()
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(SyncError::StoreUnavailable(format!(
                "failed to read watermark for '{}': {}",
                table, e
            ))),
        }
    }

    async fn set(&self, table: &str, version: i64) -> Result<(), SyncError> {
        let path = self.file_path(table);
        let temp_path = path.with_extension("version.tmp");

        fs::write(&temp_path, version.to_string())
            .await
            .map_err(|e| {
                SyncError::StoreUnavailable(format!(
                    "failed to write watermark for '{}': {}",
                    table, e
                ))
            })?;

        fs::rename(&temp_path, &path).await.map_err(|e| {
            SyncError::StoreUnavailable(format!(
                "failed to persist watermark for '{}': {}",
                table, e
            ))
        })?;

        tracing::debug!("Watermark for '{}' set to {}", table, version);
        Ok(())
    }

    async fn initialize_if_absent(&self, table: &str) -> Result<(), SyncError> {
        let path = self.file_path(table);
        match fs::metadata(&path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.set(table, 0).await,
            Err(e) => Err(SyncError::StoreUnavailable(format!(
                "failed to stat watermark for '{}': {}",
                table, e
            ))),
        }
    }
}

/// In-memory watermark store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryWatermarkStore {
    versions: RwLock<HashMap<String, i64>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, table: &str) -> Result<i64, SyncError> {
        Ok(self.versions.read().await.get(table).copied().unwrap_or(0))
    }

    async fn set(&self, table: &str, version: i64) -> Result<(), SyncError> {
        self.versions
            .write()
            .await
            .insert(table.to_string(), version);
        Ok(())
    }

    async fn initialize_if_absent(&self, table: &str) -> Result<(), SyncError> {
        self.versions
            .write()
            .await
            .entry(table.to_string())
            .or_insert(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_defaults_to_zero() {
        let store = MemoryWatermarkStore::new();
        assert_eq!(store.get("employees").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryWatermarkStore::new();
        store.set("employees", 42).await.unwrap();
        assert_eq!(store.get("employees").await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_memory_store_initialize_preserves_existing() {
        let store = MemoryWatermarkStore::new();
        store.set("employees", 7).await.unwrap();
        store.initialize_if_absent("employees").await.unwrap();
        store.initialize_if_absent("orders").await.unwrap();
        assert_eq!(store.get("employees").await.unwrap(), 7);
        assert_eq!(store.get("orders").await.unwrap(), 0);
    }
}
