//! One JSON file per slot under a state directory.

use super::{KeyValueStore, StoreError};
use async_trait::async_trait;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn slot_path(&self, slot: &str) -> Result<PathBuf, StoreError> {
        // Slot names become file names; keep them flat.
        if slot.is_empty() || slot.contains(['/', '\\']) || slot.starts_with('.') {
            return Err(StoreError::InvalidSlot(slot.to_string()));
        }
        Ok(self.dir.join(format!("{slot}.json")))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, slot: &str) -> Result<Option<String>, StoreError> {
        let path = self.slot_path(slot)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                slot: slot.to_string(),
                source,
            }),
        }
    }

    async fn set(&self, slot: &str, value: String) -> Result<(), StoreError> {
        let path = self.slot_path(slot)?;
        let io_err = |source| StoreError::Io {
            slot: slot.to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;

        // Write-then-rename so a crash never leaves half a document behind.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }
}
