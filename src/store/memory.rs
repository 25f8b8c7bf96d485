//! In-process store, used for tests and embedding.

use super::{KeyValueStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, slot: &str) -> Result<Option<String>, StoreError> {
        Ok(self.slots.read().await.get(slot).cloned())
    }

    async fn set(&self, slot: &str, value: String) -> Result<(), StoreError> {
        self.slots.write().await.insert(slot.to_string(), value);
        Ok(())
    }
}
