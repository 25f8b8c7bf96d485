//! Persistent key-value slots.
//!
//! The pipeline only ever reads and writes whole JSON documents in named
//! string slots; how they are stored is up to the [`KeyValueStore`].

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Heart-rate series: `[{ts, value, source?}]`, ascending, at most 72h.
pub const SLOT_HEART_RATE_SERIES: &str = "heartRate.series";
/// Nightly history: `[HistoryEntry]`, one per date.
pub const SLOT_SLEEP_HISTORY: &str = "sleep.history";
/// Last daily sleep payload seen, used by manual recalculation.
pub const SLOT_LAST_RAW_PAYLOAD: &str = "sleep.lastRawPayload";
/// Pending main sleep, or `null`.
pub const SLOT_PENDING: &str = "sleep.pending";
/// Identity of the last recorded main sleep, or `null`.
pub const SLOT_LAST_RESOLVED: &str = "sleep.lastResolved";

pub const SLOT_DEEP_MINUTES: &str = "sleep.deepMinutes";
pub const SLOT_LIGHT_MINUTES: &str = "sleep.lightMinutes";
pub const SLOT_REM_MINUTES: &str = "sleep.remMinutes";
pub const SLOT_WAKE_MINUTES: &str = "sleep.wakeMinutes";
pub const SLOT_HR_BEFORE: &str = "sleep.hrBefore";
pub const SLOT_HR_AFTER: &str = "sleep.hrAfter";
pub const SLOT_HR_DROP: &str = "sleep.hrDrop";

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on slot '{slot}': {source}")]
    Io {
        slot: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid slot name '{0}'")]
    InvalidSlot(String),
}

/// Async get/set of named string slots.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, slot: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, slot: &str, value: String) -> Result<(), StoreError>;
}

/// Read a JSON slot.
///
/// A missing slot is `Ok(None)`. An unparsable document is logged and also
/// treated as missing so callers fall back to empty state.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    slot: &str,
) -> Result<Option<T>, StoreError> {
    let Some(raw) = store.get(slot).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(slot, error = %e, "Malformed JSON in slot, using empty state");
            Ok(None)
        }
    }
}

/// Write a JSON slot.
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    slot: &str,
    value: &T,
) -> Result<(), crate::error::AgentError> {
    let json = serde_json::to_string(value)?;
    store.set(slot, json).await?;
    Ok(())
}
