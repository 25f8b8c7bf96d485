//! Error types for the Synheart Sleep Agent.

use thiserror::Error;

use crate::config::ConfigError;
use crate::source::SourceError;
use crate::store::StoreError;

/// Errors surfaced by the sleep pipeline.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Credentials stayed invalid after one renewal attempt.
    #[error("Re-authentication required: {0}")]
    ReauthRequired(String),
}
