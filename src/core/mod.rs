//! Core sleep processing for the Synheart Sleep Agent.
//!
//! This module contains:
//! - The bounded heart-rate buffer shared by every producer
//! - Filtering of raw device sleep blocks
//! - Nap validation
//! - Fell-asleep / woke-up boundary correction
//! - The pending-confirmation state machine
//! - Nightly history with baselines and trends

pub mod boundary;
pub mod filter;
pub mod heart_rate;
pub mod history;
pub mod nap;
pub mod pending;
pub mod types;

// Re-export commonly used types
pub use boundary::{Candidate, ResolveOptions, SleepBoundaryResolver, SleepSource, WakeAssessment};
pub use filter::filter_blocks;
pub use heart_rate::{HeartRateBuffer, MergeReport};
pub use history::{record_entry, HistoryEntry, SleepHistory};
pub use nap::{accept_all, select_nap, validate_naps};
pub use pending::{CheckOutcome, NightKey, PendingSleepStateMachine, Resolution, ResolutionRoute};
pub use types::{
    HeartRatePoint, HeartRateSource, PendingMainSleep, SleepBlock, SleepLevel, SleepPayload,
    SleepSegment, StageSummary, ValidatedNap,
};
