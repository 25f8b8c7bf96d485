//! Synheart Sleep Agent - corrected sleep boundaries from wearable telemetry.
//!
//! This library turns noisy device-reported sleep logs and intraday heart
//! rate into corrected fell-asleep / woke-up instants, validated naps and a
//! rolling nightly history with baselines and trends.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Synheart Sleep Agent                        │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐                 │
//! │  │ DataSource │──▶│   Filter   │──▶│  Pending   │──┐              │
//! │  │  (inbox)   │   │  (blocks)  │   │ (confirm)  │  │              │
//! │  └────────────┘   └────────────┘   └────────────┘  ▼              │
//! │        │                │                    ┌────────────┐       │
//! │        ▼                ▼                    │  Boundary  │       │
//! │  ┌────────────┐   ┌────────────┐             │  Resolver  │       │
//! │  │ HeartRate  │──▶│    Nap     │             └────────────┘       │
//! │  │   Buffer   │   │ Validator  │                   │              │
//! │  └────────────┘   └────────────┘                   ▼              │
//! │                                              ┌────────────┐       │
//! │                                              │  History   │       │
//! │                                              │ (baselines)│       │
//! │                                              └────────────┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use synheart_sleep_agent::{Config, FileStore, InboxSource, SleepAgent, SystemClock};
//!
//! # async fn run() -> Result<(), synheart_sleep_agent::AgentError> {
//! let config = Arc::new(Config::default());
//! let agent = SleepAgent::new(
//!     config.clone(),
//!     Arc::new(FileStore::new(config.state_path())),
//!     Arc::new(InboxSource::new(config.inbox_path())),
//!     Arc::new(SystemClock),
//! );
//! agent.restore().await?;
//! let report = agent.refresh_cycle().await?;
//! println!("{:?}", report.sleep);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod source;
pub mod store;

// Re-export key types at crate root for convenience
pub use agent::{AgentStatus, CycleReport, PipelineOutcome, RecalcOutcome, SleepAgent};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError, HeuristicConfig, NapPreference, SleepConfig};
pub use core::{
    HeartRateBuffer, HeartRatePoint, HistoryEntry, SleepBlock, SleepBoundaryResolver,
    SleepPayload, SleepSource,
};
pub use error::AgentError;
pub use source::{DataSource, InboxSource, IntradaySample, SeriesResolution, SourceError};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
