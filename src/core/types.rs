//! Sleep and heart-rate records as reported by the device.
//!
//! Blocks and segments are read-only inputs; heart-rate points are immutable
//! once recorded and only ever superseded by a later point for the same minute.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};

/// Where a heart-rate point came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartRateSource {
    /// Intraday series from the device
    #[default]
    Measured,
    /// Derived from zone/metric summaries
    Zonemetrics,
    /// Synthesized from the fast poll when the series went stale
    Fallback,
}

/// One heart-rate sample at minute precision.
///
/// Serialized as `{ts, value, source?}` in the persisted series slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartRatePoint {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "value")]
    pub bpm: f64,
    #[serde(default)]
    pub source: HeartRateSource,
}

impl HeartRatePoint {
    /// Create a point, truncating the timestamp to the minute.
    pub fn new(timestamp: DateTime<Utc>, bpm: f64, source: HeartRateSource) -> Self {
        Self {
            timestamp: truncate_to_minute(timestamp),
            bpm,
            source,
        }
    }

    pub fn measured(timestamp: DateTime<Utc>, bpm: f64) -> Self {
        Self::new(timestamp, bpm, HeartRateSource::Measured)
    }
}

/// Drop seconds and sub-second precision.
pub fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .duration_trunc(Duration::minutes(1))
        .unwrap_or(instant)
}

/// Sleep stage reported for a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SleepLevel {
    Wake,
    Asleep,
    Light,
    Deep,
    Rem,
}

impl SleepLevel {
    /// Anything but `wake`.
    pub fn is_asleep_family(&self) -> bool {
        !matches!(self, SleepLevel::Wake)
    }

    pub fn is_deep_or_rem(&self) -> bool {
        matches!(self, SleepLevel::Deep | SleepLevel::Rem)
    }
}

/// A contiguous stretch of a single sleep level inside a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepSegment {
    pub start_time: DateTime<Utc>,
    pub level: SleepLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
}

impl SleepSegment {
    pub fn new(start_time: DateTime<Utc>, level: SleepLevel, duration_seconds: Option<i64>) -> Self {
        Self {
            start_time,
            level,
            duration_seconds,
        }
    }
}

/// Per-stage minute totals reported with a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSummary {
    pub deep_min: u32,
    pub light_min: u32,
    pub rem_min: u32,
    pub wake_min: u32,
}

/// One sleep log from the device: a main sleep or a nap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_main_sleep: bool,
    #[serde(default)]
    pub minutes_asleep: u32,
    #[serde(default)]
    pub time_in_bed: u32,
    #[serde(default)]
    pub segments: Vec<SleepSegment>,
    #[serde(default)]
    pub stage_summary: StageSummary,
}

impl SleepBlock {
    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    /// End of segment `index`: its own duration when known, else the next
    /// segment's start, else the block end.
    pub fn segment_end(&self, index: usize) -> DateTime<Utc> {
        let segment = &self.segments[index];
        if let Some(secs) = segment.duration_seconds {
            return segment.start_time + Duration::seconds(secs);
        }
        self.segments
            .get(index + 1)
            .map(|next| next.start_time)
            .unwrap_or(self.end_time)
    }

    /// Length of segment `index`, never negative.
    pub fn segment_duration(&self, index: usize) -> Duration {
        let length = self.segment_end(index) - self.segments[index].start_time;
        length.max(Duration::zero())
    }

    pub fn first_asleep_index(&self) -> Option<usize> {
        self.segments.iter().position(|s| s.level.is_asleep_family())
    }

    pub fn last_asleep_index(&self) -> Option<usize> {
        self.segments.iter().rposition(|s| s.level.is_asleep_family())
    }
}

/// Daily sleep response: `{sleep: [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SleepPayload {
    #[serde(default)]
    pub sleep: Vec<SleepBlock>,
}

/// A main sleep waiting for heart-rate corroboration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMainSleep {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub raw_block: SleepBlock,
}

impl PendingMainSleep {
    pub fn from_block(block: SleepBlock) -> Self {
        Self {
            start: block.start_time,
            end: block.end_time,
            raw_block: block,
        }
    }
}

/// Nap plus the validator's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatedNap {
    pub block: SleepBlock,
    pub is_valid: bool,
    /// Mean bpm over the nap, when any samples fell inside it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_bpm: Option<f64>,
}
