//! Nightly history and rolling baselines.
//!
//! One [`HistoryEntry`] per local calendar date, capped at the most recent
//! entries. Baselines, deltas and trends are computed over the latest "real"
//! entries, those with heart rate both before and after falling asleep.

use crate::config::{HeuristicConfig, HistoryConfig};
use crate::core::boundary::SleepSource;
use crate::core::heart_rate::mean_bpm;
use crate::core::pending::Resolution;
use crate::core::types::{HeartRatePoint, ValidatedNap};
use crate::error::AgentError;
use crate::store::{self, KeyValueStore, SLOT_SLEEP_HISTORY};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// One finalized night.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Local date of the fell-asleep instant
    pub date: NaiveDate,
    pub fell_asleep_at: DateTime<Utc>,
    pub woke_up_at: DateTime<Utc>,
    /// Strategy that produced `fell_asleep_at`
    pub sleep_source: SleepSource,

    pub minutes_asleep: u32,
    pub time_in_bed: u32,
    pub deep_minutes: u32,
    pub light_minutes: u32,
    pub rem_minutes: u32,
    pub wake_minutes: u32,

    #[serde(default)]
    pub hr_before: Option<f64>,
    #[serde(default)]
    pub hr_after: Option<f64>,
    #[serde(default)]
    pub hr_drop: Option<f64>,

    #[serde(default)]
    pub nap_used: bool,
    #[serde(default)]
    pub nap_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub nap_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub nap_minutes: Option<i64>,

    #[serde(default)]
    pub baseline_hr_before: Option<f64>,
    #[serde(default)]
    pub baseline_hr_after: Option<f64>,
    #[serde(default)]
    pub baseline_hr_drop: Option<f64>,
    #[serde(default)]
    pub delta_hr_before: Option<f64>,
    #[serde(default)]
    pub delta_hr_after: Option<f64>,
    #[serde(default)]
    pub delta_hr_drop: Option<f64>,
    #[serde(default)]
    pub trend_hr_drop: Option<f64>,
    #[serde(default)]
    pub trend_minutes_asleep: Option<f64>,
}

impl HistoryEntry {
    /// Build the nightly record for a resolved main sleep.
    ///
    /// Heart rate before/after is the mean over the comparison window on
    /// either side of the fell-asleep instant.
    pub fn from_resolution(
        resolution: &Resolution,
        working_set: &[HeartRatePoint],
        nap: Option<&ValidatedNap>,
        heuristics: &HeuristicConfig,
        tz: Tz,
    ) -> Self {
        let fell_asleep = resolution.fell_asleep.at;
        let window = Duration::minutes(heuristics.hr_compare_window_minutes);
        let hr_before = mean_in(working_set, fell_asleep - window, fell_asleep);
        let hr_after = mean_in(working_set, fell_asleep, fell_asleep + window);
        let hr_drop = match (hr_before, hr_after) {
            (Some(before), Some(after)) => Some(before - after),
            _ => None,
        };

        let block = &resolution.block;
        let stages = block.stage_summary;
        let nap_block = nap.map(|n| &n.block);

        Self {
            date: fell_asleep.with_timezone(&tz).date_naive(),
            fell_asleep_at: fell_asleep,
            woke_up_at: resolution.woke_up,
            sleep_source: resolution.fell_asleep.source,
            minutes_asleep: block.minutes_asleep,
            time_in_bed: block.time_in_bed,
            deep_minutes: stages.deep_min,
            light_minutes: stages.light_min,
            rem_minutes: stages.rem_min,
            wake_minutes: stages.wake_min,
            hr_before,
            hr_after,
            hr_drop,
            nap_used: nap_block.is_some(),
            nap_start: nap_block.map(|b| b.start_time),
            nap_end: nap_block.map(|b| b.end_time),
            nap_minutes: nap_block.map(|b| b.duration().num_minutes()),
            baseline_hr_before: None,
            baseline_hr_after: None,
            baseline_hr_drop: None,
            delta_hr_before: None,
            delta_hr_after: None,
            delta_hr_drop: None,
            trend_hr_drop: None,
            trend_minutes_asleep: None,
        }
    }

    /// Has heart rate on both sides of falling asleep.
    pub fn is_real(&self) -> bool {
        self.hr_before.is_some() && self.hr_after.is_some()
    }
}

/// Mean bpm over `[start, end)`.
fn mean_in(series: &[HeartRatePoint], start: DateTime<Utc>, end: DateTime<Utc>) -> Option<f64> {
    let lo = series.partition_point(|p| p.timestamp < start);
    let hi = series.partition_point(|p| p.timestamp < end);
    if lo >= hi {
        return None;
    }
    mean_bpm(&series[lo..hi])
}

/// Upsert `entry` by date, cap the history and fill in the entry's
/// baseline, delta and trend fields.
pub fn record_entry(
    entry: HistoryEntry,
    mut history: Vec<HistoryEntry>,
    settings: &HistoryConfig,
) -> Vec<HistoryEntry> {
    let date = entry.date;
    history.retain(|e| e.date != date);
    history.push(entry);
    history.sort_by_key(|e| e.date);

    if history.len() > settings.max_entries {
        let excess = history.len() - settings.max_entries;
        history.drain(..excess);
    }

    let real: Vec<&HistoryEntry> = history.iter().filter(|e| e.is_real()).collect();
    let sample = &real[real.len().saturating_sub(settings.baseline_sample)..];
    let stats = SampleStats::compute(sample, settings);
    let sample_len = sample.len();

    if let Some(current) = history.iter_mut().find(|e| e.date == date) {
        stats.apply(current);
        tracing::debug!(
            %date,
            real = sample_len,
            baseline_drop = ?current.baseline_hr_drop,
            trend_drop = ?current.trend_hr_drop,
            "Recorded history entry"
        );
    }
    history
}

#[derive(Debug, Default)]
struct SampleStats {
    baseline_before: Option<f64>,
    baseline_after: Option<f64>,
    baseline_drop: Option<f64>,
    trend_drop: Option<f64>,
    trend_minutes: Option<f64>,
}

impl SampleStats {
    fn compute(sample: &[&HistoryEntry], settings: &HistoryConfig) -> Self {
        let mut stats = SampleStats::default();

        if sample.len() >= settings.baseline_min_entries && !sample.is_empty() {
            stats.baseline_before = Some(sample.iter().filter_map(|e| e.hr_before).mean());
            stats.baseline_after = Some(sample.iter().filter_map(|e| e.hr_after).mean());
            stats.baseline_drop = Some(sample.iter().filter_map(|e| e.hr_drop).mean());
        }

        if sample.len() >= settings.trend_min_entries {
            if let (Some(first), Some(last)) = (sample.first(), sample.last()) {
                stats.trend_drop = match (first.hr_drop, last.hr_drop) {
                    (Some(a), Some(b)) => Some(b - a),
                    _ => None,
                };
                stats.trend_minutes = Some(f64::from(last.minutes_asleep) - f64::from(first.minutes_asleep));
            }
        }
        stats
    }

    fn apply(&self, entry: &mut HistoryEntry) {
        let delta = |value: Option<f64>, baseline: Option<f64>| Some(value? - baseline?);

        entry.baseline_hr_before = self.baseline_before;
        entry.baseline_hr_after = self.baseline_after;
        entry.baseline_hr_drop = self.baseline_drop;
        entry.delta_hr_before = delta(entry.hr_before, self.baseline_before);
        entry.delta_hr_after = delta(entry.hr_after, self.baseline_after);
        entry.delta_hr_drop = delta(entry.hr_drop, self.baseline_drop);
        entry.trend_hr_drop = self.trend_drop;
        entry.trend_minutes_asleep = self.trend_minutes;
    }
}

/// The persisted nightly history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SleepHistory {
    entries: Vec<HistoryEntry>,
}

impl SleepHistory {
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// Upsert and return the stored copy of the entry.
    pub fn record(&mut self, entry: HistoryEntry, settings: &HistoryConfig) -> Option<&HistoryEntry> {
        let date = entry.date;
        self.entries = record_entry(entry, std::mem::take(&mut self.entries), settings);
        self.entries.iter().find(|e| e.date == date)
    }

    /// Load from the history slot. A malformed slot is an empty history.
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self, AgentError> {
        let entries: Vec<HistoryEntry> = store::load_json(store, SLOT_SLEEP_HISTORY)
            .await?
            .unwrap_or_default();
        Ok(Self { entries })
    }

    pub async fn save(&self, store: &dyn KeyValueStore) -> Result<(), AgentError> {
        store::save_json(store, SLOT_SLEEP_HISTORY, &self.entries).await
    }
}
