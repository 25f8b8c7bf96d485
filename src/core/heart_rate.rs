//! Bounded, deduplicated heart-rate series.
//!
//! Two views are kept:
//! - the **persisted** view (72h by default), mirrored to the series slot
//! - the **working set** (48h, capped at 5,000 points) that every reader uses
//!
//! Both are sorted ascending with unique minute timestamps after every
//! mutation. All mutations go through one async mutex, so the intraday poll,
//! the fast-poll fallback and manual recalculation cannot interleave and drop
//! each other's points.

use crate::config::BufferConfig;
use crate::core::types::{truncate_to_minute, HeartRatePoint, HeartRateSource};
use crate::error::AgentError;
use crate::store::{self, KeyValueStore, SLOT_HEART_RATE_SERIES};
use chrono::{DateTime, Duration, Utc};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Outcome of a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Timestamps not previously present
    pub added: usize,
    /// Existing timestamps whose value or source changed
    pub updated: usize,
    pub persisted_len: usize,
    pub working_len: usize,
}

/// Both views of the series.
#[derive(Debug, Clone, Default)]
pub struct SeriesState {
    persisted: Vec<HeartRatePoint>,
    working: Vec<HeartRatePoint>,
}

impl SeriesState {
    pub fn persisted(&self) -> &[HeartRatePoint] {
        &self.persisted
    }

    pub fn working(&self) -> &[HeartRatePoint] {
        &self.working
    }

    fn contains_minute(&self, minute: DateTime<Utc>) -> bool {
        let present = |view: &[HeartRatePoint]| {
            view.binary_search_by_key(&minute, |p| p.timestamp).is_ok()
        };
        present(&self.persisted) || present(&self.working)
    }

    fn latest_working(&self) -> Option<DateTime<Utc>> {
        self.working.last().map(|p| p.timestamp)
    }

    /// Upsert into both views, then prune each to its window.
    fn apply(
        &mut self,
        points: &[HeartRatePoint],
        now: DateTime<Utc>,
        settings: &BufferConfig,
    ) -> MergeReport {
        let (added, updated) = upsert(&mut self.persisted, points);
        upsert(&mut self.working, points);

        let persisted_floor = now - Duration::hours(settings.persisted_hours);
        self.persisted.retain(|p| p.timestamp >= persisted_floor);

        let working_floor = now - Duration::hours(settings.working_hours);
        self.working.retain(|p| p.timestamp >= working_floor);
        if self.working.len() > settings.working_max_points {
            let excess = self.working.len() - settings.working_max_points;
            self.working.drain(..excess);
        }

        MergeReport {
            added,
            updated,
            persisted_len: self.persisted.len(),
            working_len: self.working.len(),
        }
    }
}

/// Last write wins per minute; result stays sorted and unique.
fn upsert(view: &mut Vec<HeartRatePoint>, points: &[HeartRatePoint]) -> (usize, usize) {
    let mut by_minute: BTreeMap<DateTime<Utc>, HeartRatePoint> =
        view.drain(..).map(|p| (p.timestamp, p)).collect();

    let mut added = 0;
    let mut updated = 0;
    for point in points {
        let point = HeartRatePoint::new(point.timestamp, point.bpm, point.source);
        match by_minute.insert(point.timestamp, point) {
            None => added += 1,
            Some(previous) if previous != point => updated += 1,
            Some(_) => {}
        }
    }

    view.extend(by_minute.into_values());
    (added, updated)
}

/// Exclusive access to the series for the lifetime of the guard.
///
/// Dropping the guard releases the critical section, including on early
/// returns and `?` paths.
pub struct SeriesWriter<'a> {
    state: MutexGuard<'a, SeriesState>,
    settings: &'a BufferConfig,
}

impl SeriesWriter<'_> {
    pub fn upsert(&mut self, points: &[HeartRatePoint], now: DateTime<Utc>) -> MergeReport {
        self.state.apply(points, now, self.settings)
    }

    pub fn state(&self) -> &SeriesState {
        &self.state
    }
}

/// Heart-rate buffer shared by every producer and reader.
pub struct HeartRateBuffer {
    settings: BufferConfig,
    store: Arc<dyn KeyValueStore>,
    series: Mutex<SeriesState>,
}

impl HeartRateBuffer {
    pub fn new(settings: BufferConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            settings,
            store,
            series: Mutex::new(SeriesState::default()),
        }
    }

    /// Enter the critical section.
    pub async fn lock(&self) -> SeriesWriter<'_> {
        SeriesWriter {
            state: self.series.lock().await,
            settings: &self.settings,
        }
    }

    /// Replace in-memory state with the persisted slot.
    ///
    /// Missing or malformed slots yield an empty series.
    pub async fn load(&self, now: DateTime<Utc>) -> Result<usize, AgentError> {
        let mut writer = self.lock().await;
        let points: Vec<HeartRatePoint> =
            store::load_json(self.store.as_ref(), SLOT_HEART_RATE_SERIES)
                .await?
                .unwrap_or_default();

        *writer.state = SeriesState::default();
        let report = writer.upsert(&points, now);
        tracing::info!(
            persisted = report.persisted_len,
            working = report.working_len,
            "Loaded heart-rate series"
        );
        Ok(report.persisted_len)
    }

    /// Merge a batch of points and persist the result.
    pub async fn merge(
        &self,
        points: &[HeartRatePoint],
        now: DateTime<Utc>,
    ) -> Result<MergeReport, AgentError> {
        let mut writer = self.lock().await;
        let report = writer.upsert(points, now);
        self.persist(&writer).await?;

        tracing::debug!(
            incoming = points.len(),
            added = report.added,
            updated = report.updated,
            persisted = report.persisted_len,
            "Merged heart-rate points"
        );
        Ok(report)
    }

    /// Record a single point.
    pub async fn add_point(
        &self,
        point: HeartRatePoint,
        now: DateTime<Utc>,
    ) -> Result<MergeReport, AgentError> {
        self.merge(std::slice::from_ref(&point), now).await
    }

    /// Synthesize a fallback point from the fast-poll snapshot when the
    /// series has gone stale.
    ///
    /// Stale means the newest working-set point is older than twice the
    /// refresh interval (or there is none). The point lands on the current
    /// minute and is skipped if either view already has that minute.
    pub async fn fallback_check(
        &self,
        now: DateTime<Utc>,
        refresh_interval_minutes: u64,
        last_snapshot_bpm: Option<f64>,
    ) -> Result<Option<HeartRatePoint>, AgentError> {
        let mut writer = self.lock().await;

        let stale_after = stale_horizon(refresh_interval_minutes);
        let fresh = writer
            .state
            .latest_working()
            .is_some_and(|latest| now - latest <= stale_after);
        if fresh {
            return Ok(None);
        }

        let Some(bpm) = last_snapshot_bpm else {
            tracing::debug!("Heart-rate series is stale but no fast snapshot is available");
            return Ok(None);
        };

        let minute = truncate_to_minute(now);
        if writer.state.contains_minute(minute) {
            return Ok(None);
        }

        let point = HeartRatePoint::new(minute, bpm, HeartRateSource::Fallback);
        writer.upsert(&[point], now);
        self.persist(&writer).await?;

        tracing::info!(%minute, bpm, "Inserted fallback heart-rate point");
        Ok(Some(point))
    }

    /// Consistent copy of the working set.
    pub async fn working_snapshot(&self) -> Vec<HeartRatePoint> {
        self.series.lock().await.working.clone()
    }

    pub async fn len(&self) -> (usize, usize) {
        let state = self.series.lock().await;
        (state.persisted.len(), state.working.len())
    }

    async fn persist(&self, writer: &SeriesWriter<'_>) -> Result<(), AgentError> {
        store::save_json(
            self.store.as_ref(),
            SLOT_HEART_RATE_SERIES,
            writer.state.persisted(),
        )
        .await
    }
}

/// Twice the refresh interval, saturating for absurd intervals.
pub fn stale_horizon(refresh_interval_minutes: u64) -> Duration {
    i64::try_from(refresh_interval_minutes)
        .ok()
        .and_then(|m| m.checked_mul(2))
        .and_then(Duration::try_minutes)
        .unwrap_or(Duration::MAX)
}

/// Points with `start <= ts <= end` from a sorted series.
pub fn points_between(
    series: &[HeartRatePoint],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> &[HeartRatePoint] {
    let lo = series.partition_point(|p| p.timestamp < start);
    let hi = series.partition_point(|p| p.timestamp <= end);
    if lo >= hi {
        &[]
    } else {
        &series[lo..hi]
    }
}

/// Mean bpm, or `None` for an empty slice.
pub fn mean_bpm(points: &[HeartRatePoint]) -> Option<f64> {
    if points.is_empty() {
        return None;
    }
    Some(points.iter().map(|p| p.bpm).mean())
}
