//! The sleep agent: owned pipeline state plus the three periodic triggers.
//!
//! ```text
//!  refresh tick ──► fetch sleep ──► filter ──► naps ──► validate
//!                                       └────► main ──► pending ─┐
//!                ──► fetch intraday ──► HeartRateBuffer          │
//!                ──► pending check ◄─────────────────────────────┘
//!                         └──► resolve ──► history + scalar slots
//!  intraday tick ──► fetch 1min series ──► HeartRateBuffer
//!  fast tick     ──► fetch 1sec series ──► snapshot ──► fallback check
//! ```

use crate::clock::Clock;
use crate::config::Config;
use crate::core::boundary::SleepBoundaryResolver;
use crate::core::filter::filter_blocks;
use crate::core::heart_rate::{stale_horizon, HeartRateBuffer, MergeReport};
use crate::core::history::{HistoryEntry, SleepHistory};
use crate::core::nap::{accept_all, select_nap, validate_naps};
use crate::core::pending::{
    resolve_block, CheckOutcome, PendingSleepStateMachine, Resolution, ResolutionRoute,
};
use crate::core::types::{HeartRatePoint, PendingMainSleep, SleepBlock, SleepPayload, ValidatedNap};
use crate::error::AgentError;
use crate::source::{DataSource, IntradaySample, SeriesResolution, SourceError};
use crate::store::{self, KeyValueStore};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

/// What the record pipeline did with a sleep payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// No main sleep survived filtering
    NoMainSleep,
    /// Main sleep is waiting for corroboration
    Pending(PendingMainSleep),
    /// Main sleep was already recorded by an earlier cycle
    AlreadyRecorded,
    /// Main sleep was resolved and recorded
    Finalized(HistoryEntry),
}

/// Summary of one refresh cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub sleep: Option<PipelineOutcome>,
    pub merged: Option<MergeReport>,
    pub pending: Option<CheckOutcome>,
    /// Record types skipped this cycle
    pub failures: Vec<&'static str>,
}

/// Result of a manual recalculation request.
#[derive(Debug, Clone, PartialEq)]
pub enum RecalcOutcome {
    /// Another recalculation is in progress
    AlreadyRunning,
    /// No sleep payload has been seen yet
    NoPayload,
    /// The last payload has no usable main sleep
    NoMainSleep,
    Checked(CheckOutcome),
}

/// Snapshot for the `status` command.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub pending: Option<PendingMainSleep>,
    pub persisted_points: usize,
    pub working_points: usize,
    pub latest: Option<HistoryEntry>,
}

/// Most recent sample from the fast poll.
#[derive(Debug, Clone, Copy)]
struct FastSnapshot {
    at: DateTime<Utc>,
    bpm: f64,
}

/// Clears the recalculation flag when dropped.
struct RecalcGuard<'a>(&'a AtomicBool);

impl Drop for RecalcGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns every piece of pipeline state; share it behind an `Arc`.
pub struct SleepAgent {
    config: Arc<Config>,
    store: Arc<dyn KeyValueStore>,
    source: Arc<dyn DataSource>,
    clock: Arc<dyn Clock>,
    buffer: HeartRateBuffer,
    pending: Mutex<PendingSleepStateMachine>,
    fast_snapshot: Mutex<Option<FastSnapshot>>,
    recalculating: AtomicBool,
}

impl SleepAgent {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn KeyValueStore>,
        source: Arc<dyn DataSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let buffer = HeartRateBuffer::new(config.buffer.clone(), store.clone());
        Self {
            config,
            store,
            source,
            clock,
            buffer,
            pending: Mutex::new(PendingSleepStateMachine::new()),
            fast_snapshot: Mutex::new(None),
            recalculating: AtomicBool::new(false),
        }
    }

    /// Reload the heart-rate series and any pending record from the store.
    pub async fn restore(&self) -> Result<(), AgentError> {
        self.buffer.load(self.clock.now()).await?;
        let restored = PendingSleepStateMachine::load(self.store.as_ref()).await?;
        if let Some(record) = restored.current() {
            tracing::info!(start = %record.start, "Restored pending main sleep");
        }
        *self.pending.lock().await = restored;
        Ok(())
    }

    pub async fn pending(&self) -> Option<PendingMainSleep> {
        self.pending.lock().await.current().cloned()
    }

    pub async fn history(&self) -> Result<SleepHistory, AgentError> {
        SleepHistory::load(self.store.as_ref()).await
    }

    pub async fn status(&self) -> Result<AgentStatus, AgentError> {
        let (persisted_points, working_points) = self.buffer.len().await;
        Ok(AgentStatus {
            pending: self.pending().await,
            persisted_points,
            working_points,
            latest: self.history().await?.latest().cloned(),
        })
    }

    /// Run a fetch under the source error policy.
    ///
    /// Unauthorized: renew once and retry; still unauthorized is
    /// `ReauthRequired`. Rate limited: pause `min(advised, cap)` and retry once.
    async fn fetch_with_policy<T, F, Fut>(&self, what: &'static str, fetch: F) -> Result<T, AgentError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        match fetch().await {
            Err(SourceError::Unauthorized) => {
                tracing::warn!(what, "Credentials rejected, renewing");
                if let Err(e) = self.source.renew_credentials().await {
                    return Err(AgentError::ReauthRequired(format!("{what}: renewal failed: {e}")));
                }
                match fetch().await {
                    Err(SourceError::Unauthorized) => Err(AgentError::ReauthRequired(format!(
                        "{what}: still unauthorized after renewal"
                    ))),
                    other => other.map_err(AgentError::from),
                }
            }
            Err(SourceError::RateLimited { retry_after }) => {
                let cap = self.config.heuristics.rate_limit_max_pause;
                let pause = retry_after.map_or(cap, |advised| advised.min(cap));
                tracing::warn!(what, pause_secs = pause.as_secs_f64(), "Rate limited, pausing");
                tokio::time::sleep(pause).await;
                fetch().await.map_err(AgentError::from)
            }
            other => other.map_err(AgentError::from),
        }
    }

    /// One main refresh: sleep payload, intraday series, pending check.
    ///
    /// Each record type fails on its own; only `ReauthRequired` ends the cycle.
    pub async fn refresh_cycle(&self) -> Result<CycleReport, AgentError> {
        let cycle_id = Uuid::new_v4();
        let span = tracing::info_span!("refresh", %cycle_id);
        self.refresh_inner(cycle_id).instrument(span).await
    }

    async fn refresh_inner(&self, cycle_id: Uuid) -> Result<CycleReport, AgentError> {
        let mut report = CycleReport {
            cycle_id,
            sleep: None,
            merged: None,
            pending: None,
            failures: Vec::new(),
        };

        match self.refresh_sleep().await {
            Ok(outcome) => report.sleep = Some(outcome),
            Err(e @ AgentError::ReauthRequired(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Sleep processing skipped this cycle");
                report.failures.push("sleep");
            }
        }

        match self.refresh_heart_rate().await {
            Ok(merged) => report.merged = Some(merged),
            Err(e @ AgentError::ReauthRequired(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Heart-rate merge skipped this cycle");
                report.failures.push("heart rate");
            }
        }

        match self.check_pending().await {
            Ok(outcome) => report.pending = Some(outcome),
            Err(e) => {
                tracing::warn!(error = %e, "Pending check failed");
                report.failures.push("pending");
            }
        }

        tracing::info!(failures = report.failures.len(), "Refresh cycle complete");
        Ok(report)
    }

    async fn refresh_sleep(&self) -> Result<PipelineOutcome, AgentError> {
        let today = self.clock.now().with_timezone(&self.config.timezone).date_naive();
        let payload = self
            .fetch_with_policy("sleep", || self.source.fetch_daily_sleep(today))
            .await?;
        store::save_json(self.store.as_ref(), store::SLOT_LAST_RAW_PAYLOAD, &payload).await?;
        self.process_payload(&payload).await
    }

    async fn refresh_heart_rate(&self) -> Result<MergeReport, AgentError> {
        let samples = self
            .fetch_with_policy("heart rate", || {
                self.source.fetch_intraday_series(SeriesResolution::OneMinute)
            })
            .await?;
        self.merge_samples(samples).await
    }

    /// Filter a payload and route its main sleep.
    pub async fn process_payload(&self, payload: &SleepPayload) -> Result<PipelineOutcome, AgentError> {
        let blocks = filter_blocks(&payload.sleep, &self.config.sleep, self.config.timezone);
        let Some(main) = longest_main(&blocks) else {
            tracing::debug!(blocks = blocks.len(), "No main sleep in payload");
            return Ok(PipelineOutcome::NoMainSleep);
        };

        let mut pending = self.pending.lock().await;
        if self.config.live_corroboration {
            if !pending.begin_unless_resolved(main.clone()) {
                return Ok(PipelineOutcome::AlreadyRecorded);
            }
            pending.save(self.store.as_ref()).await?;
            return Ok(PipelineOutcome::Pending(PendingMainSleep::from_block(
                main.clone(),
            )));
        }

        if pending.is_resolved(main) {
            tracing::debug!(start = %main.start_time, "Main sleep already recorded");
            return Ok(PipelineOutcome::AlreadyRecorded);
        }
        let working = self.buffer.working_snapshot().await;
        let resolver = SleepBoundaryResolver::from_config(&self.config);
        let resolution = resolve_block(&resolver, main, &working, ResolutionRoute::Immediate);
        let entry = self.finalize(&resolution, &working).await?;
        pending.complete(&resolution);
        pending.save(self.store.as_ref()).await?;
        Ok(PipelineOutcome::Finalized(entry))
    }

    /// Run the pending check against the current working set.
    ///
    /// The record is only cleared after the night has been written; a failed
    /// write leaves it pending for the next check.
    pub async fn check_pending(&self) -> Result<CheckOutcome, AgentError> {
        let working = self.buffer.working_snapshot().await;
        let resolver = SleepBoundaryResolver::from_config(&self.config);

        let mut pending = self.pending.lock().await;
        let outcome = pending.check(self.clock.now(), &working, &resolver);
        if let CheckOutcome::Resolved(resolution) = &outcome {
            self.finalize(resolution, &working).await?;
            pending.complete(resolution);
            pending.save(self.store.as_ref()).await?;
        }
        Ok(outcome)
    }

    /// Record a resolved night: history entry plus scalar slots.
    async fn finalize(
        &self,
        resolution: &Resolution,
        working: &[HeartRatePoint],
    ) -> Result<HistoryEntry, AgentError> {
        let naps = self.validated_naps(working).await?;
        let nap = select_nap(&naps, self.config.sleep.nap_preference);
        let entry = HistoryEntry::from_resolution(
            resolution,
            working,
            nap,
            &self.config.heuristics,
            self.config.timezone,
        );

        let mut history = SleepHistory::load(self.store.as_ref()).await?;
        let stored = history
            .record(entry.clone(), &self.config.history)
            .cloned()
            .unwrap_or(entry);
        history.save(self.store.as_ref()).await?;
        self.save_scalars(&stored).await?;

        tracing::info!(
            date = %stored.date,
            fell_asleep = %stored.fell_asleep_at,
            woke_up = %stored.woke_up_at,
            source = %stored.sleep_source,
            hr_drop = ?stored.hr_drop,
            nap_used = stored.nap_used,
            "Recorded night"
        );
        Ok(stored)
    }

    /// Naps from the last raw payload, judged against `working`.
    async fn validated_naps(&self, working: &[HeartRatePoint]) -> Result<Vec<ValidatedNap>, AgentError> {
        let payload: SleepPayload = store::load_json(self.store.as_ref(), store::SLOT_LAST_RAW_PAYLOAD)
            .await?
            .unwrap_or_default();
        let blocks = filter_blocks(&payload.sleep, &self.config.sleep, self.config.timezone);
        let naps: Vec<SleepBlock> = blocks.into_iter().filter(|b| !b.is_main_sleep).collect();

        Ok(if self.config.sleep.nap_validation_enabled {
            validate_naps(&naps, working, &self.config.heuristics)
        } else {
            accept_all(&naps)
        })
    }

    async fn save_scalars(&self, entry: &HistoryEntry) -> Result<(), AgentError> {
        let s = self.store.as_ref();
        store::save_json(s, store::SLOT_DEEP_MINUTES, &entry.deep_minutes).await?;
        store::save_json(s, store::SLOT_LIGHT_MINUTES, &entry.light_minutes).await?;
        store::save_json(s, store::SLOT_REM_MINUTES, &entry.rem_minutes).await?;
        store::save_json(s, store::SLOT_WAKE_MINUTES, &entry.wake_minutes).await?;

        let heart_rate = [
            (store::SLOT_HR_BEFORE, entry.hr_before),
            (store::SLOT_HR_AFTER, entry.hr_after),
            (store::SLOT_HR_DROP, entry.hr_drop),
        ];
        for (slot, value) in heart_rate {
            if let Some(value) = value {
                store::save_json(s, slot, &value).await?;
            }
        }
        Ok(())
    }

    async fn merge_samples(&self, samples: Vec<IntradaySample>) -> Result<MergeReport, AgentError> {
        let points: Vec<HeartRatePoint> = samples.into_iter().map(HeartRatePoint::from).collect();
        self.buffer.merge(&points, self.clock.now()).await
    }

    /// Intraday trigger: merge the 1-minute series.
    pub async fn poll_intraday(&self) -> Result<MergeReport, AgentError> {
        let samples = self
            .source
            .fetch_intraday_series(SeriesResolution::OneMinute)
            .await?;
        self.merge_samples(samples).await
    }

    /// Fast trigger: refresh the snapshot, then fill a stale series with it.
    pub async fn poll_fast(&self) -> Result<Option<HeartRatePoint>, AgentError> {
        match self
            .source
            .fetch_intraday_series(SeriesResolution::OneSecond)
            .await
        {
            Ok(samples) => {
                if let Some(latest) = samples.iter().max_by_key(|s| s.time) {
                    *self.fast_snapshot.lock().await = Some(FastSnapshot {
                        at: latest.time,
                        bpm: latest.value,
                    });
                }
            }
            Err(e) => tracing::debug!(error = %e, "Fast heart-rate poll failed"),
        }

        let now = self.clock.now();
        let refresh = self.config.refresh_interval_minutes;
        let horizon = stale_horizon(refresh);
        let snapshot = *self.fast_snapshot.lock().await;
        let recent_bpm = snapshot.filter(|s| now - s.at <= horizon).map(|s| s.bpm);

        self.buffer.fallback_check(now, refresh, recent_bpm).await
    }

    /// Manual recalculation from the last raw payload.
    pub async fn recalculate(&self) -> Result<RecalcOutcome, AgentError> {
        if self.recalculating.swap(true, Ordering::SeqCst) {
            tracing::info!("Recalculation already running");
            return Ok(RecalcOutcome::AlreadyRunning);
        }
        let _guard = RecalcGuard(&self.recalculating);

        let payload: Option<SleepPayload> =
            store::load_json(self.store.as_ref(), store::SLOT_LAST_RAW_PAYLOAD).await?;
        let Some(payload) = payload else {
            return Ok(RecalcOutcome::NoPayload);
        };

        let blocks = filter_blocks(&payload.sleep, &self.config.sleep, self.config.timezone);
        let Some(main) = longest_main(&blocks) else {
            return Ok(RecalcOutcome::NoMainSleep);
        };

        {
            let mut pending = self.pending.lock().await;
            pending.begin(main.clone());
            pending.save(self.store.as_ref()).await?;
        }

        tracing::info!(start = %main.start_time, "Manual recalculation");
        Ok(RecalcOutcome::Checked(self.check_pending().await?))
    }

    /// Drive the three triggers until `shutdown` flips.
    ///
    /// Each tick runs in its own task so a paused refresh does not hold up
    /// the heart-rate pollers. A trigger whose previous run is still going
    /// skips the tick.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        self.restore().await?;

        let minutes = |m: u64| Duration::from_secs(m.max(1).saturating_mul(60));
        let mut refresh = tokio::time::interval(minutes(self.config.refresh_interval_minutes));
        let mut intraday = tokio::time::interval(minutes(self.config.intraday_interval_minutes));
        let mut fast = tokio::time::interval(self.config.fast_poll_interval.max(Duration::from_secs(1)));
        for timer in [&mut refresh, &mut intraday, &mut fast] {
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        let mut refresh_task: Option<JoinHandle<()>> = None;
        let mut intraday_task: Option<JoinHandle<()>> = None;
        let mut fast_task: Option<JoinHandle<()>> = None;
        let idle = |task: &Option<JoinHandle<()>>| task.as_ref().map_or(true, |t| t.is_finished());

        tracing::info!(
            refresh_minutes = self.config.refresh_interval_minutes,
            intraday_minutes = self.config.intraday_interval_minutes,
            fast_secs = self.config.fast_poll_interval.as_secs(),
            "Sleep agent running"
        );

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    if idle(&refresh_task) {
                        let agent = self.clone();
                        refresh_task = Some(tokio::spawn(async move {
                            if let Err(e) = agent.refresh_cycle().await {
                                tracing::error!(error = %e, "Refresh cycle failed");
                            }
                        }));
                    }
                }
                _ = intraday.tick() => {
                    if idle(&intraday_task) {
                        let agent = self.clone();
                        intraday_task = Some(tokio::spawn(async move {
                            if let Err(e) = agent.poll_intraday().await {
                                tracing::warn!(error = %e, "Intraday poll failed");
                            }
                        }));
                    }
                }
                _ = fast.tick() => {
                    if idle(&fast_task) {
                        let agent = self.clone();
                        fast_task = Some(tokio::spawn(async move {
                            if let Err(e) = agent.poll_fast().await {
                                tracing::warn!(error = %e, "Fast poll failed");
                            }
                        }));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Stopping triggers, waiting for in-flight work");
        for task in [refresh_task, intraday_task, fast_task].into_iter().flatten() {
            let _ = task.await;
        }
        Ok(())
    }
}

/// The longest main-sleep block, if any.
fn longest_main(blocks: &[SleepBlock]) -> Option<&SleepBlock> {
    blocks
        .iter()
        .filter(|b| b.is_main_sleep)
        .max_by_key(|b| b.duration())
}
