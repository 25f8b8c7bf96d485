//! Corrected sleep boundaries.
//!
//! The device's block start is often the moment the user lay down, not the
//! moment they fell asleep. The fell-asleep instant is picked by running an
//! ordered list of candidate strategies; the first one that produces a
//! candidate wins, and the result is then clamped to the block:
//!
//! | order | strategy             | tag               |
//! |-------|----------------------|-------------------|
//! | 1     | no segments          | `fitbit`          |
//! | 2     | heart-rate prefilter | `corrected`       |
//! | 3     | second stable run    | `second-stable`   |
//! | 4     | deep/REM anchored    | `first-stable`    |
//! | 5     | first stable run     | `first-stable`    |
//! | 6     | ignore the cutoff    | `fallback-stable` |
//! | 7     | block start          | `fitbit`          |
//!
//! A candidate before the block start is clamped to it (`fitbit-clamped`);
//! one more than the safety cap after it falls back to block start (`fitbit`).

use crate::config::{Config, HeuristicConfig, SleepConfig};
use crate::core::filter::is_evening;
use crate::core::heart_rate::mean_bpm;
use crate::core::types::{HeartRatePoint, SleepBlock};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Which strategy produced a fell-asleep instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SleepSource {
    Fitbit,
    FitbitClamped,
    Corrected,
    SecondStable,
    FirstStable,
    FallbackStable,
}

impl SleepSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SleepSource::Fitbit => "fitbit",
            SleepSource::FitbitClamped => "fitbit-clamped",
            SleepSource::Corrected => "corrected",
            SleepSource::SecondStable => "second-stable",
            SleepSource::FirstStable => "first-stable",
            SleepSource::FallbackStable => "fallback-stable",
        }
    }

    /// Whether heart rate confirmed the instant.
    pub fn is_heart_rate_derived(&self) -> bool {
        matches!(self, SleepSource::Corrected)
    }
}

impl std::fmt::Display for SleepSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed fell-asleep instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub at: DateTime<Utc>,
    pub source: SleepSource,
}

impl Candidate {
    fn new(at: DateTime<Utc>, source: SleepSource) -> Self {
        Self { at, source }
    }
}

/// Per-call resolver options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Halve the stability threshold (used by the failsafe path)
    pub relaxed: bool,
}

/// Everything a strategy may look at.
pub(crate) struct SearchContext<'a> {
    block: &'a SleepBlock,
    series: &'a [HeartRatePoint],
    heuristics: &'a HeuristicConfig,
    /// Configured stability
    stability: Duration,
    /// Stability after applying `relaxed`
    threshold: Duration,
    /// First segment index at or after the cutoff; 0 when no cutoff applies
    search_from: usize,
}

impl SearchContext<'_> {
    fn anchor_min(&self, threshold: Duration) -> Duration {
        Duration::minutes(self.heuristics.onset_anchor_min_minutes).min(threshold)
    }

    fn runs_from(&self, from: usize, threshold: Duration) -> Vec<DateTime<Utc>> {
        stable_runs(self.block, from, threshold, self.anchor_min(threshold))
    }
}

type Strategy = fn(&SearchContext<'_>) -> Option<Candidate>;

/// Strategies in priority order.
const STRATEGIES: &[(&str, Strategy)] = &[
    ("no-segments", no_segments),
    ("heart-rate-prefilter", heart_rate_prefilter),
    ("second-stable", second_stable),
    ("preferred-stable", preferred_stable),
    ("first-stable", first_stable),
    ("fallback-stable", fallback_stable),
    ("block-start", block_start),
];

fn no_segments(ctx: &SearchContext<'_>) -> Option<Candidate> {
    ctx.block
        .segments
        .is_empty()
        .then(|| Candidate::new(ctx.block.start_time, SleepSource::Fitbit))
}

/// Trust heart rate when it visibly drops around the first asleep segment.
fn heart_rate_prefilter(ctx: &SearchContext<'_>) -> Option<Candidate> {
    let h = ctx.heuristics;
    if ctx.series.len() < h.prefilter_min_points {
        return None;
    }

    let first = ctx.block.first_asleep_index()?;
    let onset = ctx.block.segments[first].start_time;

    let split = ctx.series.partition_point(|p| p.timestamp < onset);
    let before = &ctx.series[..split];
    let pre = &before[before.len().saturating_sub(h.prefilter_pre_points)..];
    let after = &ctx.series[split..];
    let post = &after[..after.len().min(h.prefilter_post_points)];

    let drop = mean_bpm(pre)? - mean_bpm(post)?;
    if drop < h.prefilter_min_drop_bpm {
        tracing::debug!(drop, "Heart-rate drop too small to correct onset");
        return None;
    }

    let at = *ctx.runs_from(first, ctx.stability).first()?;
    if at - ctx.block.start_time > Duration::minutes(h.safety_cap_minutes) {
        return Some(Candidate::new(ctx.block.start_time, SleepSource::Fitbit));
    }
    Some(Candidate::new(at, SleepSource::Corrected))
}

/// A short first run followed closely by a second one: the first was a doze.
fn second_stable(ctx: &SearchContext<'_>) -> Option<Candidate> {
    let runs = ctx.runs_from(ctx.search_from, ctx.threshold);
    let (first, second) = (runs.first()?, runs.get(1)?);
    let max_gap = Duration::minutes(ctx.heuristics.second_stable_gap_minutes);
    accepts_gap(*second - *first, max_gap).then(|| Candidate::new(*second, SleepSource::SecondStable))
}

fn accepts_gap(gap: Duration, max_gap: Duration) -> bool {
    gap > Duration::zero() && gap <= max_gap
}

/// First stable run reached from a deep/REM segment early in the window.
///
/// Reported as `first-stable`; only the log names this strategy.
fn preferred_stable(ctx: &SearchContext<'_>) -> Option<Candidate> {
    let segments = &ctx.block.segments;
    let window_start = segments.get(ctx.search_from)?.start_time;
    let window_end = window_start + Duration::hours(ctx.heuristics.preferred_window_hours);

    let anchor = (ctx.search_from..segments.len())
        .take_while(|&i| segments[i].start_time < window_end)
        .find(|&i| segments[i].level.is_deep_or_rem())?;

    let at = *ctx.runs_from(anchor, ctx.threshold).first()?;
    Some(Candidate::new(at, SleepSource::FirstStable))
}

fn first_stable(ctx: &SearchContext<'_>) -> Option<Candidate> {
    let at = *ctx.runs_from(ctx.search_from, ctx.threshold).first()?;
    Some(Candidate::new(at, SleepSource::FirstStable))
}

/// Retry from the first segment when the cutoff left nothing usable.
fn fallback_stable(ctx: &SearchContext<'_>) -> Option<Candidate> {
    if ctx.search_from == 0 {
        return None;
    }
    let at = *ctx.runs_from(0, ctx.threshold).first()?;
    Some(Candidate::new(at, SleepSource::FallbackStable))
}

fn block_start(ctx: &SearchContext<'_>) -> Option<Candidate> {
    Some(Candidate::new(ctx.block.start_time, SleepSource::Fitbit))
}

/// Start instants of every stable run at or after segment `from`.
///
/// Each maximal run of contiguous asleep-family segments contributes at most
/// one entry: the start of its first segment that is at least `anchor_min`
/// long and from which the rest of the run still reaches `threshold`.
pub(crate) fn stable_runs(
    block: &SleepBlock,
    from: usize,
    threshold: Duration,
    anchor_min: Duration,
) -> Vec<DateTime<Utc>> {
    let segments = &block.segments;
    let asleep = |i: usize| segments[i].level.is_asleep_family();
    let tolerance = Duration::minutes(1);

    let mut starts = Vec::new();
    let mut i = from;
    while i < segments.len() {
        if !asleep(i) {
            i += 1;
            continue;
        }

        let mut j = i + 1;
        while j < segments.len()
            && asleep(j)
            && segments[j].start_time <= block.segment_end(j - 1) + tolerance
        {
            j += 1;
        }

        let mut remaining = (i..j)
            .map(|k| block.segment_duration(k))
            .fold(Duration::zero(), |acc, d| acc + d);
        for k in i..j {
            let length = block.segment_duration(k);
            if length >= anchor_min && remaining >= threshold {
                starts.push(segments[k].start_time);
                break;
            }
            remaining = remaining - length;
        }

        i = j;
    }
    starts
}

/// The cutoff instant that applies to `block`, if any.
///
/// The clock time is anchored to the block's local start date. A morning
/// cutoff (before noon) for a block that starts in the evening refers to the
/// following day. The cutoff only applies when it falls inside the block.
pub(crate) fn cutoff_instant(
    block: &SleepBlock,
    cutoff: NaiveTime,
    tz: Tz,
) -> Option<DateTime<Utc>> {
    let local_start = block.start_time.with_timezone(&tz);
    let mut date = local_start.date_naive();
    if !is_evening(cutoff) && is_evening(local_start.time()) {
        date = date.succ_opt()?;
    }
    let instant = tz
        .from_local_datetime(&date.and_time(cutoff))
        .earliest()?
        .with_timezone(&Utc);

    (instant > block.start_time && instant < block.end_time).then_some(instant)
}

/// How the end of sleep looked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeAssessment {
    /// End of the last asleep-family segment
    pub at: DateTime<Utc>,
    /// Non-asleep time between `at` and the block end
    pub trailing_wake: Duration,
    /// Whether `trailing_wake` reached the wake-stability threshold
    pub sustained: bool,
}

/// Computes corrected boundaries for one sleep block.
#[derive(Debug, Clone, Copy)]
pub struct SleepBoundaryResolver<'a> {
    sleep: &'a SleepConfig,
    heuristics: &'a HeuristicConfig,
    tz: Tz,
}

impl<'a> SleepBoundaryResolver<'a> {
    pub fn new(sleep: &'a SleepConfig, heuristics: &'a HeuristicConfig, tz: Tz) -> Self {
        Self {
            sleep,
            heuristics,
            tz,
        }
    }

    pub fn from_config(config: &'a Config) -> Self {
        Self::new(&config.sleep, &config.heuristics, config.timezone)
    }

    pub fn heuristics(&self) -> &'a HeuristicConfig {
        self.heuristics
    }

    fn context<'c>(
        &'c self,
        block: &'c SleepBlock,
        series: &'c [HeartRatePoint],
        options: ResolveOptions,
    ) -> SearchContext<'c> {
        let stability = Duration::minutes(self.sleep.stability_minutes);
        let threshold = if options.relaxed {
            stability / 2
        } else {
            stability
        };

        let search_from = if self.sleep.cutoff_enabled {
            cutoff_instant(block, self.sleep.cutoff_time, self.tz)
                .and_then(|cutoff| block.segments.iter().position(|s| s.start_time >= cutoff))
                .unwrap_or(0)
        } else {
            0
        };

        SearchContext {
            block,
            series,
            heuristics: self.heuristics,
            stability,
            threshold,
            search_from,
        }
    }

    /// Corrected fell-asleep instant and the strategy that produced it.
    pub fn fell_asleep_at(
        &self,
        block: &SleepBlock,
        series: &[HeartRatePoint],
        options: ResolveOptions,
    ) -> Candidate {
        let ctx = self.context(block, series, options);

        let (strategy, raw) = STRATEGIES
            .iter()
            .find_map(|(name, strategy)| strategy(&ctx).map(|c| (*name, c)))
            .unwrap_or(("block-start", Candidate::new(block.start_time, SleepSource::Fitbit)));

        let resolved = self.clamp(block, raw);
        tracing::debug!(
            strategy,
            relaxed = options.relaxed,
            raw = %raw.at,
            fell_asleep = %resolved.at,
            source = %resolved.source,
            "Resolved fell-asleep instant"
        );
        resolved
    }

    fn clamp(&self, block: &SleepBlock, candidate: Candidate) -> Candidate {
        if candidate.at < block.start_time {
            return Candidate::new(block.start_time, SleepSource::FitbitClamped);
        }
        if candidate.at - block.start_time > Duration::minutes(self.heuristics.safety_cap_minutes) {
            return Candidate::new(block.start_time, SleepSource::Fitbit);
        }
        candidate
    }

    /// Where sleep ended and how long the trailing wake lasted.
    pub fn assess_wake(&self, block: &SleepBlock) -> WakeAssessment {
        let Some(last) = block.last_asleep_index() else {
            return WakeAssessment {
                at: block.end_time,
                trailing_wake: Duration::zero(),
                sustained: false,
            };
        };

        let end = block.segment_end(last);
        let trailing_wake = if last + 1 < block.segments.len() {
            (last + 1..block.segments.len())
                .take_while(|&i| !block.segments[i].level.is_asleep_family())
                .map(|i| block.segment_duration(i))
                .fold(Duration::zero(), |acc, d| acc + d)
        } else {
            (block.end_time - end).max(Duration::zero())
        };

        let threshold = Duration::minutes(
            self.sleep
                .stability_minutes
                .min(self.heuristics.wake_stability_cap_minutes),
        );

        WakeAssessment {
            at: end,
            trailing_wake,
            sustained: trailing_wake >= threshold,
        }
    }

    /// Corrected woke-up instant.
    ///
    /// Short and sustained trailing wakes both end sleep at the last asleep
    /// segment; the classification is only logged.
    pub fn woke_up_at(&self, block: &SleepBlock) -> DateTime<Utc> {
        let assessment = self.assess_wake(block);
        if assessment.sustained {
            tracing::debug!(
                woke_up = %assessment.at,
                trailing_minutes = assessment.trailing_wake.num_minutes(),
                "Sustained wake after last sleep segment"
            );
        } else {
            tracing::debug!(
                woke_up = %assessment.at,
                trailing_minutes = assessment.trailing_wake.num_minutes(),
                "Short wake after last sleep segment"
            );
        }
        assessment.at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::fixtures::{at, block, seg};
    use crate::core::types::SleepLevel::{Asleep, Deep, Light, Rem, Wake};
    use pretty_assertions::assert_eq;

    fn sleep_config() -> SleepConfig {
        SleepConfig {
            stability_minutes: 20,
            ..SleepConfig::default()
        }
    }

    fn with_cutoff(hour: u32, minute: u32) -> SleepConfig {
        SleepConfig {
            cutoff_enabled: true,
            cutoff_time: NaiveTime::from_hms_opt(hour, minute, 0).unwrap(),
            ..sleep_config()
        }
    }

    fn resolve(config: &SleepConfig, b: &SleepBlock, series: &[HeartRatePoint]) -> Candidate {
        let heuristics = HeuristicConfig::default();
        SleepBoundaryResolver::new(config, &heuristics, Tz::UTC).fell_asleep_at(
            b,
            series,
            ResolveOptions::default(),
        )
    }

    fn series(start: DateTime<Utc>, minutes: i64, bpm: f64) -> Vec<HeartRatePoint> {
        (0..minutes)
            .map(|i| HeartRatePoint::measured(start + Duration::minutes(i), bpm))
            .collect()
    }

    #[test]
    fn test_no_segments_uses_block_start() {
        let b = block(at(2024, 1, 1, 23, 0), at(2024, 1, 2, 7, 0), Vec::new());
        let c = resolve(&sleep_config(), &b, &[]);
        assert_eq!(c, Candidate::new(b.start_time, SleepSource::Fitbit));
    }

    #[test]
    fn test_structural_fallback_skips_short_lead_in() {
        let start = at(2024, 1, 1, 23, 10);
        let b = block(
            start,
            at(2024, 1, 2, 2, 35),
            vec![seg(start, Asleep, 5), seg(at(2024, 1, 1, 23, 15), Light, 200)],
        );

        let c = resolve(&sleep_config(), &b, &[]);
        assert_eq!(c.at, at(2024, 1, 1, 23, 15));
        assert_eq!(c.source, SleepSource::FirstStable);
    }

    #[test]
    fn test_cutoff_restricts_search() {
        let b = block(
            at(2024, 1, 1, 22, 40),
            at(2024, 1, 2, 6, 0),
            vec![
                seg(at(2024, 1, 1, 22, 45), Light, 40),
                seg(at(2024, 1, 1, 23, 5), Deep, 30),
            ],
        );

        let c = resolve(&with_cutoff(23, 0), &b, &[]);
        assert_eq!(c.at, at(2024, 1, 1, 23, 5));
        assert_eq!(c.source, SleepSource::FirstStable);

        // without the cutoff the earlier light run is the first stable run
        let config = sleep_config();
        let heuristics = HeuristicConfig::default();
        let resolver = SleepBoundaryResolver::new(&config, &heuristics, Tz::UTC);
        let ctx = resolver.context(&b, &[], ResolveOptions::default());
        assert_eq!(first_stable(&ctx).map(|c| c.at), Some(at(2024, 1, 1, 22, 45)));
    }

    #[test]
    fn test_cutoff_instant_rolls_for_morning_cutoffs() {
        let b = block(at(2024, 1, 1, 22, 40), at(2024, 1, 2, 6, 0), Vec::new());
        let morning = NaiveTime::from_hms_opt(0, 30, 0).unwrap();
        assert_eq!(cutoff_instant(&b, morning, Tz::UTC), Some(at(2024, 1, 2, 0, 30)));

        let evening = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
        assert_eq!(cutoff_instant(&b, evening, Tz::UTC), None);
    }

    #[test]
    fn test_second_stable_overrides_preferred() {
        let b = block(
            at(2024, 1, 1, 23, 0),
            at(2024, 1, 2, 7, 0),
            vec![
                seg(at(2024, 1, 1, 23, 0), Light, 5),
                seg(at(2024, 1, 1, 23, 5), Deep, 25),
                seg(at(2024, 1, 1, 23, 30), Wake, 10),
                seg(at(2024, 1, 1, 23, 40), Light, 200),
            ],
        );

        let c = resolve(&sleep_config(), &b, &[]);
        assert_eq!(c.at, at(2024, 1, 1, 23, 40));
        assert_eq!(c.source, SleepSource::SecondStable);

        let heuristics = HeuristicConfig::default();
        let config = sleep_config();
        let resolver = SleepBoundaryResolver::new(&config, &heuristics, Tz::UTC);
        let ctx = resolver.context(&b, &[], ResolveOptions::default());
        assert_eq!(
            preferred_stable(&ctx).map(|c| c.at),
            Some(at(2024, 1, 1, 23, 5))
        );
    }

    #[test]
    fn test_preferred_beats_first_stable() {
        let b = block(
            at(2024, 1, 1, 23, 0),
            at(2024, 1, 2, 7, 0),
            vec![
                seg(at(2024, 1, 1, 23, 0), Light, 30),
                seg(at(2024, 1, 1, 23, 30), Wake, 90),
                seg(at(2024, 1, 2, 1, 0), Deep, 40),
            ],
        );

        let c = resolve(&sleep_config(), &b, &[]);
        assert_eq!(c.at, at(2024, 1, 2, 1, 0));
        assert_eq!(c.source, SleepSource::FirstStable);

        // the plain first-stable strategy would have picked the earlier run
        let config = sleep_config();
        let heuristics = HeuristicConfig::default();
        let resolver = SleepBoundaryResolver::new(&config, &heuristics, Tz::UTC);
        let ctx = resolver.context(&b, &[], ResolveOptions::default());
        assert_eq!(first_stable(&ctx).map(|c| c.at), Some(at(2024, 1, 1, 23, 0)));
    }

    #[test]
    fn test_second_stable_gap_bounds() {
        let night = |wake_minutes: i64| {
            let second = at(2024, 1, 1, 23, 25) + Duration::minutes(wake_minutes);
            block(
                at(2024, 1, 1, 23, 0),
                at(2024, 1, 2, 7, 0),
                vec![
                    seg(at(2024, 1, 1, 23, 0), Light, 25),
                    seg(at(2024, 1, 1, 23, 25), Wake, wake_minutes),
                    seg(second, Light, 200),
                ],
            )
        };

        // runs 60 minutes apart: the second one wins
        let c = resolve(&sleep_config(), &night(35), &[]);
        assert_eq!(c, Candidate::new(at(2024, 1, 2, 0, 0), SleepSource::SecondStable));

        // 61 minutes apart: too far, the first run stands
        let c = resolve(&sleep_config(), &night(36), &[]);
        assert_eq!(c, Candidate::new(at(2024, 1, 1, 23, 0), SleepSource::FirstStable));

        let max_gap = Duration::minutes(60);
        assert!(accepts_gap(Duration::minutes(60), max_gap));
        assert!(!accepts_gap(Duration::minutes(61), max_gap));
        assert!(!accepts_gap(Duration::zero(), max_gap));
    }

    #[test]
    fn test_fallback_stable_ignores_cutoff() {
        let b = block(
            at(2024, 1, 1, 22, 0),
            at(2024, 1, 2, 7, 0),
            vec![
                seg(at(2024, 1, 1, 22, 5), Light, 120),
                seg(at(2024, 1, 2, 0, 5), Wake, 5),
                seg(at(2024, 1, 2, 0, 10), Asleep, 5),
                seg(at(2024, 1, 2, 0, 15), Wake, 405),
            ],
        );

        let c = resolve(&with_cutoff(23, 0), &b, &[]);
        assert_eq!(c.at, at(2024, 1, 1, 22, 5));
        assert_eq!(c.source, SleepSource::FallbackStable);
    }

    #[test]
    fn test_nothing_stable_falls_back_to_block_start() {
        let b = block(
            at(2024, 1, 1, 23, 0),
            at(2024, 1, 2, 1, 0),
            vec![
                seg(at(2024, 1, 1, 23, 0), Light, 10),
                seg(at(2024, 1, 1, 23, 10), Wake, 110),
            ],
        );
        let c = resolve(&sleep_config(), &b, &[]);
        assert_eq!(c, Candidate::new(b.start_time, SleepSource::Fitbit));
    }

    #[test]
    fn test_relaxed_halves_threshold() {
        let b = block(
            at(2024, 1, 1, 23, 0),
            at(2024, 1, 2, 7, 0),
            vec![
                seg(at(2024, 1, 1, 23, 0), Light, 12),
                seg(at(2024, 1, 1, 23, 12), Wake, 70),
                seg(at(2024, 1, 2, 0, 22), Light, 200),
            ],
        );
        let config = sleep_config();
        let heuristics = HeuristicConfig::default();
        let resolver = SleepBoundaryResolver::new(&config, &heuristics, Tz::UTC);

        let strict = resolver.fell_asleep_at(&b, &[], ResolveOptions { relaxed: false });
        assert_eq!(strict.at, at(2024, 1, 2, 0, 22));

        let relaxed = resolver.fell_asleep_at(&b, &[], ResolveOptions { relaxed: true });
        assert_eq!(relaxed.at, at(2024, 1, 1, 23, 0));
        assert_eq!(relaxed.source, SleepSource::FirstStable);
    }

    #[test]
    fn test_heart_rate_prefilter_marks_corrected() {
        let start = at(2024, 1, 1, 23, 0);
        let b = block(
            start,
            at(2024, 1, 2, 7, 0),
            vec![
                seg(start, Wake, 20),
                seg(at(2024, 1, 1, 23, 20), Light, 300),
            ],
        );
        let mut hr = series(at(2024, 1, 1, 22, 20), 60, 70.0);
        hr.extend(series(at(2024, 1, 1, 23, 20), 60, 55.0));

        let c = resolve(&sleep_config(), &b, &hr);
        assert_eq!(c.at, at(2024, 1, 1, 23, 20));
        assert_eq!(c.source, SleepSource::Corrected);

        // a flat heart rate gives no evidence, structural search takes over
        let flat = series(at(2024, 1, 1, 22, 20), 120, 60.0);
        let c = resolve(&sleep_config(), &b, &flat);
        assert_eq!(c.source, SleepSource::FirstStable);
    }

    #[test]
    fn test_heart_rate_prefilter_respects_safety_cap() {
        let start = at(2024, 1, 1, 22, 0);
        let b = block(
            start,
            at(2024, 1, 2, 7, 0),
            vec![
                seg(start, Wake, 200),
                seg(at(2024, 1, 2, 1, 20), Light, 300),
            ],
        );
        let mut hr = series(at(2024, 1, 1, 21, 20), 240, 70.0);
        hr.extend(series(at(2024, 1, 2, 1, 20), 60, 55.0));

        let config = sleep_config();
        let heuristics = HeuristicConfig::default();
        let resolver = SleepBoundaryResolver::new(&config, &heuristics, Tz::UTC);
        let ctx = resolver.context(&b, &hr, ResolveOptions::default());
        // the drop is clear but the onset is 200 minutes in
        assert_eq!(
            heart_rate_prefilter(&ctx),
            Some(Candidate::new(start, SleepSource::Fitbit))
        );

        let c = resolver.fell_asleep_at(&b, &hr, ResolveOptions::default());
        assert_eq!(c, Candidate::new(start, SleepSource::Fitbit));
    }

    #[test]
    fn test_safety_cap_returns_block_start() {
        let start = at(2024, 1, 1, 22, 0);
        let b = block(
            start,
            at(2024, 1, 2, 7, 0),
            vec![
                seg(start, Wake, 200),
                seg(at(2024, 1, 2, 1, 20), Light, 120),
            ],
        );

        let c = resolve(&sleep_config(), &b, &[]);
        assert_eq!(c, Candidate::new(start, SleepSource::Fitbit));
        assert!(!c.source.is_heart_rate_derived());
    }

    #[test]
    fn test_never_earlier_than_block_start() {
        let start = at(2024, 1, 1, 23, 0);
        let b = block(
            start,
            at(2024, 1, 2, 7, 0),
            vec![seg(at(2024, 1, 1, 22, 50), Light, 60)],
        );

        let c = resolve(&sleep_config(), &b, &[]);
        assert_eq!(c, Candidate::new(start, SleepSource::FitbitClamped));
    }

    #[test]
    fn test_woke_up_at_last_asleep_segment_end() {
        let heuristics = HeuristicConfig::default();
        let config = sleep_config();
        let resolver = SleepBoundaryResolver::new(&config, &heuristics, Tz::UTC);

        let b = block(
            at(2024, 1, 1, 23, 0),
            at(2024, 1, 2, 7, 0),
            vec![
                seg(at(2024, 1, 1, 23, 0), Light, 400),
                seg(at(2024, 1, 2, 5, 40), Wake, 5),
                seg(at(2024, 1, 2, 5, 45), Rem, 30),
                seg(at(2024, 1, 2, 6, 15), Wake, 45),
            ],
        );

        let assessment = resolver.assess_wake(&b);
        assert_eq!(assessment.at, at(2024, 1, 2, 6, 15));
        assert_eq!(assessment.trailing_wake, Duration::minutes(45));
        assert!(assessment.sustained);
        assert_eq!(resolver.woke_up_at(&b), at(2024, 1, 2, 6, 15));

        // a brief trailing wake ends sleep at the same place
        let mut short = b.clone();
        short.segments[3].duration_seconds = Some(5 * 60);
        let assessment = resolver.assess_wake(&short);
        assert!(!assessment.sustained);
        assert_eq!(assessment.at, at(2024, 1, 2, 6, 15));
    }

    #[test]
    fn test_woke_up_without_segments_is_block_end() {
        let heuristics = HeuristicConfig::default();
        let config = sleep_config();
        let resolver = SleepBoundaryResolver::new(&config, &heuristics, Tz::UTC);
        let b = block(at(2024, 1, 1, 23, 0), at(2024, 1, 2, 7, 0), Vec::new());
        assert_eq!(resolver.woke_up_at(&b), b.end_time);
    }

    #[test]
    fn test_source_tags_serialize_kebab_case() {
        assert_eq!(
            serde_json::to_value(SleepSource::FitbitClamped).unwrap(),
            "fitbit-clamped"
        );
        assert_eq!(SleepSource::SecondStable.to_string(), "second-stable");

        let tags: Vec<String> = [
            SleepSource::Fitbit,
            SleepSource::FitbitClamped,
            SleepSource::Corrected,
            SleepSource::SecondStable,
            SleepSource::FirstStable,
            SleepSource::FallbackStable,
        ]
        .iter()
        .map(|tag| serde_json::to_value(tag).unwrap().as_str().unwrap().to_string())
        .collect();
        assert_eq!(
            tags,
            [
                "fitbit",
                "fitbit-clamped",
                "corrected",
                "second-stable",
                "first-stable",
                "fallback-stable"
            ]
        );
    }
}
