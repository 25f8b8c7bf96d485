//! Deferred finalization of main sleep.
//!
//! ```text
//!            begin(block)
//!   Idle ─────────────────► Pending ──┐ check: < 5 points, age ≤ 24h
//!    ▲                         │  ▲   │ (record untouched)
//!    │                         │  └───┘
//!    │   confirmed (≥ 5 pts)   │
//!    └─────────────────────────┤  relaxed = false
//!    │   failsafe (age > 24h)  │
//!    └─────────────────────────┘  relaxed = true
//! ```
//!
//! At most one record exists at a time; `begin` overwrites a stale one.
//! `check` only decides; the caller records the night and then calls
//! `complete`, so a failed write leaves the record pending. The last
//! completed night is remembered so later refreshes do not reopen it.

use crate::core::boundary::{Candidate, ResolveOptions, SleepBoundaryResolver};
use crate::core::heart_rate::points_between;
use crate::core::types::{HeartRatePoint, PendingMainSleep, SleepBlock};
use crate::error::AgentError;
use crate::store::{self, KeyValueStore, SLOT_LAST_RESOLVED, SLOT_PENDING};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How a main sleep got resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionRoute {
    /// Live corroboration disabled; resolved on arrival
    Immediate,
    /// Enough heart-rate points around the start
    Confirmed,
    /// Waited too long; resolved with relaxed stability
    Failsafe,
}

/// Corrected boundaries for one main-sleep block.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub block: SleepBlock,
    pub fell_asleep: Candidate,
    pub woke_up: DateTime<Utc>,
    pub route: ResolutionRoute,
}

/// Result of a periodic check.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// Nothing pending
    Idle,
    /// Still waiting for corroboration
    Waiting { points: usize, age: Duration },
    /// Pending record resolved and cleared
    Resolved(Resolution),
}

/// Run the resolver on `block` for the given route.
pub fn resolve_block(
    resolver: &SleepBoundaryResolver<'_>,
    block: &SleepBlock,
    working_set: &[HeartRatePoint],
    route: ResolutionRoute,
) -> Resolution {
    let options = ResolveOptions {
        relaxed: route == ResolutionRoute::Failsafe,
    };
    Resolution {
        block: block.clone(),
        fell_asleep: resolver.fell_asleep_at(block, working_set, options),
        woke_up: resolver.woke_up_at(block),
        route,
    }
}

/// Identity of a main-sleep block across payload refetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NightKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<i64>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl NightKey {
    pub fn of(block: &SleepBlock) -> Self {
        Self {
            log_id: block.log_id,
            start: block.start_time,
            end: block.end_time,
        }
    }
}

/// Owner of the single pending main-sleep record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingSleepStateMachine {
    pending: Option<PendingMainSleep>,
    last_resolved: Option<NightKey>,
}

impl PendingSleepStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&PendingMainSleep> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn last_resolved(&self) -> Option<&NightKey> {
        self.last_resolved.as_ref()
    }

    /// Whether `block` is the night most recently completed.
    pub fn is_resolved(&self, block: &SleepBlock) -> bool {
        self.last_resolved.as_ref() == Some(&NightKey::of(block))
    }

    /// Enter `Pending` for `block`, returning any record it replaced.
    pub fn begin(&mut self, block: SleepBlock) -> Option<PendingMainSleep> {
        let record = PendingMainSleep::from_block(block);
        tracing::info!(start = %record.start, end = %record.end, "Main sleep pending corroboration");
        let replaced = self.pending.replace(record);
        if let Some(old) = &replaced {
            tracing::debug!(start = %old.start, "Replaced stale pending record");
        }
        replaced
    }

    /// `begin`, unless `block` was already completed. Returns whether a
    /// record is now pending for it.
    pub fn begin_unless_resolved(&mut self, block: SleepBlock) -> bool {
        if self.is_resolved(&block) {
            tracing::debug!(start = %block.start_time, "Main sleep already recorded");
            return false;
        }
        self.begin(block);
        true
    }

    /// Decide whether the pending record can be resolved now.
    ///
    /// The record stays in place until [`complete`](Self::complete).
    pub fn check(
        &self,
        now: DateTime<Utc>,
        working_set: &[HeartRatePoint],
        resolver: &SleepBoundaryResolver<'_>,
    ) -> CheckOutcome {
        let Some(record) = self.pending.as_ref() else {
            return CheckOutcome::Idle;
        };

        let h = resolver.heuristics();
        let window_start = record.start - Duration::hours(h.corroboration_before_hours);
        let window_end = record.start + Duration::hours(h.corroboration_after_hours);
        let points = points_between(working_set, window_start, window_end).len();
        let age = now - record.start;

        let route = if points >= h.corroboration_min_points {
            ResolutionRoute::Confirmed
        } else if age > Duration::hours(h.failsafe_hours) {
            tracing::warn!(
                start = %record.start,
                points,
                age_hours = age.num_hours(),
                "Pending sleep timed out, resolving with relaxed stability"
            );
            ResolutionRoute::Failsafe
        } else {
            tracing::debug!(
                start = %record.start,
                points,
                age_minutes = age.num_minutes(),
                "Waiting for heart-rate corroboration"
            );
            return CheckOutcome::Waiting { points, age };
        };

        let resolution = resolve_block(resolver, &record.raw_block, working_set, route);

        tracing::info!(
            fell_asleep = %resolution.fell_asleep.at,
            woke_up = %resolution.woke_up,
            source = %resolution.fell_asleep.source,
            route = ?route,
            "Resolved pending main sleep"
        );
        CheckOutcome::Resolved(resolution)
    }

    /// Clear the pending record once `resolution` has been recorded.
    pub fn complete(&mut self, resolution: &Resolution) {
        let key = NightKey::of(&resolution.block);
        if self.pending.as_ref().map(|p| NightKey::of(&p.raw_block)) == Some(key.clone()) {
            self.pending = None;
        }
        self.last_resolved = Some(key);
    }

    /// Restore from the store. A missing or malformed slot is `Idle`.
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self, AgentError> {
        let pending: Option<Option<PendingMainSleep>> = store::load_json(store, SLOT_PENDING).await?;
        let last_resolved: Option<Option<NightKey>> =
            store::load_json(store, SLOT_LAST_RESOLVED).await?;
        Ok(Self {
            pending: pending.flatten(),
            last_resolved: last_resolved.flatten(),
        })
    }

    pub async fn save(&self, store: &dyn KeyValueStore) -> Result<(), AgentError> {
        store::save_json(store, SLOT_PENDING, &self.pending).await?;
        store::save_json(store, SLOT_LAST_RESOLVED, &self.last_resolved).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeuristicConfig, SleepConfig};
    use crate::core::boundary::SleepSource;
    use crate::core::types::fixtures::{at, block, seg};
    use crate::core::types::SleepLevel::{Asleep, Light, Wake};
    use crate::store::MemoryStore;
    use chrono_tz::Tz;

    fn night() -> SleepBlock {
        block(
            at(2024, 1, 1, 23, 0),
            at(2024, 1, 2, 7, 0),
            vec![
                seg(at(2024, 1, 1, 23, 0), Light, 12),
                seg(at(2024, 1, 1, 23, 12), Wake, 70),
                seg(at(2024, 1, 2, 0, 22), Light, 400),
            ],
        )
    }

    fn points(start: DateTime<Utc>, count: i64) -> Vec<HeartRatePoint> {
        (0..count)
            .map(|i| HeartRatePoint::measured(start + Duration::minutes(i), 60.0))
            .collect()
    }

    fn configs() -> (SleepConfig, HeuristicConfig) {
        (SleepConfig::default(), HeuristicConfig::default())
    }

    #[test]
    fn test_idle_check_is_noop() {
        let (sleep, heuristics) = configs();
        let resolver = SleepBoundaryResolver::new(&sleep, &heuristics, Tz::UTC);
        let mut machine = PendingSleepStateMachine::new();
        assert_eq!(
            machine.check(at(2024, 1, 2, 8, 0), &[], &resolver),
            CheckOutcome::Idle
        );
    }

    #[test]
    fn test_waits_without_points() {
        let (sleep, heuristics) = configs();
        let resolver = SleepBoundaryResolver::new(&sleep, &heuristics, Tz::UTC);
        let mut machine = PendingSleepStateMachine::new();
        machine.begin(night());

        // four points are not enough
        let outcome = machine.check(
            at(2024, 1, 2, 8, 0),
            &points(at(2024, 1, 1, 22, 0), 4),
            &resolver,
        );
        assert!(matches!(outcome, CheckOutcome::Waiting { points: 4, .. }));
        assert!(machine.is_pending());
    }

    #[test]
    fn test_confirmed_with_enough_points() {
        let (sleep, heuristics) = configs();
        let resolver = SleepBoundaryResolver::new(&sleep, &heuristics, Tz::UTC);
        let mut machine = PendingSleepStateMachine::new();
        machine.begin(night());

        let outcome = machine.check(
            at(2024, 1, 2, 8, 0),
            &points(at(2024, 1, 1, 22, 0), 5),
            &resolver,
        );
        let CheckOutcome::Resolved(resolution) = outcome else {
            panic!("expected a resolution, got {outcome:?}");
        };
        assert_eq!(resolution.route, ResolutionRoute::Confirmed);
        // strict threshold skips the 12 minute lead-in
        assert_eq!(resolution.fell_asleep.at, at(2024, 1, 2, 0, 22));

        // still pending until the night is recorded
        assert!(machine.is_pending());
        machine.complete(&resolution);
        assert!(!machine.is_pending());
        assert_eq!(machine.last_resolved(), Some(&NightKey::of(&night())));
    }

    #[test]
    fn test_failsafe_after_a_day() {
        let (sleep, heuristics) = configs();
        let resolver = SleepBoundaryResolver::new(&sleep, &heuristics, Tz::UTC);
        let mut machine = PendingSleepStateMachine::new();
        let block = night();
        machine.begin(block.clone());

        let at_24h = block.start_time + Duration::hours(24);
        assert!(matches!(
            machine.check(at_24h, &[], &resolver),
            CheckOutcome::Waiting { .. }
        ));

        let at_25h = block.start_time + Duration::hours(25);
        let CheckOutcome::Resolved(resolution) = machine.check(at_25h, &[], &resolver) else {
            panic!("expected failsafe resolution");
        };
        assert_eq!(resolution.route, ResolutionRoute::Failsafe);
        // relaxed threshold accepts the 12 minute lead-in
        assert_eq!(resolution.fell_asleep.at, at(2024, 1, 1, 23, 0));
        assert_eq!(resolution.fell_asleep.source, SleepSource::FirstStable);

        // cleared exactly once
        machine.complete(&resolution);
        assert!(!machine.is_pending());
        assert_eq!(machine.check(at_25h, &[], &resolver), CheckOutcome::Idle);
    }

    #[test]
    fn test_completed_night_is_not_reopened() {
        let (sleep, heuristics) = configs();
        let resolver = SleepBoundaryResolver::new(&sleep, &heuristics, Tz::UTC);
        let mut machine = PendingSleepStateMachine::new();
        assert!(machine.begin_unless_resolved(night()));

        let at_25h = night().start_time + Duration::hours(25);
        let CheckOutcome::Resolved(resolution) = machine.check(at_25h, &[], &resolver) else {
            panic!("expected failsafe resolution");
        };
        machine.complete(&resolution);

        // later refreshes of the same night are ignored
        assert!(!machine.begin_unless_resolved(night()));
        assert!(!machine.is_pending());
        assert_eq!(machine.check(at_25h, &[], &resolver), CheckOutcome::Idle);

        // a different night still starts a record
        let next = block(
            at(2024, 1, 2, 23, 0),
            at(2024, 1, 3, 7, 0),
            vec![seg(at(2024, 1, 2, 23, 0), Light, 480)],
        );
        assert!(machine.begin_unless_resolved(next));
        assert!(machine.is_pending());

        // an explicit begin reopens a recorded night
        machine.begin(night());
        assert_eq!(machine.current().map(|r| r.start), Some(night().start_time));
    }

    #[test]
    fn test_begin_overwrites_stale_record() {
        let mut machine = PendingSleepStateMachine::new();
        let old = block(at(2024, 1, 1, 1, 0), at(2024, 1, 1, 6, 0), vec![seg(at(2024, 1, 1, 1, 0), Asleep, 300)]);
        machine.begin(old.clone());

        let replaced = machine.begin(night());
        assert_eq!(replaced.map(|r| r.start), Some(old.start_time));
        assert_eq!(machine.current().map(|r| r.start), Some(night().start_time));
    }

    #[tokio::test]
    async fn test_persisted_round_trip() {
        let store = MemoryStore::new();
        let mut machine = PendingSleepStateMachine::new();
        machine.begin(night());
        machine.save(&store).await.unwrap();

        let restored = PendingSleepStateMachine::load(&store).await.unwrap();
        assert_eq!(restored, machine);

        let resolution = resolve_block(
            &SleepBoundaryResolver::new(&SleepConfig::default(), &HeuristicConfig::default(), Tz::UTC),
            &night(),
            &[],
            ResolutionRoute::Failsafe,
        );
        machine.complete(&resolution);
        machine.save(&store).await.unwrap();
        let restored = PendingSleepStateMachine::load(&store).await.unwrap();
        assert!(!restored.is_pending());
        assert!(restored.is_resolved(&night()));

        store.set(SLOT_PENDING, "{oops".to_string()).await.unwrap();
        assert!(!PendingSleepStateMachine::load(&store).await.unwrap().is_pending());
    }
}
