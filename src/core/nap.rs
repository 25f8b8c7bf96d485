//! Nap acceptance.
//!
//! A nap is rejected when it is too short to count, or when the heart rate
//! during it looks like activity rather than rest. Missing heart-rate data is
//! not evidence against the nap.

use crate::config::{HeuristicConfig, NapPreference};
use crate::core::heart_rate::{mean_bpm, points_between};
use crate::core::types::{HeartRatePoint, SleepBlock, ValidatedNap};
use chrono::Duration;

/// Judge each nap against the working-set heart rate.
pub fn validate_naps(
    naps: &[SleepBlock],
    working_set: &[HeartRatePoint],
    heuristics: &HeuristicConfig,
) -> Vec<ValidatedNap> {
    naps.iter()
        .map(|nap| validate_nap(nap, working_set, heuristics))
        .collect()
}

fn validate_nap(
    nap: &SleepBlock,
    working_set: &[HeartRatePoint],
    heuristics: &HeuristicConfig,
) -> ValidatedNap {
    let minutes = nap.duration().num_minutes();
    if nap.duration() < Duration::minutes(heuristics.nap_min_minutes) {
        tracing::debug!(start = %nap.start_time, minutes, "Nap too short");
        return ValidatedNap {
            block: nap.clone(),
            is_valid: false,
            mean_bpm: None,
        };
    }

    let mean = mean_bpm(points_between(working_set, nap.start_time, nap.end_time));
    let is_valid = match mean {
        Some(bpm) if bpm > heuristics.nap_activity_bpm => {
            tracing::debug!(start = %nap.start_time, bpm, "Nap heart rate looks like activity");
            false
        }
        _ => true,
    };

    ValidatedNap {
        block: nap.clone(),
        is_valid,
        mean_bpm: mean,
    }
}

/// Accept every nap without looking at heart rate.
pub fn accept_all(naps: &[SleepBlock]) -> Vec<ValidatedNap> {
    naps.iter()
        .map(|nap| ValidatedNap {
            block: nap.clone(),
            is_valid: true,
            mean_bpm: None,
        })
        .collect()
}

/// The valid nap to report, by start order.
pub fn select_nap(naps: &[ValidatedNap], preference: NapPreference) -> Option<&ValidatedNap> {
    let mut valid: Vec<&ValidatedNap> = naps.iter().filter(|n| n.is_valid).collect();
    valid.sort_by_key(|n| n.block.start_time);
    match preference {
        NapPreference::First => valid.first().copied(),
        NapPreference::Last => valid.last().copied(),
    }
}
