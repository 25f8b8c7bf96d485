//! Normalization of raw device sleep blocks.
//!
//! Main sleep is screened for early starts and short duration; then repeated
//! packets for the same log are collapsed. Naps pass through untouched, and if
//! nothing survives the main-sleep screening the naps are returned as-is.

use crate::config::SleepConfig;
use crate::core::types::SleepBlock;
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;

/// Local clock times before this belong to the previous evening's night, so
/// a 01:30 start is never "early" relative to a 22:00 cutoff.
pub(crate) const EVENING_START: u32 = 12;

/// Whether a local time lies in the evening part of the day.
pub(crate) fn is_evening(time: NaiveTime) -> bool {
    time.hour() >= EVENING_START
}

/// True when `start` is on the evening side of the day and before the cutoff.
fn starts_before_cutoff(start: DateTime<Utc>, cutoff: NaiveTime, tz: Tz) -> bool {
    let local = start.with_timezone(&tz).time();
    is_evening(local) && local < cutoff
}

/// Filter a day's raw blocks.
pub fn filter_blocks(blocks: &[SleepBlock], config: &SleepConfig, tz: Tz) -> Vec<SleepBlock> {
    let min_main = Duration::seconds((config.min_main_sleep_hours * 3600.0) as i64);

    let mains: Vec<&SleepBlock> = blocks
        .iter()
        .filter(|b| b.is_main_sleep)
        .filter(|b| {
            if !config.cutoff_enabled || !starts_before_cutoff(b.start_time, config.cutoff_time, tz) {
                return true;
            }
            let keep = config.smart_early_sleep && b.duration() >= min_main;
            tracing::debug!(
                start = %b.start_time,
                kept = keep,
                "Main sleep starts before the early-sleep cutoff"
            );
            keep
        })
        .filter(|b| {
            let long_enough = b.duration() >= min_main;
            if !long_enough {
                tracing::debug!(
                    start = %b.start_time,
                    minutes = b.duration().num_minutes(),
                    "Dropping main sleep below minimum duration"
                );
            }
            long_enough
        })
        .collect();

    let naps = blocks.iter().filter(|b| !b.is_main_sleep);

    if mains.is_empty() {
        // Never lose the naps just because the night was filtered away.
        return naps.cloned().collect();
    }

    let survivors: Vec<&SleepBlock> = blocks
        .iter()
        .filter(|b| !b.is_main_sleep || mains.iter().any(|m| std::ptr::eq(*m, *b)))
        .collect();

    collapse_duplicates(&survivors)
}

/// Identity of a sleep log across repeated packets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BlockKey {
    LogId(i64),
    Span(DateTime<Utc>, DateTime<Utc>),
}

fn block_key(block: &SleepBlock) -> BlockKey {
    match block.log_id {
        Some(id) => BlockKey::LogId(id),
        None => BlockKey::Span(block.start_time, block.end_time),
    }
}

/// Keep one block per identity: the one with the most time in bed.
/// Output order follows each identity's first appearance.
fn collapse_duplicates(blocks: &[&SleepBlock]) -> Vec<SleepBlock> {
    let mut order: Vec<BlockKey> = Vec::new();
    let mut best: HashMap<BlockKey, &SleepBlock> = HashMap::new();

    for block in blocks {
        let key = block_key(block);
        match best.get(&key) {
            Some(current) if current.time_in_bed >= block.time_in_bed => {}
            Some(_) => {
                best.insert(key, *block);
            }
            None => {
                order.push(key.clone());
                best.insert(key, *block);
            }
        }
    }

    let collapsed = blocks.len() - order.len();
    if collapsed > 0 {
        tracing::debug!(collapsed, "Collapsed duplicate sleep packets");
    }

    order
        .iter()
        .filter_map(|key| best.get(key).map(|b| (*b).clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::fixtures::{at, block, nap};
    use pretty_assertions::assert_eq;

    fn config() -> SleepConfig {
        SleepConfig {
            cutoff_enabled: true,
            cutoff_time: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            smart_early_sleep: false,
            min_main_sleep_hours: 3.0,
            ..SleepConfig::default()
        }
    }

    #[test]
    fn test_early_block_dropped_unless_smart_and_long() {
        let early = block(at(2024, 1, 1, 20, 30), at(2024, 1, 2, 6, 0), Vec::new());

        assert!(filter_blocks(&[early.clone()], &config(), Tz::UTC).is_empty());

        let smart = SleepConfig {
            smart_early_sleep: true,
            ..config()
        };
        assert_eq!(filter_blocks(&[early], &smart, Tz::UTC).len(), 1);
    }

    #[test]
    fn test_after_midnight_start_is_not_early() {
        let late = block(at(2024, 1, 2, 1, 30), at(2024, 1, 2, 8, 0), Vec::new());
        assert_eq!(filter_blocks(&[late], &config(), Tz::UTC).len(), 1);
    }

    #[test]
    fn test_cutoff_uses_local_time() {
        // 21:30 UTC is 22:30 in Berlin (winter), after the 22:00 cutoff
        let b = block(at(2024, 1, 1, 21, 30), at(2024, 1, 2, 6, 0), Vec::new());
        assert!(filter_blocks(&[b.clone()], &config(), Tz::UTC).is_empty());
        assert_eq!(
            filter_blocks(&[b], &config(), chrono_tz::Europe::Berlin).len(),
            1
        );
    }

    #[test]
    fn test_short_main_sleep_dropped() {
        let short = block(at(2024, 1, 1, 23, 0), at(2024, 1, 2, 1, 0), Vec::new());
        assert!(filter_blocks(&[short], &config(), Tz::UTC).is_empty());
    }

    #[test]
    fn test_naps_survive_when_main_sleep_is_filtered() {
        let short = block(at(2024, 1, 1, 23, 0), at(2024, 1, 2, 0, 30), Vec::new());
        let n = nap(at(2024, 1, 2, 14, 0), 40);

        let result = filter_blocks(&[short, n.clone()], &config(), Tz::UTC);
        assert_eq!(result, vec![n]);
    }

    #[test]
    fn test_duplicate_packets_keep_longest_time_in_bed() {
        let mut first = block(at(2024, 1, 1, 23, 0), at(2024, 1, 2, 7, 0), Vec::new());
        first.log_id = Some(42);
        first.time_in_bed = 400;
        let mut second = first.clone();
        second.time_in_bed = 480;
        let mut third = first.clone();
        third.time_in_bed = 450;

        let result = filter_blocks(&[first, second.clone(), third], &config(), Tz::UTC);
        assert_eq!(result, vec![second]);
    }

    #[test]
    fn test_duplicates_without_log_id_group_by_span() {
        let a = block(at(2024, 1, 1, 23, 0), at(2024, 1, 2, 7, 0), Vec::new());
        let mut b = a.clone();
        b.time_in_bed += 10;
        let other = block(at(2024, 1, 2, 23, 0), at(2024, 1, 3, 7, 0), Vec::new());

        let result = filter_blocks(&[a, b.clone(), other.clone()], &config(), Tz::UTC);
        assert_eq!(result, vec![b, other]);
    }
}
