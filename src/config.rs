//! Configuration for the Synheart Sleep Agent.

use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the sleep agent.
///
/// The agent takes one snapshot of this at startup and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path for the persisted slots and the payload inbox
    pub data_path: PathBuf,

    /// User timezone, used for every local clock-time rule
    #[serde(with = "tz_serde")]
    pub timezone: Tz,

    /// Main refresh interval (full record pipeline)
    pub refresh_interval_minutes: u64,

    /// Intraday heart-rate poll interval
    pub intraday_interval_minutes: u64,

    /// Fast heart-rate poll interval
    #[serde(with = "duration_serde")]
    pub fast_poll_interval: Duration,

    /// Hold main sleep back until heart-rate data corroborates it
    pub live_corroboration: bool,

    pub sleep: SleepConfig,

    pub heuristics: HeuristicConfig,

    pub buffer: BufferConfig,

    pub history: HistoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("synheart-sleep-agent");

        Self {
            data_path: data_dir,
            timezone: Tz::UTC,
            refresh_interval_minutes: 5,
            intraday_interval_minutes: 5,
            fast_poll_interval: Duration::from_secs(60),
            live_corroboration: true,
            sleep: SleepConfig::default(),
            heuristics: HeuristicConfig::default(),
            buffer: BufferConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path, falling back to defaults
    /// when the file does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("synheart-sleep-agent")
            .join("config.json")
    }

    /// Directory an external fetcher drops vendor payloads into.
    pub fn inbox_path(&self) -> PathBuf {
        self.data_path.join("inbox")
    }

    /// Directory holding the persisted slots.
    pub fn state_path(&self) -> PathBuf {
        self.data_path.join("state")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(self.inbox_path())?;
        std::fs::create_dir_all(self.state_path())?;
        Ok(())
    }
}

/// Which validated nap feeds the nightly record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NapPreference {
    #[default]
    First,
    Last,
}

/// Sleep filtering and boundary options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepConfig {
    /// Drop main sleep that starts before the cutoff, and restrict the
    /// boundary search to segments after it
    pub cutoff_enabled: bool,

    /// Local clock time of the cutoff (HH:MM)
    #[serde(with = "time_of_day_serde")]
    pub cutoff_time: NaiveTime,

    /// Keep early main sleep anyway when it is long enough
    pub smart_early_sleep: bool,

    pub min_main_sleep_hours: f64,

    /// Continuous asleep time that counts as a stable run
    pub stability_minutes: i64,

    pub nap_validation_enabled: bool,

    pub nap_preference: NapPreference,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            cutoff_enabled: false,
            cutoff_time: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or_default(),
            smart_early_sleep: true,
            min_main_sleep_hours: 3.0,
            stability_minutes: 20,
            nap_validation_enabled: true,
            nap_preference: NapPreference::First,
        }
    }
}

/// Heuristic thresholds. Defaults are the values the pipeline was tuned with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    /// Mean nap bpm above this means the "nap" was activity
    pub nap_activity_bpm: f64,
    pub nap_min_minutes: i64,
    /// Working-set size below which the heart-rate prefilter is skipped
    pub prefilter_min_points: usize,
    pub prefilter_pre_points: usize,
    pub prefilter_post_points: usize,
    /// Minimum pre/post mean drop for the prefilter to trust heart rate
    pub prefilter_min_drop_bpm: f64,
    /// Candidates later than this after block start fall back to block start
    pub safety_cap_minutes: i64,
    pub second_stable_gap_minutes: i64,
    /// How far into the search window a deep/REM anchor may start
    pub preferred_window_hours: i64,
    pub wake_stability_cap_minutes: i64,
    /// A run cannot start on a segment shorter than this
    pub onset_anchor_min_minutes: i64,
    pub corroboration_min_points: usize,
    pub corroboration_before_hours: i64,
    pub corroboration_after_hours: i64,
    pub failsafe_hours: i64,
    /// Width of the before/after heart-rate comparison windows
    pub hr_compare_window_minutes: i64,
    #[serde(with = "duration_serde")]
    pub rate_limit_max_pause: Duration,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            nap_activity_bpm: 65.0,
            nap_min_minutes: 15,
            prefilter_min_points: 6,
            prefilter_pre_points: 15,
            prefilter_post_points: 20,
            prefilter_min_drop_bpm: 2.0,
            safety_cap_minutes: 180,
            second_stable_gap_minutes: 60,
            preferred_window_hours: 3,
            wake_stability_cap_minutes: 15,
            onset_anchor_min_minutes: 10,
            corroboration_min_points: 5,
            corroboration_before_hours: 6,
            corroboration_after_hours: 2,
            failsafe_hours: 24,
            hr_compare_window_minutes: 60,
            rate_limit_max_pause: Duration::from_secs(300),
        }
    }
}

/// Heart-rate buffer windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub persisted_hours: i64,
    pub working_hours: i64,
    pub working_max_points: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            persisted_hours: 72,
            working_hours: 48,
            working_max_points: 5_000,
        }
    }
}

/// Rolling history bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_entries: usize,
    pub baseline_sample: usize,
    pub baseline_min_entries: usize,
    pub trend_min_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 90,
            baseline_sample: 10,
            baseline_min_entries: 5,
            trend_min_entries: 3,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde support for `HH:MM` clock times.
pub(crate) mod time_of_day_serde {
    use chrono::NaiveTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map_err(|_| D::Error::custom(format!("invalid time of day '{s}', expected HH:MM")))
    }
}

/// Serde support for IANA timezone names.
mod tz_serde {
    use chrono_tz::Tz;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(tz.name())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Tz, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<Tz>()
            .map_err(|_| D::Error::custom(format!("unknown timezone '{s}'")))
    }
}
