//! Where sleep and heart-rate payloads come from.
//!
//! The pipeline consumes already-fetched payloads through [`DataSource`].
//! [`InboxSource`] reads them from files an external fetcher drops into the
//! inbox directory:
//!
//! - `sleep-YYYY-MM-DD.json`: `{"sleep": [SleepBlock, ...]}`
//! - `heart-rate-1min.json` / `heart-rate-1sec.json`: `[{"time", "value"}, ...]`

use crate::core::types::{HeartRatePoint, HeartRateSource, SleepPayload};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Intraday series granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesResolution {
    #[serde(rename = "1sec")]
    OneSecond,
    #[serde(rename = "1min")]
    OneMinute,
}

impl SeriesResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesResolution::OneSecond => "1sec",
            SeriesResolution::OneMinute => "1min",
        }
    }
}

impl std::fmt::Display for SeriesResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One intraday heart-rate sample as delivered by the source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntradaySample {
    pub time: DateTime<Utc>,
    pub value: f64,
}

impl From<IntradaySample> for HeartRatePoint {
    fn from(sample: IntradaySample) -> Self {
        HeartRatePoint::new(sample.time, sample.value, HeartRateSource::Measured)
    }
}

/// Data source failures, classified for the retry policy.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Timeouts, 5xx, missing payloads: retried on the next tick
    #[error("Transient failure: {0}")]
    Transient(String),
    /// Credentials were rejected
    #[error("Unauthorized")]
    Unauthorized,
    /// Back off before the next request
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// Provider of intraday heart rate and daily sleep.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch_intraday_series(
        &self,
        resolution: SeriesResolution,
    ) -> Result<Vec<IntradaySample>, SourceError>;

    async fn fetch_daily_sleep(&self, date: NaiveDate) -> Result<SleepPayload, SourceError>;

    /// Refresh stale credentials after an `Unauthorized` response.
    async fn renew_credentials(&self) -> Result<(), SourceError>;
}

/// Reads payloads from an inbox directory.
#[derive(Debug, Clone)]
pub struct InboxSource {
    dir: PathBuf,
}

impl InboxSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn sleep_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("sleep-{}.json", date.format("%Y-%m-%d")))
    }

    pub fn heart_rate_path(&self, resolution: SeriesResolution) -> PathBuf {
        self.dir.join(format!("heart-rate-{resolution}.json"))
    }

    async fn read(&self, path: PathBuf) -> Result<String, SourceError> {
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SourceError::Transient(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl DataSource for InboxSource {
    async fn fetch_intraday_series(
        &self,
        resolution: SeriesResolution,
    ) -> Result<Vec<IntradaySample>, SourceError> {
        let content = self.read(self.heart_rate_path(resolution)).await?;
        serde_json::from_str(&content).map_err(|e| SourceError::Malformed(e.to_string()))
    }

    async fn fetch_daily_sleep(&self, date: NaiveDate) -> Result<SleepPayload, SourceError> {
        let content = self.read(self.sleep_path(date)).await?;
        serde_json::from_str(&content).map_err(|e| SourceError::Malformed(e.to_string()))
    }

    async fn renew_credentials(&self) -> Result<(), SourceError> {
        // Files carry no credentials.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbox(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("synheart-sleep-inbox-{name}-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_missing_file_is_transient() {
        let source = InboxSource::new(inbox("missing"));
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert!(matches!(
            source.fetch_daily_sleep(date).await,
            Err(SourceError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_sleep_and_heart_rate() {
        let dir = inbox("read");
        std::fs::create_dir_all(&dir).unwrap();
        let source = InboxSource::new(&dir);
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        std::fs::write(
            source.sleep_path(date),
            r#"{"sleep":[{"logId":7,"startTime":"2024-01-01T23:00:00Z","endTime":"2024-01-02T07:00:00Z",
                "isMainSleep":true,"minutesAsleep":440,"timeInBed":480,
                "segments":[{"startTime":"2024-01-01T23:00:00Z","level":"light","durationSeconds":1800}],
                "stageSummary":{"deepMin":60,"lightMin":250,"remMin":100,"wakeMin":30}}]}"#,
        )
        .unwrap();
        std::fs::write(
            source.heart_rate_path(SeriesResolution::OneMinute),
            r#"[{"time":"2024-01-02T06:00:00Z","value":54},{"time":"2024-01-02T06:01:00Z","value":55}]"#,
        )
        .unwrap();

        let payload = source.fetch_daily_sleep(date).await.unwrap();
        assert_eq!(payload.sleep.len(), 1);
        assert_eq!(payload.sleep[0].log_id, Some(7));
        assert_eq!(payload.sleep[0].stage_summary.deep_min, 60);

        let samples = source
            .fetch_intraday_series(SeriesResolution::OneMinute)
            .await
            .unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(HeartRatePoint::from(samples[1]).bpm, 55.0);

        std::fs::write(source.heart_rate_path(SeriesResolution::OneSecond), "nope").unwrap();
        assert!(matches!(
            source.fetch_intraday_series(SeriesResolution::OneSecond).await,
            Err(SourceError::Malformed(_))
        ));

        let _ = std::fs::remove_dir_all(dir);
    }
}
