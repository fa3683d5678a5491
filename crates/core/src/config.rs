//! Configuration types

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{CoreError, CoreResult};
use crate::{BaselineWindow, ReplayRange};

/// How the baseline window is derived when no explicit bounds are set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineSettings {
    /// Local hour of the reference snapshot (17 = 5pm)
    pub reference_hour: u32,
    /// Offset of the reference timezone from UTC, in minutes
    pub utc_offset_minutes: i32,
    /// Width of the selection window starting at the reference time
    pub window_ms: i64,
}

impl Default for BaselineSettings {
    fn default() -> Self {
        Self {
            reference_hour: 17,
            utc_offset_minutes: -5 * 60, // New York, standard time
            window_ms: 3_600_000,
        }
    }
}

impl BaselineSettings {
    /// Window anchored at yesterday's reference hour, relative to `now`
    pub fn previous_day_window(&self, now: DateTime<Utc>) -> CoreResult<BaselineWindow> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            CoreError::InvalidConfig(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            ))
        })?;

        let yesterday = now.with_timezone(&offset).date_naive() - ChronoDuration::days(1);
        let naive = yesterday
            .and_hms_opt(self.reference_hour, 0, 0)
            .ok_or_else(|| {
                CoreError::InvalidConfig(format!("reference_hour out of range: {}", self.reference_hour))
            })?;
        let start = offset
            .from_local_datetime(&naive)
            .single()
            .ok_or_else(|| CoreError::InvalidConfig("ambiguous reference time".to_string()))?
            .timestamp_millis();

        let end = start.checked_add(self.window_ms).ok_or_else(|| {
            CoreError::InvalidConfig(format!("baseline.window_ms too large: {}", self.window_ms))
        })?;
        BaselineWindow::new(start, end)
    }
}

/// Retry behaviour at the storage boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

/// Complete streamer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub storage_endpoint: String,
    pub feed_endpoint: String,
    pub baseline_window_start: Option<i64>,
    pub baseline_window_end: Option<i64>,
    pub baseline: BaselineSettings,
    pub replay_pace_ms: u64,
    pub replay_start: Option<i64>,
    pub replay_end: Option<i64>,
    pub replay_chunk_ms: u64,
    pub active_rate_ttl_ms: u64,
    pub feed_capacity: usize,
    pub subscriber_buffer: usize,
    pub notify_host: String,
    pub notify_port: u16,
    pub stats_interval_secs: u64,
    pub storage_retry: RetrySettings,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            storage_endpoint: "csv://data/batch_processing_rates.csv".to_string(),
            feed_endpoint: "memory://forex_rates_stream".to_string(),
            baseline_window_start: None,
            baseline_window_end: None,
            baseline: BaselineSettings::default(),
            replay_pace_ms: 100,
            replay_start: None,
            replay_end: None,
            replay_chunk_ms: 60_000,
            active_rate_ttl_ms: 30_000,
            feed_capacity: 10_000,
            subscriber_buffer: 1_024,
            notify_host: "127.0.0.1".to_string(),
            notify_port: 5000,
            stats_interval_secs: 60,
            storage_retry: RetrySettings::default(),
        }
    }
}

impl StreamSettings {
    /// Reject settings that cannot produce a working pipeline
    pub fn validate(&self) -> CoreResult<()> {
        if self.storage_endpoint.trim().is_empty() {
            return Err(CoreError::InvalidConfig("storage_endpoint is empty".to_string()));
        }
        if self.feed_endpoint.trim().is_empty() {
            return Err(CoreError::InvalidConfig("feed_endpoint is empty".to_string()));
        }
        if self.feed_capacity == 0 || self.subscriber_buffer == 0 {
            return Err(CoreError::InvalidConfig(
                "feed_capacity and subscriber_buffer must be positive".to_string(),
            ));
        }
        if self.replay_chunk_ms == 0 {
            return Err(CoreError::InvalidConfig("replay_chunk_ms must be positive".to_string()));
        }
        if !self.storage_retry.multiplier.is_finite() {
            return Err(CoreError::InvalidConfig(
                "storage_retry.multiplier must be finite".to_string(),
            ));
        }
        if self.baseline.window_ms < 0 {
            return Err(CoreError::InvalidConfig("baseline.window_ms is negative".to_string()));
        }
        match (self.baseline_window_start, self.baseline_window_end) {
            (Some(_), None) | (None, Some(_)) => Err(CoreError::InvalidConfig(
                "baseline_window_start and baseline_window_end must be set together".to_string(),
            )),
            (Some(start), Some(end)) => BaselineWindow::new(start, end).map(|_| ()),
            (None, None) => Ok(()),
        }
    }

    /// Explicit window if configured, otherwise yesterday's reference hour
    pub fn baseline_window(&self, now: DateTime<Utc>) -> CoreResult<BaselineWindow> {
        match (self.baseline_window_start, self.baseline_window_end) {
            (Some(start), Some(end)) => BaselineWindow::new(start, end),
            _ => self.baseline.previous_day_window(now),
        }
    }

    /// Explicit range if configured, otherwise today so far
    pub fn replay_range(&self, now: DateTime<Utc>) -> CoreResult<ReplayRange> {
        let today = ReplayRange::since_midnight(now);
        ReplayRange::new(
            self.replay_start.unwrap_or(today.start_ms),
            self.replay_end.unwrap_or(today.end_ms),
        )
    }

    pub fn replay_pace(&self) -> Duration {
        Duration::from_millis(self.replay_pace_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn notify_address(&self) -> String {
        format!("{}:{}", self.notify_host, self.notify_port)
    }
}
