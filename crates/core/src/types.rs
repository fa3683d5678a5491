//! Core type definitions

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{CoreError, CoreResult, ValidationError};

/// Layout used for `UpdateEvent::event_time_human_readable`
pub const HUMAN_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Decimal places kept on percentage changes
pub const PERCENT_DP: u32 = 3;

/// A single observed rate for a currency pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub rate: Decimal,
    /// Milliseconds since the Unix epoch
    pub event_time: i64,
    pub event_id: u64,
}

impl Quote {
    pub fn new(symbol: impl Into<String>, rate: Decimal, event_time: i64, event_id: u64) -> Self {
        Self {
            symbol: symbol.into(),
            rate,
            event_time,
            event_id,
        }
    }

    /// Check the ingestion constraints: non-empty symbol, strictly positive rate
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.symbol.trim().is_empty() {
            return Err(ValidationError::EmptySymbol {
                event_id: self.event_id,
            });
        }
        if self.rate <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveRate {
                symbol: self.symbol.clone(),
                rate: self.rate,
            });
        }
        Ok(())
    }

    /// Ordering key used by storage and replay
    pub fn sort_key(&self) -> (i64, u64) {
        (self.event_time, self.event_id)
    }
}

/// Reference quote a percentage change is measured against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub symbol: String,
    pub rate: Decimal,
    pub event_time: i64,
    pub event_id: u64,
}

impl BaselineEntry {
    /// A zero baseline cannot anchor a relative change
    pub fn is_usable(&self) -> bool {
        !self.rate.is_zero()
    }
}

impl From<Quote> for BaselineEntry {
    fn from(quote: Quote) -> Self {
        Self {
            symbol: quote.symbol,
            rate: quote.rate,
            event_time: quote.event_time,
            event_id: quote.event_id,
        }
    }
}

/// Most recent rate observed for a symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRateEntry {
    pub symbol: String,
    pub rate: Decimal,
    pub last_update_time: i64,
    pub event_id: u64,
}

impl ActiveRateEntry {
    /// Event-time age relative to `now_ms`
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.last_update_time).max(0)
    }

    pub fn is_stale(&self, max_age_ms: u64, now_ms: i64) -> bool {
        self.age_ms(now_ms) as u64 > max_age_ms
    }
}

/// Real-time update pushed to subscribers, one per accepted quote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub symbol: String,
    pub current_rate: Decimal,
    pub percentage_change: Option<Decimal>,
    pub event_time_human_readable: String,
    pub baseline_available: bool,
    pub event_time: i64,
    pub event_id: u64,
}

impl UpdateEvent {
    /// Shape an event for `quote`, measured against `baseline` when one is usable
    pub fn from_quote(quote: &Quote, baseline: Option<&BaselineEntry>) -> Self {
        let baseline = baseline.filter(|b| b.is_usable());
        let percentage_change = baseline.and_then(|b| percentage_change(quote.rate, b.rate));

        Self {
            symbol: quote.symbol.clone(),
            current_rate: quote.rate,
            baseline_available: baseline.is_some(),
            percentage_change,
            event_time_human_readable: format_event_time(quote.event_time),
            event_time: quote.event_time,
            event_id: quote.event_id,
        }
    }

    /// Dashboard rendering of the change, e.g. `0.3%` or `N/A`
    pub fn display_change(&self) -> String {
        match self.percentage_change {
            Some(change) => format!("{}%", change),
            None => "N/A".to_string(),
        }
    }
}

/// `round(((rate - baseline) / baseline) * 100, 3)`, half-to-even.
///
/// Returns `None` for a zero baseline or on decimal overflow.
pub fn percentage_change(rate: Decimal, baseline: Decimal) -> Option<Decimal> {
    if baseline.is_zero() {
        return None;
    }
    let ratio = (rate - baseline).checked_div(baseline)?;
    let percent = ratio.checked_mul(Decimal::ONE_HUNDRED)?;
    Some(
        percent
            .round_dp_with_strategy(PERCENT_DP, RoundingStrategy::MidpointNearestEven)
            .normalize(),
    )
}

/// UTC rendering of an epoch-millisecond timestamp
pub fn format_event_time(event_time_ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(event_time_ms) {
        Some(ts) => ts.format(HUMAN_TIME_FORMAT).to_string(),
        None => event_time_ms.to_string(),
    }
}

/// Inclusive event-time window used to select baselines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl BaselineWindow {
    pub fn new(start_ms: i64, end_ms: i64) -> CoreResult<Self> {
        if start_ms > end_ms {
            return Err(CoreError::InvalidWindow { start_ms, end_ms });
        }
        Ok(Self { start_ms, end_ms })
    }

    pub fn contains(&self, event_time: i64) -> bool {
        event_time >= self.start_ms && event_time <= self.end_ms
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

impl fmt::Display for BaselineWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} .. {}]",
            format_event_time(self.start_ms),
            format_event_time(self.end_ms)
        )
    }
}

/// Inclusive event-time range handed to replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl ReplayRange {
    pub fn new(start_ms: i64, end_ms: i64) -> CoreResult<Self> {
        if start_ms > end_ms {
            return Err(CoreError::InvalidWindow { start_ms, end_ms });
        }
        Ok(Self { start_ms, end_ms })
    }

    /// From UTC midnight of `now` up to `now`
    pub fn since_midnight(now: DateTime<Utc>) -> Self {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(0);
        Self {
            start_ms: midnight,
            end_ms: now.timestamp_millis(),
        }
    }
}
