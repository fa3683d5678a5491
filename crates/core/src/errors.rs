//! Error types

use rust_decimal::Decimal;
use thiserror::Error;

/// Core error types
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid window: start {start_ms} is after end {end_ms}")]
    InvalidWindow { start_ms: i64, end_ms: i64 },
}

/// Quote rejected at the ingestion boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Quote {event_id} has an empty symbol")]
    EmptySymbol { event_id: u64 },

    #[error("Quote for {symbol} has non-positive rate {rate}")]
    NonPositiveRate { symbol: String, rate: Decimal },
}

/// Reasons a quote produces no update event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Out-of-order quote for {symbol}: {event_time} < {last_update_time}")]
    OutOfOrder {
        symbol: String,
        event_time: i64,
        last_update_time: i64,
    },
}

/// Storage collaborator errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed record at line {line}: {reason}")]
    Malformed { line: u64, reason: String },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Feed collaborator errors
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Feed closed")]
    Closed,

    #[error("Feed already has a subscriber")]
    AlreadySubscribed,

    #[error("Malformed feed payload: {0}")]
    Malformed(String),

    #[error("Invalid quote on feed: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type FeedResult<T> = Result<T, FeedError>;
pub type AggregationResult<T> = Result<T, AggregationError>;
