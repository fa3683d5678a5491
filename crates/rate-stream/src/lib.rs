//! Streaming FX rate aggregation engine
//!
//! Features:
//! - Concurrent per-symbol active rate table
//! - Baseline snapshot resolution over a configurable window
//! - Percentage change events with out-of-order rejection
//! - Non-blocking fan-out to subscribers
//! - Paced, restartable replay from storage

pub mod aggregator;
pub mod baseline;
pub mod feeds;
pub mod publisher;
pub mod replay;
pub mod state;
pub mod storage;

pub use aggregator::{AggregatorStats, QuoteAggregator};
pub use baseline::BaselineResolver;
pub use feeds::{ChannelFeed, FeedSubscription, QuoteFeed};
pub use publisher::{Subscription, UpdatePublisher};
pub use replay::{ReplayConfig, ReplayFeeder, ReplayOutcome, ReplayReport, RetryPolicy};
pub use state::ActiveRateTable;
pub use storage::{MemoryQuoteStore, QuoteStore, SymbolFilter};
