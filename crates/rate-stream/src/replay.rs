//! Paced replay of stored quotes onto the feed
//!
//! Storage is read lazily in event-time chunks; a chunk query that keeps
//! failing after retries halts the replay. Nothing already published is
//! taken back.

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use fx_core::{FeedError, Quote, ReplayRange, RetrySettings, StorageError, StorageResult};

use crate::feeds::QuoteFeed;
use crate::storage::{QuoteStore, SymbolFilter};

/// Exponential backoff for storage calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier.max(1.0),
        }
    }
}

impl RetryPolicy {
    /// No retries, for tests and one-shot tools
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // overflow and non-finite products saturate at the cap
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Query storage, retrying failures with backoff
    pub async fn query(
        &self,
        store: &dyn QuoteStore,
        filter: &SymbolFilter,
        start_ms: i64,
        end_ms: i64,
    ) -> StorageResult<Vec<Quote>> {
        let mut attempt = 1;
        loop {
            match store.query_range(filter, start_ms, end_ms).await {
                Ok(quotes) => return Ok(quotes),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        store = store.name(),
                        error = %e,
                        "Storage query failed, retrying in {:?} (attempt {}/{})",
                        delay,
                        attempt,
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Replay tuning
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Delay between published quotes
    pub pace: Duration,
    /// Event-time span fetched from storage per query
    pub chunk_ms: u64,
    pub filter: SymbolFilter,
    pub retry: RetryPolicy,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            pace: Duration::from_millis(100),
            chunk_ms: 60_000,
            filter: SymbolFilter::All,
            retry: RetryPolicy::default(),
        }
    }
}

/// How a replay ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Summary of one replay run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub emitted: u64,
    pub outcome: ReplayOutcome,
}

/// Errors that halt a replay
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("storage failed after {emitted} quotes: {source}")]
    Storage {
        emitted: u64,
        #[source]
        source: StorageError,
    },

    #[error("feed failed after {emitted} quotes: {source}")]
    Feed {
        emitted: u64,
        #[source]
        source: FeedError,
    },
}

/// Reads stored quotes and republishes them at a steady pace
pub struct ReplayFeeder {
    store: Arc<dyn QuoteStore>,
    feed: Arc<dyn QuoteFeed>,
    config: ReplayConfig,
}

impl ReplayFeeder {
    pub fn new(store: Arc<dyn QuoteStore>, feed: Arc<dyn QuoteFeed>, config: ReplayConfig) -> Self {
        Self { store, feed, config }
    }

    /// Lazy, ordered quote sequence for `range`.
    ///
    /// Each call starts from the beginning of the range. The stream ends after
    /// the first storage error it yields.
    pub fn quotes(&self, range: ReplayRange) -> BoxStream<'static, StorageResult<Quote>> {
        let store = Arc::clone(&self.store);
        let filter = self.config.filter.clone();
        let retry = self.config.retry.clone();
        let chunk = i64::try_from(self.config.chunk_ms.max(1)).unwrap_or(i64::MAX);

        let chunks = stream::try_unfold(Some(range.start_ms), move |cursor| {
            fetch_chunk(
                Arc::clone(&store),
                filter.clone(),
                retry.clone(),
                cursor,
                chunk,
                range.end_ms,
            )
        });

        chunks
            .map(|chunk: StorageResult<Vec<Quote>>| match chunk {
                Ok(quotes) => stream::iter(quotes.into_iter().map(Ok)).left_stream(),
                Err(e) => stream::once(future::ready(Err::<Quote, _>(e))).right_stream(),
            })
            .flatten()
            .boxed()
    }

    /// Publish every quote in `range` onto the feed, pacing between items.
    ///
    /// Stops early when `shutdown` flips to true. Storage or feed failures
    /// halt the replay and are returned with the count already published.
    pub async fn replay(
        &self,
        range: ReplayRange,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ReplayReport, ReplayError> {
        info!(
            store = self.store.name(),
            topic = self.feed.topic(),
            start = range.start_ms,
            end = range.end_ms,
            "Starting replay"
        );

        let mut quotes = self.quotes(range);
        let mut emitted: u64 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(cancelled(emitted));
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(cancelled(emitted));
                    }
                    continue;
                }
                next = quotes.next() => next,
            };

            let quote = match next {
                None => break,
                Some(Ok(quote)) => quote,
                Some(Err(source)) => {
                    error!(emitted, error = %source, "Replay halted: storage unavailable");
                    return Err(ReplayError::Storage { emitted, source });
                }
            };

            let published = tokio::select! {
                biased;
                published = self.feed.publish(&quote) => published,
                _ = shutdown.changed() => return Ok(cancelled(emitted)),
            };
            if let Err(source) = published {
                error!(emitted, error = %source, "Replay halted: feed rejected quote");
                return Err(ReplayError::Feed { emitted, source });
            }
            emitted += 1;

            if !self.config.pace.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.pace) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!(emitted, "Replay completed");
        Ok(ReplayReport {
            emitted,
            outcome: ReplayOutcome::Completed,
        })
    }

    /// Run `replay` and fold errors into the report
    pub async fn replay_reported(&self, range: ReplayRange, shutdown: watch::Receiver<bool>) -> ReplayReport {
        match self.replay(range, shutdown).await {
            Ok(report) => report,
            Err(ReplayError::Storage { emitted, source }) => ReplayReport {
                emitted,
                outcome: ReplayOutcome::Failed(source.to_string()),
            },
            Err(ReplayError::Feed { emitted, source }) => ReplayReport {
                emitted,
                outcome: ReplayOutcome::Failed(source.to_string()),
            },
        }
    }
}

async fn fetch_chunk(
    store: Arc<dyn QuoteStore>,
    filter: SymbolFilter,
    retry: RetryPolicy,
    cursor: Option<i64>,
    chunk_ms: i64,
    end_ms: i64,
) -> StorageResult<Option<(Vec<Quote>, Option<i64>)>> {
    let Some(start) = cursor else {
        return Ok(None);
    };
    let end = start.saturating_add(chunk_ms - 1).min(end_ms);
    let mut quotes = retry.query(store.as_ref(), &filter, start, end).await?;
    quotes.sort_by_key(Quote::sort_key);

    let next = (end < end_ms).then(|| end + 1);
    Ok(Some((quotes, next)))
}

fn cancelled(emitted: u64) -> ReplayReport {
    info!(emitted, "Replay cancelled");
    ReplayReport {
        emitted,
        outcome: ReplayOutcome::Cancelled,
    }
}
