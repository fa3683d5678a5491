//! Time-ranged quote storage
//!
//! `query_range` bounds are inclusive on both ends and results come back
//! ordered by event time, then event id.

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use fx_core::{Quote, StorageError, StorageResult};

/// Which symbols a range query returns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SymbolFilter {
    #[default]
    All,
    Only(HashSet<String>),
}

impl SymbolFilter {
    pub fn only<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(symbols.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, symbol: &str) -> bool {
        match self {
            SymbolFilter::All => true,
            SymbolFilter::Only(symbols) => symbols.contains(symbol),
        }
    }
}

/// Read side of the quote history store
#[async_trait::async_trait]
pub trait QuoteStore: Send + Sync {
    async fn query_range(
        &self,
        filter: &SymbolFilter,
        start_ms: i64,
        end_ms: i64,
    ) -> StorageResult<Vec<Quote>>;

    fn name(&self) -> &str;
}

/// In-memory store, sorted on construction
#[derive(Debug, Default)]
pub struct MemoryQuoteStore {
    quotes: RwLock<Vec<Quote>>,
    unavailable: AtomicBool,
}

impl MemoryQuoteStore {
    pub fn new(mut quotes: Vec<Quote>) -> Self {
        quotes.sort_by_key(Quote::sort_key);
        Self {
            quotes: RwLock::new(quotes),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Append quotes, keeping the store ordered
    pub fn extend(&self, quotes: impl IntoIterator<Item = Quote>) {
        let mut stored = self.quotes.write();
        stored.extend(quotes);
        stored.sort_by_key(Quote::sort_key);
    }

    /// Simulate the store going away (or coming back)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.quotes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.read().is_empty()
    }
}

#[async_trait::async_trait]
impl QuoteStore for MemoryQuoteStore {
    async fn query_range(
        &self,
        filter: &SymbolFilter,
        start_ms: i64,
        end_ms: i64,
    ) -> StorageResult<Vec<Quote>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store offline".to_string()));
        }

        let quotes = self.quotes.read();
        let from = quotes.partition_point(|q| q.event_time < start_ms);
        Ok(quotes[from..]
            .iter()
            .take_while(|q| q.event_time <= end_ms)
            .filter(|q| filter.matches(&q.symbol))
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Row layout of the rate export: `event_id,event_time,ccy_couple,rate`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    event_id: u64,
    event_time: i64,
    #[serde(alias = "symbol")]
    ccy_couple: String,
    rate: String,
}

/// CSV-backed store, loaded fully into memory on open
#[derive(Debug)]
pub struct CsvQuoteStore {
    path: PathBuf,
    inner: MemoryQuoteStore,
}

impl CsvQuoteStore {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let quotes = read_csv(&path)?;
        info!(path = %path.display(), rows = quotes.len(), "Loaded quote history");

        Ok(Self {
            path,
            inner: MemoryQuoteStore::new(quotes),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait::async_trait]
impl QuoteStore for CsvQuoteStore {
    async fn query_range(
        &self,
        filter: &SymbolFilter,
        start_ms: i64,
        end_ms: i64,
    ) -> StorageResult<Vec<Quote>> {
        self.inner.query_range(filter, start_ms, end_ms).await
    }

    fn name(&self) -> &str {
        "csv"
    }
}

fn read_csv(path: &Path) -> StorageResult<Vec<Quote>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| csv_error(e, 0))?;

    let mut quotes = Vec::new();
    for (index, row) in reader.deserialize::<CsvRecord>().enumerate() {
        // Header is line 1
        let line = index as u64 + 2;
        let record = row.map_err(|e| csv_error(e, line))?;
        let rate = Decimal::from_str(&record.rate)
            .or_else(|_| Decimal::from_scientific(&record.rate))
            .map_err(|e| StorageError::Malformed {
                line,
                reason: format!("bad rate {:?}: {}", record.rate, e),
            })?;
        quotes.push(Quote::new(record.ccy_couple, rate, record.event_time, record.event_id));
    }

    debug!(path = %path.display(), rows = quotes.len(), "Parsed CSV");
    Ok(quotes)
}

fn csv_error(err: csv::Error, line: u64) -> StorageError {
    if err.is_io_error() {
        match err.into_kind() {
            csv::ErrorKind::Io(io) => StorageError::Io(io),
            other => StorageError::Unavailable(format!("{:?}", other)),
        }
    } else {
        StorageError::Malformed {
            line,
            reason: err.to_string(),
        }
    }
}

/// Open the store named by a `storage_endpoint` setting.
///
/// Accepts `memory://` (empty store), `csv://<path>` or a bare path.
pub fn open_store(endpoint: &str) -> StorageResult<Arc<dyn QuoteStore>> {
    if endpoint.starts_with("memory://") {
        return Ok(Arc::new(MemoryQuoteStore::default()));
    }

    let path = endpoint.strip_prefix("csv://").unwrap_or(endpoint);
    if path.is_empty() {
        return Err(StorageError::Unavailable(format!("no path in endpoint {:?}", endpoint)));
    }
    Ok(Arc::new(CsvQuoteStore::open(path)?))
}
