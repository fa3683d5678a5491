//! Baseline snapshot resolution
//!
//! The snapshot is built off to the side and swapped in whole, so readers
//! always see either the previous or the new snapshot, never a mix.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use fx_core::{BaselineEntry, BaselineWindow, Quote, StorageResult};

use crate::replay::RetryPolicy;
use crate::storage::{QuoteStore, SymbolFilter};

type Snapshot = Arc<HashMap<String, BaselineEntry>>;

/// Read-only baseline lookup, refreshed by `load`
pub struct BaselineResolver {
    store: Arc<dyn QuoteStore>,
    snapshot: RwLock<Snapshot>,
    window: RwLock<Option<BaselineWindow>>,
}

impl BaselineResolver {
    pub fn new(store: Arc<dyn QuoteStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            window: RwLock::new(None),
        }
    }

    /// Query storage for the window and replace the snapshot.
    ///
    /// Transient storage errors are retried per `retry`. Once retries are
    /// exhausted the previous snapshot stays in place.
    pub async fn load(&self, window: BaselineWindow, retry: &RetryPolicy) -> StorageResult<usize> {
        let quotes = retry
            .query(self.store.as_ref(), &SymbolFilter::All, window.start_ms, window.end_ms)
            .await
            .map_err(|e| {
                warn!(%window, error = %e, "Baseline load failed, keeping previous snapshot");
                e
            })?;

        Ok(self.load_from(quotes, window))
    }

    /// Build the snapshot from already fetched quotes
    pub fn load_from(&self, quotes: impl IntoIterator<Item = Quote>, window: BaselineWindow) -> usize {
        let selected = select_baselines(quotes, window);
        let count = selected.len();

        *self.snapshot.write() = Arc::new(selected);
        *self.window.write() = Some(window);

        info!(%window, symbols = count, "Baseline snapshot loaded");
        count
    }

    /// Baseline for a symbol, if one was found in the window
    pub fn resolve(&self, symbol: &str) -> Option<BaselineEntry> {
        self.snapshot.read().get(symbol).cloned()
    }

    /// Shared handle to the current snapshot
    pub fn snapshot(&self) -> Arc<HashMap<String, BaselineEntry>> {
        Arc::clone(&self.snapshot.read())
    }

    /// Window of the loaded snapshot
    pub fn window(&self) -> Option<BaselineWindow> {
        *self.window.read()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.read().is_empty()
    }
}

/// Pick, per symbol, the quote inside `window` closest to its end.
///
/// Ties on event time go to the larger event id so the choice does not
/// depend on input order.
pub fn select_baselines(
    quotes: impl IntoIterator<Item = Quote>,
    window: BaselineWindow,
) -> HashMap<String, BaselineEntry> {
    let mut selected: HashMap<String, BaselineEntry> = HashMap::new();

    for quote in quotes.into_iter().filter(|q| window.contains(q.event_time)) {
        let replace = match selected.get(&quote.symbol) {
            Some(current) => (quote.event_time, quote.event_id) > (current.event_time, current.event_id),
            None => true,
        };
        if replace {
            selected.insert(quote.symbol.clone(), quote.into());
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryQuoteStore;
    use rust_decimal_macros::dec;

    const T: i64 = 1_734_213_600_000;

    fn window() -> BaselineWindow {
        BaselineWindow::new(T, T + 3_600_000).unwrap()
    }

    #[test]
    fn test_selects_quote_closest_to_window_end() {
        let quotes = vec![
            Quote::new("EURUSD", dec!(1.10), T + 100, 1),
            Quote::new("EURUSD", dec!(1.20), T + 2_000, 2),
        ];
        let selected = select_baselines(quotes.clone(), window());
        assert_eq!(selected["EURUSD"].event_time, T + 2_000);
        assert_eq!(selected["EURUSD"].rate, dec!(1.20));

        // Input order does not matter
        let selected = select_baselines(quotes.into_iter().rev(), window());
        assert_eq!(selected["EURUSD"].event_time, T + 2_000);
    }

    #[test]
    fn test_ignores_quotes_outside_window() {
        let quotes = vec![
            Quote::new("EURUSD", dec!(1.10), T - 1, 1),
            Quote::new("EURUSD", dec!(1.20), T + 3_600_001, 2),
            Quote::new("GBPUSD", dec!(1.26), T + 3_600_000, 3),
        ];
        let selected = select_baselines(quotes, window());
        assert!(!selected.contains_key("EURUSD"));
        assert_eq!(selected["GBPUSD"].rate, dec!(1.26));
    }

    #[test]
    fn test_tie_breaks_on_event_id() {
        let quotes = vec![
            Quote::new("AUDUSD", dec!(0.65), T + 10, 9),
            Quote::new("AUDUSD", dec!(0.64), T + 10, 4),
        ];
        let selected = select_baselines(quotes, window());
        assert_eq!(selected["AUDUSD"].event_id, 9);
    }

    #[tokio::test]
    async fn test_load_from_store_and_resolve() {
        let store = Arc::new(MemoryQuoteStore::new(vec![
            Quote::new("EURUSD", dec!(1.2), T + 100, 1),
            Quote::new("NZDUSD", dec!(0.58), T + 500, 2),
            Quote::new("EURUSD", dec!(1.3), T + 2_000, 3),
            Quote::new("EURGBP", dec!(0.83), T + 7_200_000, 4),
        ]));
        let resolver = BaselineResolver::new(store);

        assert!(resolver.resolve("EURUSD").is_none());
        assert_eq!(resolver.load(window(), &RetryPolicy::none()).await.unwrap(), 2);

        assert_eq!(resolver.resolve("EURUSD").unwrap().rate, dec!(1.3));
        assert_eq!(resolver.resolve("NZDUSD").unwrap().event_id, 2);
        assert!(resolver.resolve("EURGBP").is_none());
        assert_eq!(resolver.window(), Some(window()));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_snapshot() {
        let store = Arc::new(MemoryQuoteStore::new(vec![Quote::new(
            "EURUSD",
            dec!(1.2),
            T + 100,
            1,
        )]));
        let resolver = BaselineResolver::new(store.clone());
        resolver.load(window(), &RetryPolicy::none()).await.unwrap();

        store.set_available(false);
        assert!(resolver.load(window(), &RetryPolicy::none()).await.is_err());
        assert_eq!(resolver.resolve("EURUSD").unwrap().rate, dec!(1.2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_retries_until_store_recovers() {
        let store = Arc::new(MemoryQuoteStore::new(vec![Quote::new(
            "EURUSD",
            dec!(1.2),
            T + 100,
            1,
        )]));
        store.set_available(false);

        let recovering = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            recovering.set_available(true);
        });

        let resolver = BaselineResolver::new(store);
        let count = resolver.load(window(), &RetryPolicy::default()).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(resolver.resolve("EURUSD").unwrap().rate, dec!(1.2));
    }

    #[test]
    fn test_concurrent_readers_share_snapshot() {
        let resolver = Arc::new(BaselineResolver::new(Arc::new(MemoryQuoteStore::default())));
        resolver.load_from(vec![Quote::new("EURUSD", dec!(1.2), T, 1)], window());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                std::thread::spawn(move || {
                    (0..1_000).all(|_| resolver.resolve("EURUSD").is_some())
                })
            })
            .collect();

        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
