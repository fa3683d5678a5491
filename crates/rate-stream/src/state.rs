//! Active rate state management
//!
//! Uses DashMap so writers to different symbols only contend on a shard,
//! while writes to the same symbol are serialized by the entry lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use fx_core::{ActiveRateEntry, AggregationError};

/// Latest accepted rate per currency pair
#[derive(Debug)]
pub struct ActiveRateTable {
    entries: DashMap<String, ActiveRateEntry>,

    /// Highest event time accepted across all symbols
    watermark: AtomicI64,

    /// Stats
    update_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl ActiveRateTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            watermark: AtomicI64::new(i64::MIN),
            update_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    /// Get the entry for a symbol
    pub fn get(&self, symbol: &str) -> Option<ActiveRateEntry> {
        self.entries.get(symbol).map(|r| r.value().clone())
    }

    /// Insert or overwrite the entry for `symbol`.
    ///
    /// Fails without touching the table when `time` is older than the stored
    /// `last_update_time`. Equal timestamps overwrite.
    pub fn upsert(
        &self,
        symbol: &str,
        rate: Decimal,
        time: i64,
        event_id: u64,
    ) -> Result<(), AggregationError> {
        match self.entries.entry(symbol.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                if time < current.last_update_time {
                    self.rejected_count.fetch_add(1, Ordering::Relaxed);
                    return Err(AggregationError::OutOfOrder {
                        symbol: symbol.to_string(),
                        event_time: time,
                        last_update_time: current.last_update_time,
                    });
                }
                current.rate = rate;
                current.last_update_time = time;
                current.event_id = event_id;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ActiveRateEntry {
                    symbol: symbol.to_string(),
                    rate,
                    last_update_time: time,
                    event_id,
                });
            }
        }

        self.watermark.fetch_max(time, Ordering::Relaxed);
        self.update_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Highest accepted event time, if anything was accepted
    pub fn watermark(&self) -> Option<i64> {
        match self.watermark.load(Ordering::Relaxed) {
            i64::MIN => None,
            ms => Some(ms),
        }
    }

    /// All entries, sorted by symbol
    pub fn snapshot(&self) -> Vec<ActiveRateEntry> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        entries
    }

    /// Entries updated within `ttl_ms` of the watermark, sorted by symbol.
    ///
    /// Staleness is measured in event time so replays see the same view
    /// regardless of wall-clock pacing. Stale entries stay in the table as
    /// ordering watermarks.
    pub fn active(&self, ttl_ms: u64) -> Vec<ActiveRateEntry> {
        let Some(now) = self.watermark() else {
            return vec![];
        };
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_stale(ttl_ms, now))
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries and counters
    pub fn clear(&self) {
        self.entries.clear();
        self.watermark.store(i64::MIN, Ordering::Relaxed);
        self.update_count.store(0, Ordering::Relaxed);
        self.rejected_count.store(0, Ordering::Relaxed);
    }

    /// Stats
    pub fn stats(&self, ttl_ms: u64) -> ActiveRateStats {
        let symbol_count = self.entries.len();
        let active_count = self.active(ttl_ms).len();
        ActiveRateStats {
            symbol_count,
            active_count,
            stale_count: symbol_count.saturating_sub(active_count),
            update_count: self.update_count.load(Ordering::Relaxed),
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
            watermark: self.watermark(),
        }
    }
}

impl Default for ActiveRateTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the active rate table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRateStats {
    pub symbol_count: usize,
    pub active_count: usize,
    pub stale_count: usize,
    pub update_count: u64,
    pub rejected_count: u64,
    pub watermark: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_upsert_overwrites_newer() {
        let table = ActiveRateTable::new();
        table.upsert("EURUSD", dec!(1.08), 1_000, 1).unwrap();
        table.upsert("EURUSD", dec!(1.09), 2_000, 2).unwrap();

        let entry = table.get("EURUSD").unwrap();
        assert_eq!(entry.rate, dec!(1.09));
        assert_eq!(entry.last_update_time, 2_000);
        assert_eq!(entry.event_id, 2);
    }

    #[test]
    fn test_older_quote_rejected_and_table_unchanged() {
        let table = ActiveRateTable::new();
        table.upsert("EURUSD", dec!(1.08), 2_000, 1).unwrap();

        let err = table.upsert("EURUSD", dec!(1.50), 1_999, 2).unwrap_err();
        assert_eq!(
            err,
            AggregationError::OutOfOrder {
                symbol: "EURUSD".to_string(),
                event_time: 1_999,
                last_update_time: 2_000,
            }
        );

        let entry = table.get("EURUSD").unwrap();
        assert_eq!(entry.rate, dec!(1.08));
        assert_eq!(entry.event_id, 1);
        assert_eq!(table.stats(u64::MAX).rejected_count, 1);
    }

    #[test]
    fn test_equal_timestamp_accepted() {
        let table = ActiveRateTable::new();
        table.upsert("GBPUSD", dec!(1.26), 5_000, 1).unwrap();
        table.upsert("GBPUSD", dec!(1.27), 5_000, 2).unwrap();
        assert_eq!(table.get("GBPUSD").unwrap().rate, dec!(1.27));
    }

    #[test]
    fn test_active_view_hides_stale_symbols() {
        let table = ActiveRateTable::new();
        table.upsert("EURGBP", dec!(0.83), 0, 1).unwrap();
        table.upsert("EURUSD", dec!(1.08), 50_000, 2).unwrap();
        table.upsert("AUDUSD", dec!(0.64), 70_000, 3).unwrap();

        let active: Vec<_> = table.active(30_000).into_iter().map(|e| e.symbol).collect();
        assert_eq!(active, vec!["AUDUSD", "EURUSD"]);

        let stats = table.stats(30_000);
        assert_eq!(stats.symbol_count, 3);
        assert_eq!(stats.active_count, 2);
        assert_eq!(stats.stale_count, 1);
        assert_eq!(stats.watermark, Some(70_000));

        // A stale entry still guards ordering
        assert!(table.upsert("EURGBP", dec!(0.82), -1, 4).is_err());
    }

    #[test]
    fn test_clear_resets_everything() {
        let table = ActiveRateTable::new();
        table.upsert("EURUSD", dec!(1.08), 1, 1).unwrap();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.watermark(), None);
        assert!(table.active(30_000).is_empty());
        assert_eq!(table.stats(30_000).update_count, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let symbols = ["EURUSD", "NZDUSD", "AUDUSD", "GBPUSD"];
        let table = Arc::new(ActiveRateTable::new());
        let handles: Vec<_> = symbols
            .iter()
            .copied()
            .enumerate()
            .map(|(i, symbol)| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for j in 0..100i64 {
                        let rate = Decimal::new(10_000 + i as i64 * 100 + j, 4);
                        table.upsert(symbol, rate, j, j as u64).unwrap();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(table.stats(u64::MAX).update_count, 400);
        for (i, symbol) in symbols.iter().enumerate() {
            let entry = table.get(symbol).unwrap();
            assert_eq!(entry.rate, Decimal::new(10_000 + i as i64 * 100 + 99, 4));
            assert_eq!(entry.last_update_time, 99);
        }
    }
}
