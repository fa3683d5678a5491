//! Quote aggregator - turns feed quotes into update events

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fx_core::{AggregationError, AggregationResult, Quote, UpdateEvent};

use crate::baseline::BaselineResolver;
use crate::feeds::FeedSubscription;
use crate::publisher::UpdatePublisher;
use crate::state::ActiveRateTable;

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    accepted: AtomicU64,
    out_of_order: AtomicU64,
    invalid: AtomicU64,
    baseline_missing: AtomicU64,
}

/// Main quote aggregator
pub struct QuoteAggregator {
    table: Arc<ActiveRateTable>,
    baselines: Arc<BaselineResolver>,
    counters: Counters,
}

impl QuoteAggregator {
    pub fn new(table: Arc<ActiveRateTable>, baselines: Arc<BaselineResolver>) -> Self {
        Self {
            table,
            baselines,
            counters: Counters::default(),
        }
    }

    /// Get shared table reference
    pub fn table(&self) -> Arc<ActiveRateTable> {
        Arc::clone(&self.table)
    }

    pub fn baselines(&self) -> Arc<BaselineResolver> {
        Arc::clone(&self.baselines)
    }

    /// Apply one quote.
    ///
    /// Invalid and out-of-order quotes leave the table untouched and produce
    /// no event; both are counted. A missing baseline is not an error.
    pub fn process(&self, quote: Quote) -> AggregationResult<UpdateEvent> {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = quote.validate() {
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }

        if let Err(e) = self
            .table
            .upsert(&quote.symbol, quote.rate, quote.event_time, quote.event_id)
        {
            self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let baseline = self.baselines.resolve(&quote.symbol);
        let event = UpdateEvent::from_quote(&quote, baseline.as_ref());

        if !event.baseline_available {
            self.counters.baseline_missing.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        Ok(event)
    }

    /// Consume the feed until shutdown or until the feed closes.
    ///
    /// A quote already taken off the feed is always processed and published
    /// before the shutdown signal is honoured.
    pub async fn run(
        &self,
        mut subscription: FeedSubscription,
        publisher: Arc<UpdatePublisher>,
        mut shutdown: watch::Receiver<bool>,
    ) -> AggregatorStats {
        info!(topic = subscription.topic(), "Starting quote aggregator");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                next = subscription.next() => next,
            };

            match next {
                None => {
                    info!("Feed closed, aggregator stopping");
                    break;
                }
                Some(Err(e)) => {
                    self.counters.invalid.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Rejected feed payload");
                }
                Some(Ok(quote)) => match self.process(quote) {
                    Ok(event) => {
                        debug!(
                            symbol = %event.symbol,
                            rate = %event.current_rate,
                            change = %event.display_change(),
                            "Rate update"
                        );
                        publisher.publish(event);
                    }
                    Err(AggregationError::OutOfOrder {
                        symbol,
                        event_time,
                        last_update_time,
                    }) => {
                        debug!(%symbol, event_time, last_update_time, "Out-of-order quote rejected");
                    }
                    Err(AggregationError::Invalid(e)) => {
                        warn!(error = %e, "Invalid quote rejected");
                    }
                },
            }
        }

        drop(subscription);
        let stats = self.stats();
        info!(
            processed = stats.processed,
            accepted = stats.accepted,
            out_of_order = stats.out_of_order,
            invalid = stats.invalid,
            "Quote aggregator stopped"
        );
        stats
    }

    /// Get statistics
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            out_of_order: self.counters.out_of_order.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            baseline_missing: self.counters.baseline_missing.load(Ordering::Relaxed),
            symbol_count: self.table.len(),
        }
    }
}

/// Aggregator statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct AggregatorStats {
    pub processed: u64,
    pub accepted: u64,
    pub out_of_order: u64,
    pub invalid: u64,
    pub baseline_missing: u64,
    pub symbol_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::{ChannelFeed, QuoteFeed};
    use crate::storage::MemoryQuoteStore;
    use fx_core::BaselineWindow;
    use rust_decimal_macros::dec;

    const T: i64 = 1_734_213_600_000;

    fn aggregator() -> QuoteAggregator {
        let baselines = Arc::new(BaselineResolver::new(Arc::new(MemoryQuoteStore::default())));
        baselines.load_from(
            vec![
                Quote::new("EURUSD", dec!(1.20000000), T + 100, 1),
                Quote::new("GBPUSD", dec!(0), T + 100, 2),
            ],
            BaselineWindow::new(T, T + 3_600_000).unwrap(),
        );
        QuoteAggregator::new(Arc::new(ActiveRateTable::new()), baselines)
    }

    #[test]
    fn test_percentage_change_against_baseline() {
        let agg = aggregator();
        let event = agg
            .process(Quote::new("EURUSD", dec!(1.20360000), T + 86_400_000, 10))
            .unwrap();

        assert_eq!(event.percentage_change, Some(dec!(0.3)));
        assert!(event.baseline_available);
        assert_eq!(event.current_rate, dec!(1.2036));
        assert_eq!(agg.table().get("EURUSD").unwrap().rate, dec!(1.2036));
    }

    #[test]
    fn test_missing_baseline_is_a_valid_result() {
        let agg = aggregator();
        for i in 0..3 {
            let event = agg
                .process(Quote::new("NZDUSD", dec!(0.58), T + i, i as u64))
                .unwrap();
            assert_eq!(event.percentage_change, None);
            assert!(!event.baseline_available);
        }
        assert_eq!(agg.stats().baseline_missing, 3);
    }

    #[test]
    fn test_zero_baseline_treated_as_unavailable() {
        let agg = aggregator();
        let event = agg.process(Quote::new("GBPUSD", dec!(1.26), T, 5)).unwrap();
        assert!(!event.baseline_available);
        assert_eq!(event.percentage_change, None);
    }

    #[test]
    fn test_out_of_order_rejected_and_counted() {
        let agg = aggregator();
        agg.process(Quote::new("EURUSD", dec!(1.21), T + 5_000, 1)).unwrap();

        let err = agg
            .process(Quote::new("EURUSD", dec!(1.30), T + 4_999, 2))
            .unwrap_err();
        assert!(matches!(err, AggregationError::OutOfOrder { .. }));
        assert_eq!(agg.table().get("EURUSD").unwrap().rate, dec!(1.21));

        let stats = agg.stats();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.out_of_order, 1);
    }

    #[test]
    fn test_invalid_quote_leaves_table_alone() {
        let agg = aggregator();
        assert!(matches!(
            agg.process(Quote::new("EURUSD", dec!(-1), T, 1)),
            Err(AggregationError::Invalid(_))
        ));
        assert!(matches!(
            agg.process(Quote::new("", dec!(1.1), T, 2)),
            Err(AggregationError::Invalid(_))
        ));
        assert!(agg.table().is_empty());
        assert_eq!(agg.stats().invalid, 2);
    }

    #[tokio::test]
    async fn test_run_publishes_until_shutdown() {
        let agg = Arc::new(aggregator());
        let feed = ChannelFeed::new("test", 16);
        let subscription = feed.subscribe().unwrap();
        let publisher = Arc::new(UpdatePublisher::new(16));
        let mut updates = publisher.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = {
            let agg = Arc::clone(&agg);
            let publisher = Arc::clone(&publisher);
            tokio::spawn(async move { agg.run(subscription, publisher, shutdown_rx).await })
        };

        feed.publish(&Quote::new("EURUSD", dec!(1.2036), T + 10, 1)).await.unwrap();
        feed.publish_raw("not a quote".to_string()).await.unwrap();
        feed.publish(&Quote::new("EURUSD", dec!(1.1), T + 5, 2)).await.unwrap();
        feed.publish(&Quote::new("EURUSD", dec!(1.2072), T + 20, 3)).await.unwrap();

        assert_eq!(updates.recv().await.unwrap().event_id, 1);
        let second = updates.recv().await.unwrap();
        assert_eq!(second.event_id, 3);
        assert_eq!(second.percentage_change, Some(dec!(0.6)));

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap();

        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.invalid, 1);
    }

    #[tokio::test]
    async fn test_run_stops_immediately_when_already_shut_down() {
        let agg = aggregator();
        let feed = ChannelFeed::new("test", 4);
        let subscription = feed.subscribe().unwrap();
        let (_tx, rx) = watch::channel(true);

        let stats = agg.run(subscription, Arc::new(UpdatePublisher::default()), rx).await;
        assert_eq!(stats.processed, 0);
    }
}
