//! Streaming service: wires storage, feed, aggregator, replay and stats

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use fx_core::StreamSettings;
use fx_rate_stream::feeds::open_feed;
use fx_rate_stream::publisher::PublisherStats;
use fx_rate_stream::state::ActiveRateStats;
use fx_rate_stream::storage::open_store;
use fx_rate_stream::{
    ActiveRateTable, AggregatorStats, BaselineResolver, ChannelFeed, QuoteAggregator, QuoteFeed,
    QuoteStore, ReplayConfig, ReplayFeeder, ReplayOutcome, ReplayReport, RetryPolicy,
    SymbolFilter, UpdatePublisher,
};

/// Point-in-time view of every component
#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub aggregator: AggregatorStats,
    pub publisher: PublisherStats,
    pub table: ActiveRateStats,
    pub baselines: usize,
    pub replay: Option<ReplayReport>,
}

/// Owns the pipeline components and their background tasks
pub struct StreamService {
    settings: StreamSettings,
    store: Arc<dyn QuoteStore>,
    feed: Arc<ChannelFeed>,
    table: Arc<ActiveRateTable>,
    baselines: Arc<BaselineResolver>,
    aggregator: Arc<QuoteAggregator>,
    publisher: Arc<UpdatePublisher>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    replay_report: Arc<Mutex<Option<ReplayReport>>>,
}

impl StreamService {
    /// Build the service from settings, opening storage and feed adapters
    pub fn new(settings: StreamSettings) -> anyhow::Result<Self> {
        settings.validate()?;

        let store = open_store(&settings.storage_endpoint)
            .with_context(|| format!("opening storage {}", settings.storage_endpoint))?;
        let feed = open_feed(&settings.feed_endpoint, settings.feed_capacity)
            .with_context(|| format!("opening feed {}", settings.feed_endpoint))?;

        Ok(Self::with_components(settings, store, feed))
    }

    /// Build the service around existing adapters
    pub fn with_components(
        settings: StreamSettings,
        store: Arc<dyn QuoteStore>,
        feed: Arc<ChannelFeed>,
    ) -> Self {
        let table = Arc::new(ActiveRateTable::new());
        let baselines = Arc::new(BaselineResolver::new(Arc::clone(&store)));
        let aggregator = Arc::new(QuoteAggregator::new(
            Arc::clone(&table),
            Arc::clone(&baselines),
        ));
        let publisher = Arc::new(UpdatePublisher::new(settings.subscriber_buffer));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            settings,
            store,
            feed,
            table,
            baselines,
            aggregator,
            publisher,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            replay_report: Arc::new(Mutex::new(None)),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn publisher(&self) -> Arc<UpdatePublisher> {
        Arc::clone(&self.publisher)
    }

    pub fn table(&self) -> Arc<ActiveRateTable> {
        Arc::clone(&self.table)
    }

    pub fn baselines(&self) -> Arc<BaselineResolver> {
        Arc::clone(&self.baselines)
    }

    /// Producers may publish live quotes here alongside the replay
    pub fn feed(&self) -> Arc<ChannelFeed> {
        Arc::clone(&self.feed)
    }

    /// Receiver that flips to `true` once `stop` is called
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Load the baseline snapshot for the configured window, with retries
    pub async fn load_baseline(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let window = self.settings.baseline_window(now)?;
        let retry = RetryPolicy::from(&self.settings.storage_retry);

        let count = self
            .baselines
            .load(window, &retry)
            .await
            .with_context(|| format!("loading baseline for {}", window))?;
        if count == 0 {
            warn!(%window, "No baseline quotes in window; changes will be unavailable");
        }
        Ok(count)
    }

    /// Load the baseline and start all background services
    pub async fn start(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let baselines = self.load_baseline(now).await?;
        info!(symbols = baselines, "Baseline loaded");

        let subscription = self
            .feed
            .subscribe()
            .context("subscribing to feed")?;
        let range = self.settings.replay_range(now)?;

        let mut tasks = self.tasks.lock();

        // Aggregator
        {
            let aggregator = Arc::clone(&self.aggregator);
            let publisher = Arc::clone(&self.publisher);
            let shutdown = self.shutdown_signal();
            tasks.push(tokio::spawn(async move {
                aggregator.run(subscription, publisher, shutdown).await;
            }));
        }
        info!("Quote aggregator started");

        // Replay
        {
            let config = ReplayConfig {
                pace: self.settings.replay_pace(),
                chunk_ms: self.settings.replay_chunk_ms,
                filter: SymbolFilter::All,
                retry: RetryPolicy::from(&self.settings.storage_retry),
            };
            let feed: Arc<dyn QuoteFeed> = self.feed.clone();
            let feeder = ReplayFeeder::new(Arc::clone(&self.store), feed, config);
            let slot = Arc::clone(&self.replay_report);
            let shutdown = self.shutdown_signal();

            tasks.push(tokio::spawn(async move {
                let report = feeder.replay_reported(range, shutdown).await;
                match &report.outcome {
                    ReplayOutcome::Completed => info!(emitted = report.emitted, "Replay finished"),
                    ReplayOutcome::Cancelled => info!(emitted = report.emitted, "Replay cancelled"),
                    ReplayOutcome::Failed(reason) => {
                        error!(emitted = report.emitted, %reason, "Replay failed")
                    }
                }
                *slot.lock() = Some(report);
            }));
        }
        info!(start = range.start_ms, end = range.end_ms, "Replay started");

        // Stats reporter
        {
            let aggregator = Arc::clone(&self.aggregator);
            let publisher = Arc::clone(&self.publisher);
            let table = Arc::clone(&self.table);
            let ttl_ms = self.settings.active_rate_ttl_ms;
            let interval = self.settings.stats_interval();
            let mut shutdown = self.shutdown_signal();

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = ticker.tick() => {
                            let agg = aggregator.stats();
                            let rates = table.stats(ttl_ms);
                            let fanout = publisher.stats();
                            info!(
                                processed = agg.processed,
                                accepted = agg.accepted,
                                out_of_order = agg.out_of_order,
                                invalid = agg.invalid,
                                baseline_missing = agg.baseline_missing,
                                symbols = rates.symbol_count,
                                active = rates.active_count,
                                stale = rates.stale_count,
                                subscribers = fanout.subscribers,
                                delivered = fanout.delivered,
                                dropped = fanout.dropped,
                                "Pipeline stats"
                            );
                        }
                    }
                }
            }));
        }

        Ok(())
    }

    /// Latest replay result, once the replay task has ended
    pub fn replay_report(&self) -> Option<ReplayReport> {
        self.replay_report.lock().clone()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            aggregator: self.aggregator.stats(),
            publisher: self.publisher.stats(),
            table: self.table.stats(self.settings.active_rate_ttl_ms),
            baselines: self.baselines.len(),
            replay: self.replay_report(),
        }
    }

    /// Signal shutdown and wait for background tasks
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task failed");
            }
        }

        info!("All services stopped");
    }
}
