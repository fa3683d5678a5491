//! Quote feed transport
//!
//! The feed carries encoded payloads rather than `Quote` values so the
//! consumer always goes through the same decode and validation step a
//! networked transport would need.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use fx_core::{decode_quote, encode_quote, FeedError, FeedResult, Quote};

/// Publish/subscribe channel between producers and the aggregator
#[async_trait::async_trait]
pub trait QuoteFeed: Send + Sync {
    /// Publish a quote, waiting for queue capacity if needed
    async fn publish(&self, quote: &Quote) -> FeedResult<()>;

    /// Open the consuming side of the feed
    fn subscribe(&self) -> FeedResult<FeedSubscription>;

    fn topic(&self) -> &str;
}

/// Consuming side of a feed
pub struct FeedSubscription {
    topic: String,
    rx: mpsc::Receiver<String>,
}

impl FeedSubscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::Receiver<String>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    /// Next decoded quote.
    ///
    /// `None` once every publisher is gone. Undecodable or invalid payloads
    /// come back as `Some(Err(_))` and the subscription stays usable.
    /// Cancel-safe: dropping the future never loses a payload.
    pub async fn next(&mut self) -> Option<FeedResult<Quote>> {
        let payload = self.rx.recv().await?;
        Some(decode_quote(&payload))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// In-process bounded feed with a single consumer
pub struct ChannelFeed {
    topic: String,
    tx: mpsc::Sender<String>,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
    published: AtomicU64,
}

impl ChannelFeed {
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            topic: topic.into(),
            tx,
            rx: Mutex::new(Some(rx)),
            published: AtomicU64::new(0),
        }
    }

    /// Publish an already encoded payload (live ingestion path)
    pub async fn publish_raw(&self, payload: String) -> FeedResult<()> {
        self.tx.send(payload).await.map_err(|_| FeedError::Closed)?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Payloads accepted onto the queue so far
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl QuoteFeed for ChannelFeed {
    async fn publish(&self, quote: &Quote) -> FeedResult<()> {
        let payload = encode_quote(quote)?;
        self.publish_raw(payload).await
    }

    fn subscribe(&self) -> FeedResult<FeedSubscription> {
        let rx = self.rx.lock().take().ok_or(FeedError::AlreadySubscribed)?;
        info!(topic = %self.topic, "Feed subscription opened");
        Ok(FeedSubscription::new(self.topic.clone(), rx))
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

/// Open the feed named by a `feed_endpoint` setting (`memory://<topic>`)
pub fn open_feed(endpoint: &str, capacity: usize) -> FeedResult<Arc<ChannelFeed>> {
    let topic = endpoint
        .strip_prefix("memory://")
        .ok_or_else(|| FeedError::UnsupportedEndpoint(endpoint.to_string()))?;
    let topic = if topic.is_empty() { "forex_rates_stream" } else { topic };

    debug!(topic, capacity, "Opening in-process feed");
    Ok(Arc::new(ChannelFeed::new(topic, capacity)))
}
