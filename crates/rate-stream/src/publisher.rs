//! Update fan-out
//!
//! Every subscriber owns a bounded queue. `publish` only ever uses
//! `try_send`, so a slow or dead subscriber costs one failed send and
//! nothing else.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use fx_core::UpdateEvent;

struct SubscriberSlot {
    tx: mpsc::Sender<Arc<UpdateEvent>>,
    dropped: Arc<AtomicU64>,
}

/// Receiving end handed to a listener
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Arc<UpdateEvent>>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<UpdateEvent>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<UpdateEvent>> {
        self.rx.try_recv().ok()
    }

    /// Events discarded because this subscriber's queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> ReceiverStream<Arc<UpdateEvent>> {
        ReceiverStream::new(self.rx)
    }
}

/// Fan-out sink for update events
pub struct UpdatePublisher {
    subscribers: DashMap<u64, SubscriberSlot>,
    next_id: AtomicU64,
    buffer: usize,

    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl UpdatePublisher {
    /// `buffer` is the per-subscriber queue capacity
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a listener. It sees only events published from now on.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        let dropped = Arc::new(AtomicU64::new(0));

        self.subscribers.insert(
            id,
            SubscriberSlot {
                tx,
                dropped: Arc::clone(&dropped),
            },
        );
        info!(subscriber = id, "Subscriber registered");

        Subscription { id, rx, dropped }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            info!(subscriber = id, "Subscriber removed");
        }
    }

    /// Deliver `event` to every subscriber without waiting.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, event: UpdateEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut closed = Vec::new();

        for slot in self.subscribers.iter() {
            match slot.tx.try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    slot.dropped.fetch_add(1, Ordering::Relaxed);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = *slot.key(), symbol = %event.symbol, "Subscriber queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(*slot.key()),
            }
        }

        // Removal happens after iteration; DashMap shards are locked while iterating
        for id in closed {
            self.subscribers.remove(&id);
            warn!(subscriber = id, "Subscriber disconnected, removed");
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            subscribers: self.subscribers.len(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for UpdatePublisher {
    fn default() -> Self {
        Self::new(1_024)
    }
}

/// Publisher statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherStats {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}
