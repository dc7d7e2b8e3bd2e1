use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

use writedown_types::{CollectionChange, DocumentChange};

/// Default number of changes buffered per receiver before it lags.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// The receiver fell behind and `n` changes were dropped; whatever it
    /// built from earlier changes can no longer be trusted.
    #[error("subscriber lagged behind by {0} changes")]
    Lagged(u64),
    #[error("dispatcher closed")]
    Closed,
}

/// Publishes every committed write, in commit order, to all subscribers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for changes; every receiver sees every change
    broadcast_tx: broadcast::Sender<CollectionChange>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(DispatcherInner { broadcast_tx }),
        }
    }

    /// Publish a change. Returns how many receivers got it.
    pub fn publish(&self, collection: &str, change: DocumentChange) -> usize {
        let event = CollectionChange {
            collection: collection.to_string(),
            change,
        };
        match self.inner.broadcast_tx.send(event) {
            Ok(receivers) => {
                trace!("change in {} sent to {} receivers", collection, receivers);
                receivers
            }
            Err(_) => {
                debug!("no subscribers for change in {}", collection);
                0
            }
        }
    }

    /// Raw receiver for every collection. Gateway connections filter it
    /// against their own subscription set.
    pub fn subscribe_all(&self) -> broadcast::Receiver<CollectionChange> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Changes of a single collection, from now on.
    pub fn subscribe(&self, collection: &str) -> CollectionSubscription {
        CollectionSubscription {
            collection: collection.to_string(),
            rx: self.inner.broadcast_tx.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.inner.broadcast_tx.receiver_count()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for one collection's changes. Dropping it unsubscribes.
pub struct CollectionSubscription {
    collection: String,
    rx: broadcast::Receiver<CollectionChange>,
}

impl CollectionSubscription {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Next change in this collection, skipping everything else.
    pub async fn recv(&mut self) -> Result<DocumentChange, SubscriptionError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.collection == self.collection => return Ok(event.change),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => return Err(SubscriptionError::Lagged(n)),
                Err(RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }
}
