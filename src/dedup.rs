//! Time-windowed message deduplication
//!
//! Multiple gateways hear the same radio frame; the deduplicator collapses
//! their copies into a single processing pass. The first contributor for a
//! key becomes the collector: a background task sleeps out the window, then
//! hands the collected values back through a one-shot channel. Every other
//! contributor appends its value and returns immediately with an empty
//! result. After the window, the key stays addressable for one more window
//! to silently absorb late stragglers, then is discarded.
//!
//! Keys are content hashes of the payload; two gateways relaying the same
//! frame always land in the same collection regardless of sender identity.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::trace;

struct Slot<T> {
    open: bool,
    values: Vec<T>,
}

/// Time-windowed collector keyed by payload content.
pub struct Deduplicator<T> {
    window: Duration,
    collections: Arc<Mutex<HashMap<Vec<u8>, Slot<T>>>>,
}

impl<T> Clone for Deduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            window: self.window,
            collections: Arc::clone(&self.collections),
        }
    }
}

impl<T: Send + 'static> Deduplicator<T> {
    /// Create a deduplicator with the given collection window
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            collections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Collection window
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Contribute `value` under `key`.
    ///
    /// The first caller for a key blocks for the window and receives every
    /// contributed value in contribution order, its own first. All other
    /// callers return an empty list immediately. A started collection always
    /// runs to completion; no cancellation propagates into the window.
    pub async fn deduplicate(&self, key: &[u8], value: T) -> Vec<T> {
        let rx = {
            let mut map = self.collections.lock();
            match map.entry(key.to_vec()) {
                Entry::Occupied(mut entry) => {
                    let slot = entry.get_mut();
                    if slot.open {
                        slot.values.push(value);
                    } else {
                        // Late straggler during the absorb phase: swallowed.
                        trace!(key_len = key.len(), "absorbed late duplicate");
                    }
                    return Vec::new();
                }
                Entry::Vacant(entry) => {
                    entry.insert(Slot {
                        open: true,
                        values: vec![value],
                    });
                    let (tx, rx) = oneshot::channel();
                    let collections = Arc::clone(&self.collections);
                    let key = key.to_vec();
                    let window = self.window;
                    tokio::spawn(collect(collections, key, window, tx));
                    rx
                }
            }
        };

        // The sender is only dropped if the collector task dies; treat that
        // as an empty collection rather than propagating a panic.
        rx.await.unwrap_or_default()
    }
}

async fn collect<T: Send>(
    collections: Arc<Mutex<HashMap<Vec<u8>, Slot<T>>>>,
    key: Vec<u8>,
    window: Duration,
    tx: oneshot::Sender<Vec<T>>,
) {
    sleep(window).await;

    let values = {
        let mut map = collections.lock();
        match map.get_mut(&key) {
            Some(slot) => {
                slot.open = false;
                std::mem::take(&mut slot.values)
            }
            None => Vec::new(),
        }
    };
    trace!(count = values.len(), "deduplication window closed");
    let _ = tx.send(values);

    // Keep the closed slot around for one more window so stragglers are
    // absorbed instead of opening a fresh collection.
    sleep(window).await;
    collections.lock().remove(&key);
}
