//! update notifications
//!
//! every successful upsert is published on a bounded broadcast channel. the
//! producer debounces per node: an update arriving less than `min_spacing`
//! after the last published one for the same node is not published. a slow
//! consumer loses the oldest events first (it sees `RecvError::Lagged`).

use crate::domain::{NodeId, RegistryEntry};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

pub struct Notifier {
    tx: broadcast::Sender<RegistryEntry>,
    min_spacing_ms: u64,
    last_published: Mutex<HashMap<NodeId, u64>>,
}

impl Notifier {
    /// `capacity` events are buffered per subscriber
    pub fn new(capacity: usize, min_spacing_ms: u64) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, min_spacing_ms, last_published: Mutex::new(HashMap::new()) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEntry> {
        self.tx.subscribe()
    }

    /// publish `entry` unless it falls inside the debounce window
    ///
    /// returns true if the event was enqueued (even with no subscribers).
    pub fn publish(&self, entry: &RegistryEntry, now_ms: u64) -> bool {
        {
            let mut last = self.last_published.lock();
            if let Some(prev) = last.get(&entry.node_id) {
                if now_ms.saturating_sub(*prev) < self.min_spacing_ms {
                    return false;
                }
            }
            last.insert(entry.node_id, now_ms);
        }
        // Err only means nobody is subscribed right now
        let _ = self.tx.send(entry.clone());
        true
    }
}
