//! ==============================================================================
//! registry.rs - node liveness table
//! ==============================================================================
//!
//! purpose:
//!     authoritative in-memory state for every sensor node the gateway has heard
//!     from: latest payload, last-seen time and ACTIVE/STALE state.
//!
//! rules:
//!     - MAX_NODES pre-allocated slots, slot (id - 1) belongs to node id. a
//!       node without a slot (id 0, id > MAX_NODES) is rejected, never
//!       evicting anyone.
//!     - upsert promotes to ACTIVE; only the sweeper demotes to STALE.
//!     - every call is one critical section over the whole table. readers get
//!       clones, nobody holds a reference into the table.
//!
//! relationships:
//!     - written by: ingest.rs (upsert), sweeper.rs (mark_stale_if_expired)
//!     - read by: api.rs, gateway.rs (snapshots, has_any_active)
//!
//! ==============================================================================

use crate::domain::{NodeId, NodeState, Payload, RegistryEntry, RegistrySnapshot};
use crate::error::RegistryError;
use parking_lot::Mutex;
use std::net::SocketAddr;

/// one ACTIVE -> STALE transition performed by a sweep
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaleTransition {
    pub node_id: NodeId,
    /// ms between last_seen and the sweep time
    pub elapsed_ms: u64,
}

#[derive(Default)]
pub struct NodeRegistry {
    slots: Mutex<RegistrySnapshot>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// record a successfully decoded payload for `node_id`
    ///
    /// returns a copy of the updated entry, which is what update notifications carry.
    pub fn upsert(
        &self,
        node_id: NodeId,
        payload: Payload,
        source: SocketAddr,
        now_ms: u64,
    ) -> Result<RegistryEntry, RegistryError> {
        let idx = node_id.index().ok_or(RegistryError::CapacityExceeded { node_id })?;
        let mut slots = self.slots.lock();
        let slot = &mut slots[idx];

        if let Some(entry) = slot.as_mut() {
            entry.payload = payload;
            entry.source = source;
            // a late clock reading never moves last_seen backwards
            entry.last_seen_ms = entry.last_seen_ms.max(now_ms);
            entry.updates += 1;
            entry.state = NodeState::Active;
            return Ok(entry.clone());
        }

        let entry = slot.insert(RegistryEntry {
            node_id,
            payload,
            source,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            updates: 1,
            state: NodeState::Active,
        });

        Ok(entry.clone())
    }

    /// demote every ACTIVE node whose last datagram is at least `timeout_ms` old
    pub fn mark_stale_if_expired(&self, now_ms: u64, timeout_ms: u64) -> Vec<StaleTransition> {
        let mut slots = self.slots.lock();
        let mut transitions = Vec::new();

        for entry in slots.iter_mut().flatten() {
            if entry.state != NodeState::Active {
                continue;
            }
            let elapsed_ms = entry.age_ms(now_ms);
            if elapsed_ms >= timeout_ms {
                entry.state = NodeState::Stale;
                transitions.push(StaleTransition { node_id: entry.node_id, elapsed_ms });
            }
        }

        transitions
    }

    /// copy of one node's entry
    pub fn snapshot(&self, node_id: NodeId) -> Option<RegistryEntry> {
        let idx = node_id.index()?;
        self.slots.lock()[idx].clone()
    }

    /// copy of the whole table, index (id - 1), `None` for never-seen nodes
    pub fn snapshot_all(&self) -> RegistrySnapshot {
        self.slots.lock().clone()
    }

    pub fn has_any_active(&self) -> bool {
        self.slots.lock().iter().flatten().any(RegistryEntry::is_active)
    }

    pub fn active_count(&self) -> usize {
        self.slots.lock().iter().flatten().filter(|e| e.is_active()).count()
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }
}
