//! liveness sweeper
//!
//! demotes nodes that stopped reporting. runs on a fixed period and only while
//! the transport is ready: with the socket down every node would age out,
//! which says nothing about the nodes themselves.

use crate::clock::Clock;
use crate::registry::{NodeRegistry, StaleTransition};
use crate::transport::TransportStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub struct LivenessSweeper {
    registry: Arc<NodeRegistry>,
    clock: Arc<dyn Clock>,
    status: TransportStatus,
    period: Duration,
    timeout_ms: u64,
}

impl LivenessSweeper {
    pub fn new(
        registry: Arc<NodeRegistry>,
        clock: Arc<dyn Clock>,
        status: TransportStatus,
        period: Duration,
        timeout_ms: u64,
    ) -> Self {
        Self { registry, clock, status, period, timeout_ms }
    }

    /// one pass; no-op while the transport is not ready
    pub fn sweep(&self) -> Vec<StaleTransition> {
        if !self.status.is_ready() {
            return Vec::new();
        }
        let transitions = self.registry.mark_stale_if_expired(self.clock.now_ms(), self.timeout_ms);
        for t in &transitions {
            warn!("[STALE] N={} last_seen={}ms", t.node_id, t.elapsed_ms);
        }
        transitions
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "[STALE] sweeper started (every {}ms, timeout {}ms)",
            self.period.as_millis(),
            self.timeout_ms
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
        info!("[STALE] sweeper stopped");
    }
}
