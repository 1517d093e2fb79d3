//! per-node indicator leds
//!
//! one led per node id, toggled on every update notification so a blinking
//! led means "this node is talking". led `i` (0-based) belongs to node `i+1`.

use crate::domain::{NodeId, RegistryEntry, MAX_NODES};
use crate::hal::HardwareProvider;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub struct IndicatorLeds {
    hal: Arc<dyn HardwareProvider>,
    pins: Vec<u8>,
    levels: [bool; MAX_NODES],
}

impl IndicatorLeds {
    pub fn new(hal: Arc<dyn HardwareProvider>, pins: Vec<u8>) -> Self {
        if pins.len() < MAX_NODES {
            warn!("[LED] only {} of {} indicator pins configured", pins.len(), MAX_NODES);
        }
        Self { hal, pins, levels: [false; MAX_NODES] }
    }

    /// all configured pins to output, driven low
    pub fn init(&mut self) -> Result<()> {
        for &pin in self.pins.iter().take(MAX_NODES) {
            self.hal.set_output(pin)?;
        }
        self.levels = [false; MAX_NODES];
        info!("[LED] indicators initialized (gpio {:?})", &self.pins);
        Ok(())
    }

    /// flip the led of `node_id`; returns the new level, `None` if the node has no led
    pub fn toggle(&mut self, node_id: NodeId) -> Result<Option<bool>> {
        let Some(idx) = node_id.index() else {
            return Ok(None);
        };
        let Some(&pin) = self.pins.get(idx) else {
            return Ok(None);
        };
        let level = !self.levels[idx];
        self.hal.write_gpio(pin, level)?;
        self.levels[idx] = level;
        Ok(Some(level))
    }

    pub async fn run(
        mut self,
        mut updates: broadcast::Receiver<RegistryEntry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        while !*shutdown.borrow() {
            let entry = tokio::select! {
                _ = shutdown.changed() => break,
                event = updates.recv() => match event {
                    Ok(entry) => entry,
                    Err(RecvError::Lagged(n)) => {
                        debug!("[LED] skipped {} updates", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if let Err(e) = self.toggle(entry.node_id) {
                warn!("[LED] N={} toggle failed: {:#}", entry.node_id, e);
            }
        }
        // leave the leds dark
        for &pin in self.pins.iter().take(MAX_NODES) {
            let _ = self.hal.write_gpio(pin, false);
        }
        debug!("[LED] indicator task stopped");
    }
}
