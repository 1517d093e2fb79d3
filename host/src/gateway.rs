//! ==============================================================================
//! gateway.rs - gateway lifecycle
//! ==============================================================================
//!
//! purpose:
//!     owns every piece of shared state (registry, notifier, socket guardian)
//!     and the two core tasks that mutate it. consumers (api, relay, led
//!     indicator) get `Arc` handles or a notification subscription from here.
//!
//! lifecycle:
//!     new()      -> nothing running, socket not opened yet
//!     run()      -> spawns ingest loop + liveness sweeper
//!     shutdown() -> flips the shutdown signal, waits (bounded) for both tasks
//!
//! relationships:
//!     - builds: transport.rs, registry.rs, notify.rs, ingest.rs, sweeper.rs
//!     - used by: main.rs
//!
//! ==============================================================================

use crate::clock::Clock;
use crate::config::{GatewayConfig, LivenessConfig};
use crate::domain::{RegistryEntry, RegistrySnapshot};
use crate::ingest::{IngestLoop, IngestSettings};
use crate::notify::Notifier;
use crate::registry::NodeRegistry;
use crate::sweeper::LivenessSweeper;
use crate::transport::{SocketFactory, TransportGuardian, TransportStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// how long shutdown waits for each task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub struct Gateway<F: SocketFactory> {
    name: String,
    guardian: Arc<TransportGuardian<F>>,
    registry: Arc<NodeRegistry>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    ingest: IngestSettings,
    liveness: LivenessConfig,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<F: SocketFactory> Gateway<F> {
    pub fn new(config: &GatewayConfig, factory: F, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: config.gateway_name(),
            guardian: Arc::new(TransportGuardian::new(factory, config.ingest.port)),
            registry: Arc::new(NodeRegistry::new()),
            notifier: Arc::new(Notifier::new(config.notify.capacity, config.notify.min_spacing_ms)),
            clock,
            ingest: IngestSettings::from_config(config),
            liveness: config.liveness.clone(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn guardian(&self) -> Arc<TransportGuardian<F>> {
        Arc::clone(&self.guardian)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn transport_status(&self) -> TransportStatus {
        self.guardian.status()
    }

    /// update notifications, one per published upsert
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEntry> {
        self.notifier.subscribe()
    }

    /// receiver that flips to true when the gateway shuts down
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn snapshot_all(&self) -> RegistrySnapshot {
        self.registry.snapshot_all()
    }

    pub fn has_any_active(&self) -> bool {
        self.registry.has_any_active()
    }

    /// spawn the ingest loop and the sweeper; a second call is ignored
    pub fn run(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("[GATEWAY] {} already running", self.name);
            return;
        }

        let ingest = IngestLoop::new(
            Arc::clone(&self.guardian),
            Arc::clone(&self.registry),
            Arc::clone(&self.notifier),
            Arc::clone(&self.clock),
            self.ingest.clone(),
        );
        let sweeper = LivenessSweeper::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
            self.guardian.status(),
            self.liveness.sweep_interval(),
            self.liveness.stale_timeout_ms,
        );

        tasks.push(tokio::spawn(ingest.run(self.shutdown_signal())));
        tasks.push(tokio::spawn(sweeper.run(self.shutdown_signal())));
        info!("[GATEWAY] {} running", self.name);
    }

    /// signal every task to stop and wait for the core tasks
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[GATEWAY] task ended abnormally: {}", e),
                Err(_) => {
                    warn!("[GATEWAY] task did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                    task.abort();
                }
            }
        }
        info!("[GATEWAY] {} stopped", self.name);
    }
}
