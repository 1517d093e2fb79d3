//! ==============================================================================
//! ingest.rs - telemetry ingestion loop
//! ==============================================================================
//!
//! purpose:
//!     the only task that reads the telemetry socket. one cycle is:
//!
//! ```text
//!     WAIT_TRANSPORT_READY ──► RECEIVE ──► DECODE ──► UPDATE_REGISTRY ──► NOTIFY
//!            │ not ready         │ no data   │ bad frame     │ table full
//!            ▼                   ▼           ▼               ▼
//!        backoff, retry        next cycle  log, next     log once per id
//!
//!     nothing that happens inside a cycle is fatal; only shutdown ends the loop.
//! ```
//!
//! relationships:
//!     - uses: transport.rs (guardian), decoder.rs, registry.rs, notify.rs
//!     - spawned by: gateway.rs
//!
//! ==============================================================================

use crate::clock::Clock;
use crate::config::GatewayConfig;
use crate::decoder::{self, Frame};
use crate::domain::{NodeId, Payload};
use crate::error::{DecodeError, RegistryError};
use crate::notify::Notifier;
use crate::registry::NodeRegistry;
use crate::transport::{SocketFactory, TransportGuardian};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// what one ingestion cycle did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// health check failed, no receive attempted
    TransportDown,
    /// receive wait elapsed without a datagram
    Idle,
    /// the socket reported a receive error
    ReceiveError,
    /// datagram did not decode, registry untouched
    Discarded(DecodeError),
    /// decoded, but the node table has no room for this id
    CapacityExceeded(NodeId),
    Updated(NodeId),
}

/// loop tunables
#[derive(Clone, Debug)]
pub struct IngestSettings {
    pub recv_timeout: Duration,
    pub backoff: Duration,
    pub max_payload: usize,
    pub show_sensor_data: bool,
}

impl IngestSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            recv_timeout: config.ingest.recv_timeout(),
            backoff: config.ingest.backoff(),
            max_payload: config.ingest.max_payload,
            show_sensor_data: config.logging.show_sensor_data,
        }
    }
}

/// decode -> upsert -> notify for one datagram
pub struct DatagramHandler {
    registry: Arc<NodeRegistry>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    show_sensor_data: bool,
    /// ids already reported as rejected for capacity
    rejected: HashSet<NodeId>,
}

impl DatagramHandler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn Clock>,
        show_sensor_data: bool,
    ) -> Self {
        Self { registry, notifier, clock, show_sensor_data, rejected: HashSet::new() }
    }

    pub fn handle(&mut self, bytes: &[u8], source: SocketAddr) -> CycleOutcome {
        let frame = match decoder::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    "[RX] discarded {} bytes from {}: {} [{}]",
                    bytes.len(),
                    source,
                    e,
                    decoder::preview(bytes)
                );
                return CycleOutcome::Discarded(e);
            }
        };

        if self.show_sensor_data {
            log_frame(&frame, source);
        }

        let (node_id, payload) = frame.into_parts();
        self.apply(node_id, payload, source)
    }

    /// record an already decoded payload and notify on success
    pub fn apply(&mut self, node_id: NodeId, payload: Payload, source: SocketAddr) -> CycleOutcome {
        let now = self.clock.now_ms();
        match self.registry.upsert(node_id, payload, source, now) {
            Ok(entry) => {
                if !self.notifier.publish(&entry, now) {
                    debug!("[RX] N={} update debounced", node_id);
                }
                CycleOutcome::Updated(node_id)
            }
            Err(RegistryError::CapacityExceeded { node_id }) => {
                if self.rejected.insert(node_id) {
                    warn!(
                        "[RX] no slot for N={} from {}, ignoring (further datagrams dropped silently)",
                        node_id, source
                    );
                }
                CycleOutcome::CapacityExceeded(node_id)
            }
        }
    }
}

fn log_frame(frame: &Frame, source: SocketAddr) {
    match frame {
        Frame::Structured(r) => info!(
            "[RX] N={} from {} seq={} aht[{}] {:.1}C {:.1}% bmp[{}] {:.1}C {:.1}hPa rssi={}",
            r.node_id,
            source,
            r.seq,
            if r.aht.ok { "ok" } else { "err" },
            r.aht.t01 as f32 / 10.0,
            r.aht.rh01 as f32 / 10.0,
            if r.bmp.ok { "ok" } else { "err" },
            r.bmp.t01 as f32 / 10.0,
            r.bmp.p01 as f32 / 10.0,
            r.rssi
        ),
        Frame::Legacy { node_id, text } => {
            info!("[RX] N={} from {} legacy: {}", node_id, source, text.escape_debug())
        }
    }
}

pub struct IngestLoop<F: SocketFactory> {
    guardian: Arc<TransportGuardian<F>>,
    handler: DatagramHandler,
    recv_timeout: Duration,
    backoff: Duration,
    buf: Vec<u8>,
}

impl<F: SocketFactory> IngestLoop<F> {
    pub fn new(
        guardian: Arc<TransportGuardian<F>>,
        registry: Arc<NodeRegistry>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn Clock>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            guardian,
            handler: DatagramHandler::new(registry, notifier, clock, settings.show_sensor_data),
            recv_timeout: settings.recv_timeout,
            backoff: settings.backoff,
            buf: vec![0u8; settings.max_payload],
        }
    }

    /// one full iteration: health check, bounded receive, handle
    pub async fn cycle(&mut self) -> CycleOutcome {
        if let Err(e) = self.guardian.ensure_healthy().await {
            warn!("[TRANSPORT] {}", e);
            return CycleOutcome::TransportDown;
        }

        let datagram = match self.guardian.recv(&mut self.buf, self.recv_timeout).await {
            Ok(Some(d)) => d,
            Ok(None) => return CycleOutcome::Idle,
            Err(e) => {
                warn!("[RX] {}", e);
                return CycleOutcome::ReceiveError;
            }
        };

        self.handler.handle(&self.buf[..datagram.len], datagram.source)
    }

    /// repeat `cycle` until `shutdown` flips to true (or its sender is dropped)
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("[RX] ingest loop started");
        while !*shutdown.borrow() {
            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.cycle() => outcome,
            };

            if outcome == CycleOutcome::TransportDown {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.backoff) => {}
                }
            }
        }
        info!("[RX] ingest loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::NodeState;
    use crate::transport::mock::{MockFactory, MockNet};

    const WAIT: Duration = Duration::from_millis(30);

    struct Rig {
        net: MockNet,
        guardian: Arc<TransportGuardian<MockFactory>>,
        registry: Arc<NodeRegistry>,
        notifier: Arc<Notifier>,
        clock: Arc<ManualClock>,
    }

    impl Rig {
        fn new() -> Self {
            let net = MockNet::new();
            Self {
                guardian: Arc::new(TransportGuardian::new(net.factory(), 50000)),
                net,
                registry: Arc::new(NodeRegistry::new()),
                notifier: Arc::new(Notifier::new(16, 0)),
                clock: Arc::new(ManualClock::new(1_000)),
            }
        }

        fn ingest(&self) -> IngestLoop<MockFactory> {
            IngestLoop::new(
                Arc::clone(&self.guardian),
                Arc::clone(&self.registry),
                Arc::clone(&self.notifier),
                self.clock.clone(),
                IngestSettings {
                    recv_timeout: WAIT,
                    backoff: Duration::from_millis(10),
                    max_payload: 256,
                    show_sensor_data: true,
                },
            )
        }
    }

    fn node(last: u8) -> SocketAddr {
        SocketAddr::from(([192, 168, 4, last], 50000))
    }

    fn json(id: u8, seq: u32) -> Vec<u8> {
        format!(
            r#"{{"child_no":{},"aht_t01":253,"aht_rh01":482,"bmp_t01":251,"bmp_p01":100845,"aht_ok":true,"bmp_ok":true,"seq":{}}}"#,
            id, seq
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_structured_datagram_updates_and_notifies() {
        let rig = Rig::new();
        let mut rx = rig.notifier.subscribe();
        let mut ingest = rig.ingest();

        rig.net.deliver(&json(2, 7), node(12));
        assert_eq!(ingest.cycle().await, CycleOutcome::Updated(NodeId(2)));

        let entry = rig.registry.snapshot(NodeId(2)).unwrap();
        assert_eq!(entry.state, NodeState::Active);
        assert_eq!(entry.last_seen_ms, 1_000);
        assert_eq!(entry.source, node(12));
        assert_eq!(entry.payload.reading().unwrap().seq, 7);

        let event = rx.try_recv().unwrap();
        assert_eq!(event, entry);
    }

    #[tokio::test]
    async fn test_legacy_datagram_is_stored_verbatim() {
        let rig = Rig::new();
        let mut ingest = rig.ingest();

        rig.net.deliver(b"N=3,T=22.5,H=40", node(13));
        assert_eq!(ingest.cycle().await, CycleOutcome::Updated(NodeId(3)));
        assert_eq!(
            rig.registry.snapshot(NodeId(3)).unwrap().payload,
            Payload::Legacy { text: "T=22.5,H=40".into() }
        );
    }

    #[tokio::test]
    async fn test_bad_frame_leaves_registry_untouched() {
        let rig = Rig::new();
        let mut rx = rig.notifier.subscribe();
        let mut ingest = rig.ingest();

        rig.net.deliver(&json(1, 1), node(11));
        ingest.cycle().await;
        let before = rig.registry.snapshot_all();
        rx.try_recv().unwrap();

        for bad in [&b"\xff\xfe\x00\x01"[..], b"N=9,x", br#"{"child_no":1}"#, b"hello"] {
            rig.clock.advance(100);
            rig.net.deliver(bad, node(11));
            assert!(matches!(ingest.cycle().await, CycleOutcome::Discarded(_)));
        }

        assert_eq!(rig.registry.snapshot_all(), before);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_idle_cycle_without_data() {
        let rig = Rig::new();
        let mut ingest = rig.ingest();
        assert_eq!(ingest.cycle().await, CycleOutcome::Idle);
        assert!(rig.guardian.status().is_ready());
    }

    #[tokio::test]
    async fn test_capacity_rejection_is_reported_once_per_id() {
        let rig = Rig::new();
        let mut ingest = rig.ingest();

        rig.net.deliver(&json(1, 1), node(11));
        ingest.cycle().await;
        let before = rig.registry.snapshot_all();

        // ids without a slot never reach the table
        for id in [0u8, 7, 7, 7, 0] {
            assert_eq!(
                ingest.handler.apply(NodeId(id), Payload::Legacy { text: "x".into() }, node(id)),
                CycleOutcome::CapacityExceeded(NodeId(id))
            );
        }
        assert_eq!(ingest.handler.rejected.len(), 2);
        assert_eq!(rig.registry.snapshot_all(), before);
    }

    #[tokio::test]
    async fn test_reopen_happens_before_next_receive() {
        let rig = Rig::new();
        let mut ingest = rig.ingest();

        rig.net.deliver(&json(1, 1), node(11));
        assert_eq!(ingest.cycle().await, CycleOutcome::Updated(NodeId(1)));
        let before = rig.registry.snapshot_all();

        // socket breaks between cycles with a datagram queued
        rig.net.deliver(&json(1, 2), node(11));
        rig.net.break_socket();

        assert_eq!(ingest.cycle().await, CycleOutcome::Updated(NodeId(1)));
        assert_eq!(rig.net.opens(), 2);
        assert_eq!(rig.guardian.reopen_count(), 1);

        // only the new reading changed the entry
        let after = rig.registry.snapshot(NodeId(1)).unwrap();
        let prev = before[0].as_ref().unwrap();
        assert_eq!(after.first_seen_ms, prev.first_seen_ms);
        assert_eq!(after.updates, prev.updates + 1);
    }

    #[tokio::test]
    async fn test_transport_down_skips_receive() {
        let rig = Rig::new();
        let mut ingest = rig.ingest();

        rig.net.fail_next_opens(1);
        rig.net.deliver(&json(4, 1), node(14));
        assert_eq!(ingest.cycle().await, CycleOutcome::TransportDown);
        assert!(!rig.guardian.status().is_ready());
        assert_eq!(rig.net.pending(), 1);

        assert_eq!(ingest.cycle().await, CycleOutcome::Updated(NodeId(4)));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let rig = Rig::new();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(rig.ingest().run(rx));

        rig.net.deliver(b"N=1,up", node(11));
        tokio::time::timeout(Duration::from_secs(2), async {
            while rig.registry.snapshot(NodeId(1)).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_backs_off_while_transport_down() {
        let rig = Rig::new();
        rig.net.fail_next_opens(usize::MAX);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(rig.ingest().run(rx));

        tokio::time::sleep(Duration::from_millis(55)).await;
        // 10ms backoff: a handful of attempts, not a spin
        let attempts = rig.net.opens();
        assert!(attempts >= 2 && attempts <= 10, "attempts = {}", attempts);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
