//! ==============================================================================
//! transport.rs - udp socket guardian
//! ==============================================================================
//!
//! purpose:
//!     owns the telemetry socket and keeps it usable. before every receive the
//!     ingest loop asks the guardian to check the socket; a socket that no
//!     longer reports "bound on our port" (or carries a pending error) is
//!     dropped and reopened on the same fixed port.
//!
//! locking:
//!     one tokio mutex guards the socket slot. the health check, the reopen,
//!     the non-blocking receive and the send path all run under it, so a send
//!     can never race a reopen on the same handle. waiting for readability
//!     happens outside the lock, raced against a `retired` notification. a
//!     reopen wakes every waiter and waits for them to let go of the old
//!     socket before binding the port again; a generation counter catches a
//!     reopen that slipped in between the wakeup and the receive.
//!
//! ```text
//!     ┌───────────┐  ensure_healthy   ┌──────────────────────────┐
//!     │ ingest.rs ├──────────────────►│ Mutex<SocketSlot>        │
//!     │           │  recv             │   socket: Arc<S>         │
//!     └───────────┘                   │   generation: u64        │
//!     ┌───────────┐  send_to          │                          │
//!     │ any task  ├──────────────────►│ SocketFactory::open(port)│
//!     └───────────┘                   └──────────────────────────┘
//! ```
//!
//! relationships:
//!     - used by: ingest.rs, gateway.rs
//!     - status read by: sweeper.rs, api.rs (TransportStatus)
//!
//! ==============================================================================

use crate::error::TransportError;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

/// state a socket reports about itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketState {
    Bound(SocketAddr),
    Errored(String),
    Closed,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketState::Bound(addr) => write!(f, "bound {}", addr),
            SocketState::Errored(e) => write!(f, "error: {}", e),
            SocketState::Closed => write!(f, "closed"),
        }
    }
}

/// connectionless socket the guardian can supervise
pub trait DatagramSocket: Send + Sync + 'static {
    fn state(&self) -> SocketState;

    /// resolves once a datagram may be waiting
    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send + '_;

    /// non-blocking receive, `WouldBlock` when nothing is queued
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// non-blocking send
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}

/// creates sockets bound to a fixed local port
pub trait SocketFactory: Send + Sync + 'static {
    type Socket: DatagramSocket;

    fn open(&self, port: u16) -> impl Future<Output = io::Result<Self::Socket>> + Send + '_;
}

impl DatagramSocket for UdpSocket {
    fn state(&self) -> SocketState {
        // SO_ERROR is cleared by reading it, which is fine: we reopen anyway
        match self.take_error() {
            Ok(Some(e)) | Err(e) => return SocketState::Errored(e.to_string()),
            Ok(None) => {}
        }
        match self.local_addr() {
            Ok(addr) => SocketState::Bound(addr),
            Err(_) => SocketState::Closed,
        }
    }

    fn readable(&self) -> impl Future<Output = io::Result<()>> + Send + '_ {
        UdpSocket::readable(self)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::try_recv_from(self, buf)
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::try_send_to(self, buf, target)
    }
}

/// binds tokio udp sockets on `bind_ip:<port>`
#[derive(Clone, Debug)]
pub struct UdpSocketFactory {
    pub bind_ip: IpAddr,
}

impl SocketFactory for UdpSocketFactory {
    type Socket = UdpSocket;

    fn open(&self, port: u16) -> impl Future<Output = io::Result<UdpSocket>> + Send + '_ {
        UdpSocket::bind(SocketAddr::new(self.bind_ip, port))
    }
}

/// shared view of the guardian: "socket is usable" flag and reopen counter
#[derive(Clone, Default, Debug)]
pub struct TransportStatus {
    ready: Arc<AtomicBool>,
    reopens: Arc<AtomicU64>,
}

impl TransportStatus {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn reopen_count(&self) -> u64 {
        self.reopens.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn record_reopen(&self) {
        self.reopens.fetch_add(1, Ordering::SeqCst);
    }
}

/// how long a reopen waits for receivers to drop the old socket
const RETIRE_WAIT: Duration = Duration::from_millis(500);

/// one received datagram, payload is in the caller's buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub len: usize,
    pub source: SocketAddr,
}

struct SocketSlot<S> {
    socket: Option<Arc<S>>,
    /// bumped on every successful open
    generation: u64,
}

pub struct TransportGuardian<F: SocketFactory> {
    factory: F,
    port: u16,
    slot: Mutex<SocketSlot<F::Socket>>,
    status: TransportStatus,
    /// woken when the current socket is taken out of service
    retired: Notify,
}

impl<F: SocketFactory> TransportGuardian<F> {
    /// guardian for `port`; nothing is opened until the first health check
    pub fn new(factory: F, port: u16) -> Self {
        Self {
            factory,
            port,
            slot: Mutex::new(SocketSlot { socket: None, generation: 0 }),
            status: TransportStatus::default(),
            retired: Notify::new(),
        }
    }

    pub fn status(&self) -> TransportStatus {
        self.status.clone()
    }

    pub fn reopen_count(&self) -> u64 {
        self.status.reopen_count()
    }

    /// address of the current socket, if any
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let slot = self.slot.lock().await;
        match slot.socket.as_deref().map(|s| s.state()) {
            Some(SocketState::Bound(addr)) => Some(addr),
            _ => None,
        }
    }

    /// verify the socket and reopen it if it is not bound on our port
    pub async fn ensure_healthy(&self) -> Result<(), TransportError> {
        let mut slot = self.slot.lock().await;

        let fault = match slot.socket.as_deref().map(|s| s.state()) {
            Some(SocketState::Bound(addr)) if self.port == 0 || addr.port() == self.port => None,
            Some(state) => Some(state),
            None => Some(SocketState::Closed),
        };
        let Some(fault) = fault else {
            self.status.set_ready(true);
            return Ok(());
        };

        let reopening = slot.generation > 0;
        if reopening && slot.socket.is_some() {
            warn!("[TRANSPORT] socket state invalid ({}), reopening port {}", fault, self.port);
        }

        self.status.set_ready(false);
        if let Some(old) = slot.socket.take() {
            self.retire(old).await;
        }

        match self.factory.open(self.port).await {
            Ok(socket) => {
                slot.socket = Some(Arc::new(socket));
                slot.generation += 1;
                if reopening {
                    self.status.record_reopen();
                }
                self.status.set_ready(true);
                info!(
                    "[TRANSPORT] udp socket {} on port {} (generation {})",
                    if reopening { "reopened" } else { "opened" },
                    self.port,
                    slot.generation
                );
                Ok(())
            }
            Err(source) => Err(TransportError::RecreateFailed { port: self.port, source }),
        }
    }

    /// wake receivers parked on `old` and close it once they have let go
    async fn retire(&self, old: Arc<F::Socket>) {
        self.retired.notify_waiters();
        let started = tokio::time::Instant::now();
        while Arc::strong_count(&old) > 1 {
            if started.elapsed() >= RETIRE_WAIT {
                warn!("[TRANSPORT] old socket still held after {:?}", RETIRE_WAIT);
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // dropping the last handle closes it; nothing useful to do with a close error
        drop(old);
    }

    /// wait up to `wait` for one datagram
    ///
    /// `Ok(None)` means nothing arrived (or the socket was replaced while waiting).
    pub async fn recv(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> Result<Option<Datagram>, TransportError> {
        // registered under the lock so a reopen after this point always wakes us
        let (socket, generation, retired) = {
            let slot = self.slot.lock().await;
            match &slot.socket {
                Some(socket) => (Arc::clone(socket), slot.generation, self.retired.notified()),
                None => return Err(TransportError::NotReady),
            }
        };

        let woke = tokio::select! {
            _ = retired => None,
            r = tokio::time::timeout(wait, socket.readable()) => Some(r),
        };
        // never hold the old handle while queueing on the lock
        drop(socket);
        match woke {
            None | Some(Err(_)) => return Ok(None),
            Some(Ok(Err(e))) => return Err(TransportError::Receive(e)),
            Some(Ok(Ok(()))) => {}
        }

        let slot = self.slot.lock().await;
        let socket = match &slot.socket {
            Some(socket) if slot.generation == generation => socket,
            _ => return Ok(None),
        };
        match socket.try_recv_from(buf) {
            Ok((len, source)) => Ok(Some(Datagram { len, source })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::Receive(e)),
        }
    }

    /// send one datagram on the guarded socket
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, TransportError> {
        let slot = self.slot.lock().await;
        let socket = slot.socket.as_ref().ok_or(TransportError::NotReady)?;
        socket.try_send_to(buf, target).map_err(TransportError::Send)
    }
}

// ==============================================================================
// in-memory socket for tests
// ==============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// handle shared by the factory, its sockets and the test body
    #[derive(Clone, Default)]
    pub struct MockNet {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        inbox: SyncMutex<VecDeque<(Vec<u8>, SocketAddr)>>,
        sent: SyncMutex<Vec<(Vec<u8>, SocketAddr)>>,
        arrived: Notify,
        current: SyncMutex<Option<Arc<SyncMutex<SocketState>>>>,
        opens: AtomicUsize,
        failing_opens: AtomicUsize,
    }

    impl MockNet {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn factory(&self) -> MockFactory {
            MockFactory { net: self.clone() }
        }

        /// queue an inbound datagram
        pub fn deliver(&self, payload: &[u8], from: SocketAddr) {
            self.inner.inbox.lock().push_back((payload.to_vec(), from));
            self.inner.arrived.notify_one();
        }

        /// make the current socket report an invalid state
        pub fn break_socket(&self) {
            if let Some(state) = self.inner.current.lock().as_ref() {
                *state.lock() = SocketState::Closed;
            }
        }

        /// fail the next `n` open attempts
        pub fn fail_next_opens(&self, n: usize) {
            self.inner.failing_opens.store(n, Ordering::SeqCst);
        }

        pub fn opens(&self) -> usize {
            self.inner.opens.load(Ordering::SeqCst)
        }

        pub fn pending(&self) -> usize {
            self.inner.inbox.lock().len()
        }

        pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            self.inner.sent.lock().clone()
        }
    }

    pub struct MockFactory {
        net: MockNet,
    }

    impl SocketFactory for MockFactory {
        type Socket = MockSocket;

        async fn open(&self, port: u16) -> io::Result<MockSocket> {
            let inner = &self.net.inner;
            inner.opens.fetch_add(1, Ordering::SeqCst);
            let failing = inner.failing_opens.load(Ordering::SeqCst);
            if failing > 0 {
                inner.failing_opens.store(failing - 1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "mock bind failure"));
            }
            let port = if port == 0 { 40000 } else { port };
            let state = Arc::new(SyncMutex::new(SocketState::Bound(SocketAddr::from((
                [127, 0, 0, 1],
                port,
            )))));
            *inner.current.lock() = Some(Arc::clone(&state));
            Ok(MockSocket { net: self.net.clone(), state })
        }
    }

    pub struct MockSocket {
        net: MockNet,
        state: Arc<SyncMutex<SocketState>>,
    }

    impl DatagramSocket for MockSocket {
        fn state(&self) -> SocketState {
            self.state.lock().clone()
        }

        async fn readable(&self) -> io::Result<()> {
            loop {
                let arrived = self.net.inner.arrived.notified();
                if !self.net.inner.inbox.lock().is_empty() {
                    return Ok(());
                }
                arrived.await;
            }
        }

        fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let (payload, from) = self
                .net
                .inner
                .inbox
                .lock()
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            Ok((len, from))
        }

        fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.net.inner.sent.lock().push((buf.to_vec(), target));
            Ok(buf.len())
        }
    }
}
