//! ==============================================================================
//! relay.rs - downstream tcp relay
//! ==============================================================================
//!
//! purpose:
//!     forwards every structured reading to an upstream collector as one json
//!     line over tcp:
//!
//! ```text
//!     {"child_no":1,"aht_t01":253,"aht_rh01":482,"bmp_t01":251,
//!      "bmp_p01":100845,"aht_ok":true,"bmp_ok":true,"seq":7,"rssi":-61}\n
//! ```
//!
//! connection handling:
//!     - connect lazily on the first event, bounded by `connect_timeout`
//!     - a failed connect or write drops the event and the stream; the next
//!       event tries a fresh connection
//!     - legacy payloads carry no fields and are not forwarded
//!     - backlog is the broadcast channel: a slow collector loses the oldest
//!       events first
//!
//! relationships:
//!     - consumes: gateway.rs (update notifications)
//!
//! ==============================================================================

use crate::domain::{Reading, RegistryEntry};
use serde::Serialize;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// one line on the relay stream
#[derive(Debug, Serialize)]
struct RelayLine {
    child_no: u8,
    aht_t01: i16,
    aht_rh01: u16,
    bmp_t01: i16,
    bmp_p01: u32,
    aht_ok: bool,
    bmp_ok: bool,
    seq: u32,
    rssi: i32,
}

impl From<&Reading> for RelayLine {
    fn from(r: &Reading) -> Self {
        Self {
            child_no: r.node_id.0,
            aht_t01: r.aht.t01,
            aht_rh01: r.aht.rh01,
            bmp_t01: r.bmp.t01,
            bmp_p01: r.bmp.p01,
            aht_ok: r.aht.ok,
            bmp_ok: r.bmp.ok,
            seq: r.seq,
            rssi: r.rssi,
        }
    }
}

/// newline-terminated json for one reading
pub fn encode_line(reading: &Reading) -> Vec<u8> {
    // a struct of plain integers and bools always serializes
    let mut line = serde_json::to_vec(&RelayLine::from(reading)).unwrap_or_default();
    line.push(b'\n');
    line
}

pub struct TcpRelay {
    target: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpRelay {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Self {
        Self { target: format!("{}:{}", host, port), connect_timeout, stream: None }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn connect(&self) -> io::Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.target)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }

    /// forward one entry; returns true if a line was written
    pub async fn forward(&mut self, entry: &RegistryEntry) -> bool {
        let Some(reading) = entry.payload.reading() else {
            return false;
        };

        if self.stream.is_none() {
            match self.connect().await {
                Ok(stream) => {
                    info!("[RELAY] connected to {}", self.target);
                    self.stream = Some(stream);
                }
                Err(e) => {
                    warn!("[RELAY] connect to {} failed: {}", self.target, e);
                    return false;
                }
            }
        }
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };

        match stream.write_all(&encode_line(reading)).await {
            Ok(()) => {
                debug!("[RELAY] sent N={} seq={}", reading.node_id, reading.seq);
                true
            }
            Err(e) => {
                warn!("[RELAY] write failed, closing stream: {}", e);
                self.stream = None;
                false
            }
        }
    }

    pub async fn run(
        mut self,
        mut updates: broadcast::Receiver<RegistryEntry>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("[RELAY] forwarding readings to {}", self.target);
        while !*shutdown.borrow() {
            let entry = tokio::select! {
                _ = shutdown.changed() => break,
                event = updates.recv() => match event {
                    Ok(entry) => entry,
                    Err(RecvError::Lagged(n)) => {
                        warn!("[RELAY] fell behind, dropped {} oldest updates", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            self.forward(&entry).await;
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        info!("[RELAY] stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AhtSample, BmpSample, NodeId, NodeState, Payload};
    use std::net::SocketAddr;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn reading(seq: u32) -> Reading {
        Reading {
            node_id: NodeId(1),
            aht: AhtSample { t01: 253, rh01: 482, ok: true },
            bmp: BmpSample { t01: 251, p01: 100845, ok: false },
            seq,
            rssi: -61,
        }
    }

    fn entry(payload: Payload) -> RegistryEntry {
        RegistryEntry {
            node_id: NodeId(1),
            payload,
            source: SocketAddr::from(([192, 168, 4, 11], 50000)),
            first_seen_ms: 0,
            last_seen_ms: 0,
            updates: 1,
            state: NodeState::Active,
        }
    }

    #[test]
    fn test_line_format() {
        let line = encode_line(&reading(7));
        assert_eq!(
            std::str::from_utf8(&line).unwrap(),
            "{\"child_no\":1,\"aht_t01\":253,\"aht_rh01\":482,\"bmp_t01\":251,\"bmp_p01\":100845,\
             \"aht_ok\":true,\"bmp_ok\":false,\"seq\":7,\"rssi\":-61}\n"
        );
    }

    #[tokio::test]
    async fn test_forwards_structured_readings_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut relay = TcpRelay::new("127.0.0.1", port, Duration::from_secs(1));

        assert!(!relay.forward(&entry(Payload::Legacy { text: "x".into() })).await);
        assert!(!relay.is_connected());

        assert!(relay.forward(&entry(Payload::Structured { reading: reading(1) })).await);
        assert!(relay.forward(&entry(Payload::Structured { reading: reading(2) })).await);

        let (conn, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(conn).lines();
        for seq in 1..=2u64 {
            let line = lines.next_line().await.unwrap().unwrap();
            let v: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(v["child_no"], 1);
            assert_eq!(v["seq"], seq);
        }
    }

    #[tokio::test]
    async fn test_unreachable_collector_drops_event() {
        // bind then drop to get a port nobody listens on
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let mut relay = TcpRelay::new("127.0.0.1", port, Duration::from_millis(500));
        assert!(!relay.forward(&entry(Payload::Structured { reading: reading(1) })).await);
        assert!(!relay.is_connected());
    }

    #[tokio::test]
    async fn test_reconnects_after_write_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut relay = TcpRelay::new("127.0.0.1", port, Duration::from_secs(1));

        assert!(relay.forward(&entry(Payload::Structured { reading: reading(1) })).await);
        let (first, _) = listener.accept().await.unwrap();
        drop(first);

        // the peer is gone; writes start failing once the reset comes back
        let mut failed = false;
        for seq in 2..50 {
            if !relay.forward(&entry(Payload::Structured { reading: reading(seq) })).await {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(failed);
        assert!(!relay.is_connected());

        assert!(relay.forward(&entry(Payload::Structured { reading: reading(99) })).await);
        let (second, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(second).lines();
        let v: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(v["seq"], 99);
    }

    #[tokio::test]
    async fn test_run_relays_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let relay = TcpRelay::new("127.0.0.1", port, Duration::from_secs(1));
        let (tx, rx) = broadcast::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(relay.run(rx, stop_rx));

        tx.send(entry(Payload::Structured { reading: reading(5) })).unwrap();
        let (conn, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(conn).lines();
        let v: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(v["seq"], 5);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
