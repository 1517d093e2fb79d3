use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// maximum number of sensor nodes the gateway tracks
pub const MAX_NODES: usize = 4;

/// node count limit exposed to collaborators (fixed at compile time)
pub fn node_count_limit() -> usize {
    MAX_NODES
}

/// identifier a sensor node reports as `child_no` / `N=`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u8);

impl NodeId {
    /// true for identifiers in 1..=MAX_NODES
    pub fn is_addressable(self) -> bool {
        (1..=MAX_NODES).contains(&(self.0 as usize))
    }

    /// zero-based position for per-node arrays (LEDs, api children)
    pub fn index(self) -> Option<usize> {
        self.is_addressable().then(|| self.0 as usize - 1)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// aht temperature / humidity sensor sub-reading
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AhtSample {
    /// temperature in tenths of a degree celsius
    pub t01: i16,
    /// relative humidity in tenths of a percent
    pub rh01: u16,
    pub ok: bool,
}

/// bmp temperature / pressure sensor sub-reading
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BmpSample {
    /// temperature in tenths of a degree celsius
    pub t01: i16,
    /// pressure in tenths of a hPa
    pub p01: u32,
    pub ok: bool,
}

/// one decoded structured telemetry sample
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub node_id: NodeId,
    pub aht: AhtSample,
    pub bmp: BmpSample,
    /// sender-assigned counter
    pub seq: u32,
    /// signal strength in dBm, 0 when the sender did not report it
    pub rssi: i32,
}

impl Reading {
    /// both sensors reported a valid measurement
    pub fn all_ok(&self) -> bool {
        self.aht.ok && self.bmp.ok
    }
}

/// latest data stored for a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum Payload {
    Structured { reading: Reading },
    /// text after the legacy "N=<n>," prefix, verbatim
    Legacy { text: String },
}

impl Payload {
    pub fn reading(&self) -> Option<&Reading> {
        match self {
            Payload::Structured { reading } => Some(reading),
            Payload::Legacy { .. } => None,
        }
    }
}

/// liveness of a registry slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Active,
    Stale,
}

/// copy of one occupied registry slot
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegistryEntry {
    pub node_id: NodeId,
    pub payload: Payload,
    /// address the latest datagram came from
    pub source: SocketAddr,
    /// monotonic ms of the first accepted datagram
    pub first_seen_ms: u64,
    /// monotonic ms of the latest accepted datagram
    pub last_seen_ms: u64,
    /// number of accepted datagrams
    pub updates: u64,
    pub state: NodeState,
}

impl RegistryEntry {
    pub fn is_active(&self) -> bool {
        self.state == NodeState::Active
    }

    /// ms since the last accepted datagram
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen_ms)
    }
}

/// point-in-time copy of the whole table, element (id - 1) holds node id
pub type RegistrySnapshot = [Option<RegistryEntry>; MAX_NODES];
