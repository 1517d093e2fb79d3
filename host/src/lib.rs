//! telemetry ingestion and liveness core of a 4-node sensor gateway
//!
//! sensor nodes push small datagrams (json or legacy `N=<n>,...` text) to a
//! fixed udp port. the gateway decodes them, keeps the latest reading per node
//! in a fixed table, marks silent nodes STALE and fans updates out to the http
//! api, a tcp relay and per-node indicator leds.

pub mod api;
pub mod clock;
pub mod config;
pub mod decoder;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod hal;
pub mod indicator;
pub mod ingest;
pub mod notify;
pub mod registry;
pub mod relay;
pub mod sweeper;
pub mod transport;

pub use gateway::Gateway;
