//! Error types for the ingestion core
//!
//! None of these ever leave the ingest loop or the transport guardian as a
//! fatal condition; they are matched on, logged and turned into state flags.

use crate::domain::NodeId;

/// Payload could not be turned into a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Empty datagram
    #[error("empty payload")]
    Empty,

    /// JSON parsed but a required key is absent (or the document is not an object)
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// JSON key present but not convertible to the expected type
    #[error("invalid value for field: {0}")]
    InvalidField(&'static str),

    /// Numeric value outside the range of its field
    #[error("value out of range for field {field}: {value}")]
    OutOfRange {
        /// Field name on the wire
        field: &'static str,
        /// Offending value as received
        value: i64,
    },

    /// Legacy "N=<n>," prefix malformed
    #[error("malformed legacy frame: {0}")]
    MalformedLegacy(&'static str),

    /// Payload is neither JSON nor legacy text
    #[error("unknown payload format")]
    UnknownFormat,
}

/// Node table failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Identifier with no slot in the node table
    #[error("no slot for node {node_id}, node table holds 1..=4")]
    CapacityExceeded {
        /// Rejected identifier
        node_id: NodeId,
    },
}

/// Socket failures surfaced by the transport guardian
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No usable socket right now
    #[error("transport not ready")]
    NotReady,

    /// Reopening the socket on the fixed port failed
    #[error("failed to recreate socket on port {port}: {source}")]
    RecreateFailed {
        /// Port the socket should be bound to
        port: u16,
        /// Underlying bind error
        #[source]
        source: std::io::Error,
    },

    /// Single receive failed
    #[error("receive failed: {0}")]
    Receive(#[source] std::io::Error),

    /// Single send failed
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
}
