//! ==============================================================================
//! decoder.rs - telemetry frame decoder
//! ==============================================================================
//!
//! purpose:
//!     turns one received datagram into a frame. pure functions, no shared state.
//!
//! formats (tried in this order):
//!     1. structured - a json object sent by current node firmware
//!        {"child_no":1,"aht_t01":253,"aht_rh01":482,"bmp_t01":251,
//!         "bmp_p01":100845,"aht_ok":true,"bmp_ok":true,"seq":7,"rssi":-61}
//!     2. legacy     - "N=<1-4>,<opaque>" from older firmware. only tried when
//!        the payload does not parse as json at all.
//!
//! relationships:
//!     - used by: ingest.rs (one decode per received datagram)
//!     - produces: domain.rs (Reading / Payload)
//!
//! ==============================================================================

use crate::domain::{AhtSample, BmpSample, NodeId, Payload, Reading, MAX_NODES};
use crate::error::DecodeError;
use serde_json::{Map, Value};

/// keys every structured frame must carry
const REQUIRED_KEYS: [&str; 8] = [
    "child_no", "aht_t01", "aht_rh01", "bmp_t01", "bmp_p01", "aht_ok", "bmp_ok", "seq",
];

/// longest preview written to the log for a rejected payload
const PREVIEW_LIMIT: usize = 96;

/// successfully decoded datagram
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Structured(Reading),
    Legacy { node_id: NodeId, text: String },
}

impl Frame {
    /// split into the registry key and the stored payload
    pub fn into_parts(self) -> (NodeId, Payload) {
        match self {
            Frame::Structured(reading) => (reading.node_id, Payload::Structured { reading }),
            Frame::Legacy { node_id, text } => (node_id, Payload::Legacy { text }),
        }
    }
}

/// decode one datagram payload
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    // node firmware sometimes sends the c-string terminator too
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    let bytes = &bytes[..end];
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    match serde_json::from_slice::<Value>(bytes) {
        Ok(doc) => decode_structured(&doc).map(Frame::Structured),
        Err(_) => decode_legacy(bytes),
    }
}

/// decode a parsed json document
pub fn decode_structured(doc: &Value) -> Result<Reading, DecodeError> {
    let obj = doc.as_object().ok_or(DecodeError::MissingField(REQUIRED_KEYS[0]))?;
    if let Some(missing) = REQUIRED_KEYS.iter().find(|k| !obj.contains_key(**k)) {
        return Err(DecodeError::MissingField(*missing));
    }

    let child_no: u8 = int_field(obj, "child_no")?;
    let node_id = NodeId(child_no);
    if !node_id.is_addressable() {
        return Err(DecodeError::OutOfRange { field: "child_no", value: child_no as i64 });
    }

    let rssi = match obj.get("rssi") {
        None | Some(Value::Null) => 0,
        Some(_) => int_field(obj, "rssi")?,
    };

    Ok(Reading {
        node_id,
        aht: AhtSample {
            t01: int_field(obj, "aht_t01")?,
            rh01: int_field(obj, "aht_rh01")?,
            ok: bool_field(obj, "aht_ok")?,
        },
        bmp: BmpSample {
            t01: int_field(obj, "bmp_t01")?,
            p01: int_field(obj, "bmp_p01")?,
            ok: bool_field(obj, "bmp_ok")?,
        },
        seq: int_field(obj, "seq")?,
        rssi,
    })
}

/// decode "N=<digits>,<opaque>"
pub fn decode_legacy(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let rest = bytes.strip_prefix(b"N=").ok_or(DecodeError::UnknownFormat)?;

    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return Err(DecodeError::MalformedLegacy("missing node number"));
    }
    if rest.get(digits) != Some(&b',') {
        return Err(DecodeError::MalformedLegacy("expected ',' after node number"));
    }

    // bail as soon as the number leaves the node range, long digit runs can't overflow
    let mut number: usize = 0;
    for d in &rest[..digits] {
        number = number * 10 + (d - b'0') as usize;
        if number > MAX_NODES {
            return Err(DecodeError::OutOfRange { field: "N", value: number as i64 });
        }
    }
    if number == 0 {
        return Err(DecodeError::OutOfRange { field: "N", value: 0 });
    }

    let text = std::str::from_utf8(&rest[digits + 1..])
        .map_err(|_| DecodeError::MalformedLegacy("payload is not utf-8"))?;

    Ok(Frame::Legacy { node_id: NodeId(number as u8), text: text.to_string() })
}

/// printable form of a payload for log lines (text if utf-8, hex otherwise)
pub fn preview(bytes: &[u8]) -> String {
    let cut = &bytes[..bytes.len().min(PREVIEW_LIMIT)];
    let mut out = match std::str::from_utf8(cut) {
        Ok(text) => text.escape_debug().to_string(),
        Err(_) => format!("0x{}", hex::encode(cut)),
    };
    if bytes.len() > PREVIEW_LIMIT {
        out.push_str("...");
    }
    out
}

fn int_field<T: TryFrom<i64>>(obj: &Map<String, Value>, key: &'static str) -> Result<T, DecodeError> {
    let value = obj.get(key).ok_or(DecodeError::MissingField(key))?;
    let n = match value.as_i64() {
        Some(n) => n,
        // u64 above i64::MAX
        None if value.is_u64() => {
            return Err(DecodeError::OutOfRange { field: key, value: i64::MAX });
        }
        None => return Err(DecodeError::InvalidField(key)),
    };
    T::try_from(n).map_err(|_| DecodeError::OutOfRange { field: key, value: n })
}

fn bool_field(obj: &Map<String, Value>, key: &'static str) -> Result<bool, DecodeError> {
    match obj.get(key) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(v) => match v.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(DecodeError::InvalidField(key)),
        },
        None => Err(DecodeError::MissingField(key)),
    }
}
