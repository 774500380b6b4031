//! KDE Connect Network Packet
//!
//! Packets are JSON objects terminated by a single newline.
//!
//! ## Packet Structure
//!
//! - `id`: millisecond timestamp, strictly increasing within this process
//! - `type`: packet type in format `kdeconnect.<plugin>[.<action>]`
//! - `body`: plugin-specific parameters
//! - `payloadSize`: (optional) size of an accompanying payload in bytes
//! - `payloadTransferInfo`: (optional) where to fetch that payload
//!
//! Framing and incremental decoding live in [`crate::codec`].

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Identity announcement, sent over UDP and before TLS
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";

/// Pairing request, response and unpair
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

/// Represents a KDE Connect network packet
///
/// # Examples
///
/// ```
/// use kconnect_protocol::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new("kdeconnect.ping", json!({ "message": "hi" }));
/// let bytes = packet.to_bytes().unwrap();
///
/// let parsed = Packet::from_bytes(&bytes).unwrap();
/// assert_eq!(parsed, packet);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// UNIX timestamp in milliseconds
    ///
    /// Some clients send this as a string.
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    /// Packet type, e.g. `kdeconnect.mpris.request`
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Plugin-specific parameters
    #[serde(default)]
    pub body: Value,

    /// Optional payload size in bytes (-1 for indefinite streams)
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Optional payload transfer negotiation info
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,
}

impl Packet {
    /// Creates a new packet with the specified type and body
    ///
    /// The id is the current time in milliseconds, bumped if needed so that
    /// ids handed out by this process never repeat or go backwards.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self::with_id(next_packet_id(), packet_type, body)
    }

    /// Create a packet with an explicit id
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Serialize packet to bytes with newline terminator
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self)?;
        let mut bytes = json.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize a single packet
    ///
    /// Accepts data with or without a trailing `\n` / `\r\n`; UDP datagrams
    /// from some clients omit it. Stream data goes through
    /// [`crate::codec::PacketCodec`] instead.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        serde_json::from_slice(trimmed).map_err(|e| {
            ProtocolError::InvalidPacket(format!("Failed to deserialize packet: {}", e))
        })
    }

    /// Builder pattern: Set payload size
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Builder pattern: advertise a payload served on `port`
    pub fn with_payload_port(mut self, port: u16) -> Self {
        let mut info = HashMap::new();
        info.insert("port".to_string(), Value::from(port));
        self.payload_transfer_info = Some(info);
        self
    }

    /// Builder pattern: Add a key-value pair to the body
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Check if packet is of a specific type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Deserialize the whole body into a typed struct
    ///
    /// Maps failures to `InvalidPacket` so plugins can report a malformed
    /// body without it looking like a transport problem.
    pub fn parse_body<T>(&self) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_value(self.body.clone()).map_err(|e| {
            ProtocolError::InvalidPacket(format!(
                "Invalid body for '{}': {}",
                self.packet_type, e
            ))
        })
    }

    /// Port of the payload side-stream, if the packet advertises one
    pub fn payload_port(&self) -> Option<u16> {
        self.payload_transfer_info
            .as_ref()
            .and_then(|info| info.get("port"))
            .and_then(|port| port.as_u64())
            .and_then(|port| u16::try_from(port).ok())
    }
}

/// Custom deserializer for the `id` field to handle both string and number formats
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

/// Always serialize the id as a number
fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Generate current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

static LAST_PACKET_ID: AtomicI64 = AtomicI64::new(0);

/// Next packet id: the current timestamp, or last id + 1 if the clock has
/// not advanced since.
pub fn next_packet_id() -> i64 {
    let now = current_timestamp();
    let mut last = LAST_PACKET_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_PACKET_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}
