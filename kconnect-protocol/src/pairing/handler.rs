//! Pairing state and packets
//!
//! A device is in exactly one [`PairingStatus`]. While a handshake is in
//! flight there is one [`PairingRequest`] for it, which expires after
//! [`PAIRING_TIMEOUT`].

use crate::packet::PACKET_TYPE_PAIR;
use crate::{Packet, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};

/// Default pairing timeout (30 seconds per protocol specification)
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Pairing status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Unpaired,
    /// We asked, waiting for the peer's answer
    RequestedOutgoing,
    /// The peer asked, waiting for the host's decision
    RequestedIncoming,
    Paired,
}

impl PairingStatus {
    /// Whether a handshake is in progress
    pub fn is_requested(&self) -> bool {
        matches!(
            self,
            PairingStatus::RequestedOutgoing | PairingStatus::RequestedIncoming
        )
    }
}

/// Who started a pairing handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingDirection {
    /// The peer asked us
    Incoming,
    /// We asked the peer
    Outgoing,
}

impl PairingDirection {
    /// Status a device has while a request in this direction is pending
    pub fn status(&self) -> PairingStatus {
        match self {
            PairingDirection::Incoming => PairingStatus::RequestedIncoming,
            PairingDirection::Outgoing => PairingStatus::RequestedOutgoing,
        }
    }
}

/// A pending pairing handshake
#[derive(Debug, Clone)]
pub struct PairingRequest {
    pub device_id: String,
    pub direction: PairingDirection,
    pub started_at: Instant,
    pub expires_at: Instant,
}

impl PairingRequest {
    /// Start a request now that expires after `timeout`
    pub fn new(device_id: impl Into<String>, direction: PairingDirection, timeout: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            device_id: device_id.into(),
            direction,
            started_at,
            expires_at: started_at + timeout,
        }
    }

    /// Whether the request outlived its expiry
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left before expiry
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Body of a `kdeconnect.pair` packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPacket {
    /// `true` requests or accepts; `false` rejects, cancels or unpairs
    pub pair: bool,
}

impl PairingPacket {
    /// Create a pairing request packet
    pub fn request() -> Packet {
        Self::build(true)
    }

    /// Create a pairing accept response packet
    pub fn accept() -> Packet {
        Self::build(true)
    }

    /// Create a pairing reject response packet
    pub fn reject() -> Packet {
        Self::build(false)
    }

    /// Create an unpair packet
    pub fn unpair() -> Packet {
        Self::build(false)
    }

    fn build(pair: bool) -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": pair }))
    }

    /// Parse a pairing packet
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_PAIR) {
            return Err(ProtocolError::InvalidPacket(format!(
                "Expected pairing packet, got {}",
                packet.packet_type
            )));
        }

        packet.parse_body()
    }
}
