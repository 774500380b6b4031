//! Device Discovery
//!
//! Devices announce themselves by broadcasting identity packets on UDP port
//! 1716. The same identity packet is sent as the first line of every TCP
//! connection, before TLS starts.
//!
//! ## Identity Packet Format
//!
//! Identity packets (`kdeconnect.identity`) contain:
//! - `deviceId`: stable identifier (UUIDv4 with underscores for our own id)
//! - `deviceName`: 1-32 character device name
//! - `deviceType`: desktop, laptop, phone, tablet, or tv
//! - `protocolVersion`: protocol version (currently 7)
//! - `incomingCapabilities`: packet types this device can receive
//! - `outgoingCapabilities`: packet types this device can send
//! - `tcpPort`: TCP port for establishing connections
//!
//! ## Port Configuration
//!
//! - Primary port: UDP 1716
//! - Fallback range: 1714-1764

mod events;
mod mdns;
mod service;

pub use events::DiscoveryEvent;
pub use mdns::{MdnsDiscovery, MDNS_SERVICE_TYPE};
pub use service::{
    DiscoveryConfig, DiscoveryService, DEFAULT_BROADCAST_INTERVAL, DEFAULT_DEVICE_TIMEOUT,
};

use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::Ipv4Addr;
use tracing::warn;
use uuid::Uuid;

/// Default UDP/TCP port
pub const DISCOVERY_PORT: u16 = 1716;

/// Port range for fallback when primary port is unavailable
pub const PORT_RANGE_START: u16 = 1714;
pub const PORT_RANGE_END: u16 = 1764;

/// Broadcast address for IPv4
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Device types supported by KDE Connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    #[serde(alias = "smartphone")]
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    /// Convert device type to string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }

    /// Parse the wire name; older Android builds say "smartphone"
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "desktop" => Some(DeviceType::Desktop),
            "laptop" => Some(DeviceType::Laptop),
            "phone" | "smartphone" => Some(DeviceType::Phone),
            "tablet" => Some(DeviceType::Tablet),
            "tv" => Some(DeviceType::Tv),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an identity packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Unique device identifier
    pub device_id: String,

    /// Human-readable device name (1-32 characters)
    pub device_name: String,

    /// Type of device
    pub device_type: DeviceType,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,

    /// Packet types this device accepts
    #[serde(default)]
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device sends
    #[serde(default)]
    pub outgoing_capabilities: Vec<String>,

    /// Where the device accepts TCP connections
    pub tcp_port: u16,
}

impl DeviceInfo {
    /// Create a new DeviceInfo with a freshly generated id
    ///
    /// # Examples
    ///
    /// ```
    /// use kconnect_protocol::{DeviceInfo, DeviceType};
    ///
    /// let info = DeviceInfo::new("My Computer", DeviceType::Desktop, 1716);
    /// assert_eq!(info.device_id.matches('_').count(), 4);
    /// ```
    pub fn new(device_name: impl Into<String>, device_type: DeviceType, tcp_port: u16) -> Self {
        Self::with_id(Self::generate_device_id(), device_name, device_type, tcp_port)
    }

    /// Generate a UUIDv4 device ID with underscores
    pub fn generate_device_id() -> String {
        Uuid::new_v4().to_string().replace('-', "_")
    }

    /// Create a DeviceInfo with explicit device ID
    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        let device_name = device_name.into();
        if device_name.is_empty() || device_name.chars().count() > 32 {
            warn!(
                "Device name should be 1-32 characters, got: {}",
                device_name
            );
        }

        Self {
            device_id: device_id.into(),
            device_name,
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
        }
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    /// Set all incoming capabilities at once
    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = capabilities;
        self
    }

    /// Set all outgoing capabilities at once
    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = capabilities;
        self
    }

    /// Builder: change the advertised TCP port
    pub fn with_tcp_port(mut self, tcp_port: u16) -> Self {
        self.tcp_port = tcp_port;
        self
    }

    /// Convert DeviceInfo to an identity packet
    pub fn to_identity_packet(&self) -> Packet {
        Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_str(),
                "protocolVersion": self.protocol_version,
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
                "tcpPort": self.tcp_port,
            }),
        )
    }

    /// Parse DeviceInfo from an identity packet
    ///
    /// Capabilities default to empty and `protocolVersion` to ours when absent.
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::InvalidPacket(format!(
                "Expected identity packet, got {}",
                packet.packet_type
            )));
        }

        let info: Self = packet.parse_body()?;
        if info.device_id.is_empty() {
            return Err(ProtocolError::InvalidPacket("Empty deviceId".to_string()));
        }
        Ok(info)
    }
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}
