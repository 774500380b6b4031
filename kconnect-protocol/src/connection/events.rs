//! Connection Events
//!
//! Events emitted by the connection manager for device connectivity changes.

use crate::{DeviceInfo, Packet};
use std::net::SocketAddr;

/// Connection event types
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A session has been established with a device
    Connected {
        /// Identity the device announced
        device_info: DeviceInfo,
        remote_addr: SocketAddr,
        /// DER certificate presented during the TLS handshake
        peer_certificate: Vec<u8>,
    },

    /// A session ended
    Disconnected {
        device_id: String,
        /// Reason for disconnection (if known)
        reason: Option<String>,
    },

    /// A packet has been received from a device
    ///
    /// Packets of one device are emitted in the order they were read.
    PacketReceived { device_id: String, packet: Packet },

    /// Connecting, handshaking or a session failed
    ConnectionError {
        /// Device ID (if known)
        device_id: Option<String>,
        message: String,
    },

    /// Connection manager started
    ManagerStarted {
        /// Local port listening on
        port: u16,
    },

    /// Connection manager stopped
    ManagerStopped,
}

impl ConnectionEvent {
    /// Device this event concerns, if any
    pub fn device_id(&self) -> Option<&str> {
        match self {
            ConnectionEvent::Connected { device_info, .. } => Some(&device_info.device_id),
            ConnectionEvent::Disconnected { device_id, .. }
            | ConnectionEvent::PacketReceived { device_id, .. } => Some(device_id),
            ConnectionEvent::ConnectionError { device_id, .. } => device_id.as_deref(),
            ConnectionEvent::ManagerStarted { .. } | ConnectionEvent::ManagerStopped => None,
        }
    }
}
