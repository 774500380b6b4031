//! Discovery Event System

use crate::DeviceInfo;
use std::net::SocketAddr;

/// Events emitted by the discovery service
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// First identity received from a device
    DeviceDiscovered {
        info: DeviceInfo,
        /// Address to open the TCP connection to (sender IP, advertised port)
        address: SocketAddr,
    },

    /// A known device announced itself again
    DeviceUpdated { info: DeviceInfo, address: SocketAddr },

    /// A device has not been heard from for the configured duration
    DeviceTimeout { device_id: String },

    /// Discovery service started
    ServiceStarted { port: u16 },

    /// Discovery service stopped
    ServiceStopped,
}

impl DiscoveryEvent {
    /// Check if this is a device discovered event
    pub fn is_device_discovered(&self) -> bool {
        matches!(self, DiscoveryEvent::DeviceDiscovered { .. })
    }

    /// Check if this is a device updated event
    pub fn is_device_updated(&self) -> bool {
        matches!(self, DiscoveryEvent::DeviceUpdated { .. })
    }

    /// Device the event concerns, if any
    pub fn device_id(&self) -> Option<&str> {
        match self {
            DiscoveryEvent::DeviceDiscovered { info, .. }
            | DiscoveryEvent::DeviceUpdated { info, .. } => Some(&info.device_id),
            DiscoveryEvent::DeviceTimeout { device_id } => Some(device_id),
            DiscoveryEvent::ServiceStarted { .. } | DiscoveryEvent::ServiceStopped => None,
        }
    }
}
