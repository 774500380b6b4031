//! Service Events

use crate::pairing::PairingEvent;
use crate::plugins::PluginEvent;
use crate::Device;

/// Everything the host hears from the service
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Listening for devices
    Started { tcp_port: u16 },

    Stopped,

    /// A device announced itself for the first time
    DeviceDiscovered { device: Device },

    /// A session to the device is up
    DeviceConnected { device: Device },

    DeviceDisconnected {
        device_id: String,
        reason: Option<String>,
    },

    /// An unpaired device stopped announcing itself and was forgotten
    DeviceLost { device_id: String },

    /// Connecting or handshaking failed
    ConnectionFailed {
        device_id: Option<String>,
        reason: String,
    },

    Pairing(PairingEvent),

    /// Something a device's plugin wants the host to know or do
    Plugin {
        device_id: String,
        event: PluginEvent,
    },
}

impl ServiceEvent {
    /// Device this event concerns, if any
    pub fn device_id(&self) -> Option<&str> {
        match self {
            ServiceEvent::DeviceDiscovered { device } | ServiceEvent::DeviceConnected { device } => {
                Some(device.id())
            }
            ServiceEvent::DeviceDisconnected { device_id, .. }
            | ServiceEvent::DeviceLost { device_id }
            | ServiceEvent::Plugin { device_id, .. } => Some(device_id),
            ServiceEvent::ConnectionFailed { device_id, .. } => device_id.as_deref(),
            ServiceEvent::Pairing(event) => event.device_id(),
            ServiceEvent::Started { .. } | ServiceEvent::Stopped => None,
        }
    }
}
