//! Pairing Event System

use crate::PairingStatus;

/// Events emitted by the pairing service
#[derive(Debug, Clone, PartialEq)]
pub enum PairingEvent {
    /// We sent a pairing request
    RequestSent {
        device_id: String,
        /// Key to compare with the one shown on the peer
        verification_key: Option<String>,
    },

    /// A device asked to pair; the host must accept or reject
    RequestReceived {
        device_id: String,
        device_name: String,
        verification_key: Option<String>,
    },

    /// Pairing completed, by our accept or the peer's
    PairingAccepted {
        device_id: String,
        device_name: String,
        certificate_fingerprint: String,
    },

    /// The handshake ended without pairing
    PairingRejected {
        device_id: String,
        reason: Option<String>,
    },

    /// A device's pairing status changed
    StatusChanged {
        device_id: String,
        status: PairingStatus,
    },

    /// A paired device was unpaired, from either side
    DeviceUnpaired { device_id: String },

    /// A pending request expired
    PairingTimeout { device_id: String },

    /// Pairing could not proceed
    Error {
        device_id: Option<String>,
        message: String,
    },
}

impl PairingEvent {
    /// Check if this is a request received event
    pub fn is_request_received(&self) -> bool {
        matches!(self, PairingEvent::RequestReceived { .. })
    }

    /// Check if this is a pairing accepted event
    pub fn is_pairing_accepted(&self) -> bool {
        matches!(self, PairingEvent::PairingAccepted { .. })
    }

    /// Check if this is a pairing rejected event
    pub fn is_pairing_rejected(&self) -> bool {
        matches!(self, PairingEvent::PairingRejected { .. })
    }

    /// Get device ID if this event is device-related
    pub fn device_id(&self) -> Option<&str> {
        match self {
            PairingEvent::RequestSent { device_id, .. }
            | PairingEvent::RequestReceived { device_id, .. }
            | PairingEvent::PairingAccepted { device_id, .. }
            | PairingEvent::PairingRejected { device_id, .. }
            | PairingEvent::StatusChanged { device_id, .. }
            | PairingEvent::DeviceUnpaired { device_id }
            | PairingEvent::PairingTimeout { device_id } => Some(device_id),
            PairingEvent::Error { device_id, .. } => device_id.as_deref(),
        }
    }
}
