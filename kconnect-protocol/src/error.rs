//! Error handling for the KConnect protocol core
//!
//! This module provides the error type shared by every protocol operation.
//! Errors are converted from underlying library errors using `thiserror`.
//!
//! ## Error Categories
//!
//! ### Transport
//! `Io`, `Tls`, `ConnectionFailed`, `Timeout`, `NotConnected`.
//! Connection attempts are retried with backoff before `ConnectionFailed`
//! reaches the host.
//!
//! ### Decoding
//! [`DecodeError`] covers framing problems on a single stream. A malformed
//! frame is dropped, a truncated frame stays buffered and an unknown type is
//! forwarded to the dispatcher where it is ignored.
//!
//! ### Pairing
//! [`PairingError`] covers handshake misuse and outcomes. All variants are
//! recoverable and only concern the device they were raised for.
//!
//! ### Authorization
//! `Unauthorized` is raised when a capability packet arrives from a device that
//! is not paired. The packet is dropped and the device keeps its session.
//!
//! ## Example
//!
//! ```rust
//! use kconnect_protocol::{PairingError, ProtocolError};
//!
//! let error = ProtocolError::from(PairingError::NotPending("phone".to_string()));
//! assert!(error.is_recoverable());
//! assert_eq!(error.to_string(), "Pairing error: No pairing request pending for phone");
//! ```

use crate::Packet;
use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Failures produced while turning bytes into packets
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The frame is not valid JSON or lacks the packet structure
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// No frame delimiter yet; more bytes are needed
    #[error("Truncated frame: {buffered} bytes buffered without delimiter")]
    TruncatedFrame { buffered: usize },

    /// Well-formed packet whose type tag is not recognised
    ///
    /// The decoded packet is carried along so it can still be forwarded.
    #[error("Unknown packet type: {}", packet.packet_type)]
    UnknownType { packet: Box<Packet> },
}

/// Pairing handshake failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    /// A pairing request for this device is already outstanding
    #[error("Pairing already in progress with {0}")]
    AlreadyPairing(String),

    /// The device is already paired
    #[error("Device {0} is already paired")]
    AlreadyPaired(String),

    /// No request is waiting for a decision
    #[error("No pairing request pending for {0}")]
    NotPending(String),

    /// The pending request outlived its expiry
    #[error("Pairing request for {0} expired")]
    Expired(String),

    /// The peer refused the request
    #[error("Pairing rejected by {0}")]
    Rejected(String),
}

/// Errors that can occur during protocol operations
///
/// # Examples
///
/// ```rust
/// use kconnect_protocol::ProtocolError;
///
/// let error = ProtocolError::DeviceNotFound("device-123".to_string());
/// assert_eq!(error.to_string(), "Device not found: device-123");
///
/// let error = ProtocolError::NotPaired;
/// assert_eq!(error.to_string(), "Not paired");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS handshake or record layer error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate generation error
    #[error("Certificate error: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    /// Stored or presented certificate could not be used
    #[error("Certificate validation error: {0}")]
    CertificateValidation(String),

    /// Framing error on a packet stream
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Pairing handshake error
    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    /// Capability packet from a device that is not paired
    #[error("Unauthorized packet '{packet_type}' from unpaired device {device_id}")]
    Unauthorized {
        device_id: String,
        packet_type: String,
    },

    /// Device not found in registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation requires a paired device
    #[error("Not paired")]
    NotPaired,

    /// No open session to the device
    #[error("Not connected to device {0}")]
    NotConnected(String),

    /// Connection could not be established after retrying
    #[error("Connection to {device_id} failed after {attempts} attempts: {reason}")]
    ConnectionFailed {
        device_id: String,
        attempts: u32,
        reason: String,
    },

    /// Invalid or malformed packet body
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Plugin-specific error
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Operation timed out
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Connection refused by the remote device
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Discovery socket or mDNS daemon failure
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Packet exceeds the maximum frame size
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific variant when possible
    ///
    /// ```rust
    /// use kconnect_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "connection timeout");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to device");
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Whether the failed operation may succeed if attempted again
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProtocolError::Io(_)
            | ProtocolError::Timeout(_)
            | ProtocolError::ConnectionRefused(_)
            | ProtocolError::ConnectionFailed { .. }
            | ProtocolError::NotConnected(_)
            | ProtocolError::Discovery(_)
            | ProtocolError::Pairing(_)
            | ProtocolError::Unauthorized { .. }
            | ProtocolError::Decode(_) => true,
            ProtocolError::Json(_)
            | ProtocolError::Tls(_)
            | ProtocolError::Certificate(_)
            | ProtocolError::CertificateValidation(_)
            | ProtocolError::DeviceNotFound(_)
            | ProtocolError::NotPaired
            | ProtocolError::InvalidPacket(_)
            | ProtocolError::Plugin(_)
            | ProtocolError::Configuration(_)
            | ProtocolError::PacketSizeExceeded(_, _) => false,
        }
    }

    /// Whether the user has to do something (pair, re-pair, fix config)
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotPaired
                | ProtocolError::Unauthorized { .. }
                | ProtocolError::CertificateValidation(_)
                | ProtocolError::Configuration(_)
                | ProtocolError::Pairing(PairingError::Rejected(_))
                | ProtocolError::Pairing(PairingError::Expired(_))
        )
    }

    /// Short message suitable for showing in a host UI
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotPaired | ProtocolError::Unauthorized { .. } => {
                "Device is not paired. Pair it first.".to_string()
            }
            ProtocolError::DeviceNotFound(id) => format!("Device {} is not known.", id),
            ProtocolError::NotConnected(id) => format!("Device {} is not reachable.", id),
            ProtocolError::ConnectionFailed { device_id, .. } => {
                format!("Could not connect to {}. Check the network.", device_id)
            }
            ProtocolError::Pairing(PairingError::Rejected(id)) => {
                format!("{} declined the pairing request.", id)
            }
            ProtocolError::Pairing(PairingError::Expired(id)) => {
                format!("Pairing with {} timed out.", id)
            }
            ProtocolError::CertificateValidation(e) => {
                format!("Certificate error: {}. You may need to re-pair.", e)
            }
            other => other.to_string(),
        }
    }
}
