//! KDE Connect Protocol Implementation
//!
//! A pure Rust device-communication core speaking KDE Connect protocol
//! version 7: UDP discovery, TLS sessions, certificate pairing and plugin
//! dispatch for remote input, media control, file sharing and more.
//!
//! Hosts use [`service::ConnectService`] through the
//! [`service::DeviceCommunicationService`] trait. The lower layers are public
//! for hosts that need to compose them differently.
//!
//! | layer | module |
//! |---|---|
//! | packets and framing | [`packet`], [`codec`] |
//! | discovery | [`discovery`] |
//! | TLS sessions and payloads | [`transport`], [`connection`] |
//! | trust | [`pairing`] |
//! | known devices | [`device`] |
//! | capabilities | [`plugins`] |
//! | host boundary | [`service`] |

pub mod codec;
pub mod connection;
pub mod device;
pub mod discovery;
pub mod packet;
pub mod pairing;
pub mod plugins;
pub mod service;
pub mod transport;

mod error;
pub use codec::PacketCodec;
pub use device::{ConnectionState, Device, DeviceManager};
pub use discovery::{DeviceInfo, DeviceType};
pub use error::{DecodeError, PairingError, ProtocolError, Result};
pub use packet::Packet;
pub use pairing::{CertificateInfo, PairingStatus};
pub use service::{ConnectService, DeviceCommunicationService, ServiceConfig, ServiceEvent};

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 7;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_carries_protocol_version() {
        let info = DeviceInfo::with_id("desktop", "Desktop", DeviceType::Desktop, 1716);
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert_eq!(
            info.to_identity_packet().body["protocolVersion"],
            PROTOCOL_VERSION
        );
    }
}
