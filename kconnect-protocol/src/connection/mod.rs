//! Device Connections
//!
//! One session per connected device. The session owns the stream, frames it
//! with [`crate::codec::PacketCodec`] and reports everything it reads as
//! [`ConnectionEvent`]s.

mod events;
mod manager;
mod recovery;
mod session;

pub use events::ConnectionEvent;
pub use manager::{ConnectionConfig, ConnectionManager};
pub use recovery::{
    ReconnectionStrategy, INITIAL_RECONNECT_DELAY, MAX_CONNECT_ATTEMPTS, MAX_RECONNECT_DELAY,
};

use crate::{Packet, Result};
use async_trait::async_trait;

/// Somewhere packets for a device can be sent
#[async_trait]
pub trait PacketSink: Send + Sync {
    /// Queue `packet` for `device_id`
    ///
    /// Fails with `NotConnected` when there is no session to the device.
    async fn send_packet(&self, device_id: &str, packet: &Packet) -> Result<()>;
}
