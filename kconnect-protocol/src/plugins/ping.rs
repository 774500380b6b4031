//! Ping Plugin
//!
//! Simple connectivity testing plugin that sends and receives ping packets.
//!
//! ## Protocol
//!
//! **Packet Type**: `kdeconnect.ping`
//!
//! **Capabilities**:
//! - Incoming: `kdeconnect.ping` - Can receive pings
//! - Outgoing: `kdeconnect.ping` - Can send pings
//!
//! ## Packet Format
//!
//! ```json
//! {
//!     "id": 1234567890,
//!     "type": "kdeconnect.ping",
//!     "body": {
//!         "message": "Optional message"
//!     }
//! }
//! ```
//!
//! The `message` field is optional. If omitted, the packet body is empty.
//! Pings are fire-and-forget; no response is sent.

use super::{capability_list, Plugin, PluginContext, PluginEvent, PluginFactory};
use crate::{Device, Packet, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

pub const PACKET_TYPE_PING: &str = "kdeconnect.ping";

pub const INCOMING_CAPABILITIES: &[&str] = &[PACKET_TYPE_PING];
pub const OUTGOING_CAPABILITIES: &[&str] = &[PACKET_TYPE_PING];

#[derive(Debug, Default, Deserialize)]
struct PingBody {
    message: Option<String>,
}

/// Create a ping packet with an optional message
///
/// # Example
///
/// ```rust
/// use kconnect_protocol::plugins::ping::create_ping;
///
/// let packet = create_ping(Some("Hello!".to_string()));
/// assert_eq!(packet.packet_type, "kdeconnect.ping");
/// assert_eq!(packet.body["message"], "Hello!");
///
/// let packet = create_ping(None);
/// assert!(packet.body.as_object().unwrap().is_empty());
/// ```
pub fn create_ping(message: Option<String>) -> Packet {
    let body = match message {
        Some(msg) => json!({ "message": msg }),
        None => json!({}),
    };

    Packet::new(PACKET_TYPE_PING, body)
}

/// Ping plugin for connectivity testing
///
/// Counts received pings and reports each one to the host.
#[derive(Debug, Default)]
pub struct PingPlugin {
    pings_received: AtomicU64,
}

impl PingPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of pings received
    pub fn pings_received(&self) -> u64 {
        self.pings_received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    async fn stop(&mut self) -> Result<()> {
        debug!("Ping plugin stopped - received: {}", self.pings_received());
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        device: &Device,
        context: &PluginContext,
    ) -> Result<()> {
        let body: PingBody = packet.parse_body()?;
        self.pings_received.fetch_add(1, Ordering::Relaxed);

        match body.message.as_deref() {
            Some(message) if !message.is_empty() => {
                info!("Received ping from {} ({}): {}", device.name(), device.id(), message)
            }
            _ => info!("Received ping from {} ({})", device.name(), device.id()),
        }

        context.emit(PluginEvent::PingReceived {
            message: body.message,
        });
        Ok(())
    }
}

/// Factory for creating PingPlugin instances
#[derive(Debug, Clone, Copy)]
pub struct PingPluginFactory;

impl PluginFactory for PingPluginFactory {
    fn name(&self) -> &str {
        "ping"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PingPlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::harness;

    #[test]
    fn test_plugin_creation() {
        let plugin = PingPlugin::new();
        assert_eq!(plugin.name(), "ping");
        assert_eq!(plugin.pings_received(), 0);
        assert_eq!(plugin.incoming_capabilities(), vec!["kdeconnect.ping"]);
    }

    #[tokio::test]
    async fn test_handle_ping_with_message() {
        let mut harness = harness();
        let mut plugin = PingPlugin::new();

        let packet = create_ping(Some("Hello!".to_string()));
        plugin
            .handle_packet(&packet, &harness.device, &harness.context)
            .await
            .unwrap();

        assert_eq!(plugin.pings_received(), 1);
        assert_eq!(
            harness.drain_events(),
            vec![PluginEvent::PingReceived {
                message: Some("Hello!".to_string())
            }]
        );
    }

    #[tokio::test]
    async fn test_handle_ping_without_message() {
        let mut harness = harness();
        let mut plugin = PingPlugin::new();

        for _ in 0..3 {
            plugin
                .handle_packet(&create_ping(None), &harness.device, &harness.context)
                .await
                .unwrap();
        }

        assert_eq!(plugin.pings_received(), 3);
        assert_eq!(harness.drain_events().len(), 3);
        assert!(harness.sink.packets().is_empty());
    }
}
