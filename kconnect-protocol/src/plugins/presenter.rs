//! Presenter Plugin
//!
//! Uses a phone as a wireless presentation remote: pointer movement for a
//! laser pointer, and a stop event when the pointer is released.
//!
//! ## Packet Format
//!
//! `kdeconnect.presenter` carries one of:
//! - `dx`, `dy`: Pointer movement delta
//! - `stop`: `true` to end pointer mode
//!
//! ## References
//!
//! - [KDE Connect Presenter Plugin](https://github.com/KDE/kdeconnect-kde/tree/master/plugins/presenter)

use super::{capability_list, Plugin, PluginContext, PluginEvent, PluginFactory};
use crate::{Device, Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use tracing::{debug, info};

/// Packet type for presenter events
pub const PACKET_TYPE_PRESENTER: &str = "kdeconnect.presenter";

pub const INCOMING_CAPABILITIES: &[&str] = &[PACKET_TYPE_PRESENTER];
pub const OUTGOING_CAPABILITIES: &[&str] = &[PACKET_TYPE_PRESENTER];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PresenterBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    dx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<bool>,
}

/// Move the device's pointer
pub fn create_move(dx: f64, dy: f64) -> Packet {
    Packet::new(PACKET_TYPE_PRESENTER, json!({ "dx": dx, "dy": dy }))
}

/// End pointer mode on the device
pub fn create_stop() -> Packet {
    Packet::new(PACKET_TYPE_PRESENTER, json!({ "stop": true }))
}

/// Presenter plugin for presentation remote control
#[derive(Debug, Default)]
pub struct PresenterPlugin {
    presentation_active: bool,
}

impl PresenterPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether pointer movement has been seen since the last stop
    pub fn is_active(&self) -> bool {
        self.presentation_active
    }
}

#[async_trait]
impl Plugin for PresenterPlugin {
    fn name(&self) -> &str {
        "presenter"
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

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        _device: &Device,
        context: &PluginContext,
    ) -> Result<()> {
        let body: PresenterBody = packet.parse_body()?;

        if body.stop.unwrap_or(false) {
            info!("Presentation mode stopped");
            self.presentation_active = false;
            context.emit(PluginEvent::PresenterStopped);
            return Ok(());
        }

        if body.dx.is_none() && body.dy.is_none() {
            return Err(ProtocolError::InvalidPacket(
                "presenter packet without movement or stop".to_string(),
            ));
        }

        let dx = body.dx.unwrap_or(0.0);
        let dy = body.dy.unwrap_or(0.0);

        if !self.presentation_active {
            info!("Presentation mode started");
            self.presentation_active = true;
        }

        debug!("Presenter pointer moved: dx={}, dy={}", dx, dy);
        context.emit(PluginEvent::PresenterMoved { dx, dy });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PresenterPluginFactory;

impl PluginFactory for PresenterPluginFactory {
    fn name(&self) -> &str {
        "presenter"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PresenterPlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::harness;

    #[tokio::test]
    async fn test_move_then_stop() {
        let mut harness = harness();
        let mut plugin = PresenterPlugin::new();

        plugin
            .handle_packet(&create_move(1.5, -2.0), &harness.device, &harness.context)
            .await
            .unwrap();
        assert!(plugin.is_active());

        plugin
            .handle_packet(&create_stop(), &harness.device, &harness.context)
            .await
            .unwrap();
        assert!(!plugin.is_active());

        assert_eq!(
            harness.drain_events(),
            vec![
                PluginEvent::PresenterMoved { dx: 1.5, dy: -2.0 },
                PluginEvent::PresenterStopped
            ]
        );
    }

    #[tokio::test]
    async fn test_partial_movement() {
        let mut harness = harness();
        let mut plugin = PresenterPlugin::new();

        let packet = Packet::new(PACKET_TYPE_PRESENTER, json!({ "dy": 4 }));
        plugin
            .handle_packet(&packet, &harness.device, &harness.context)
            .await
            .unwrap();

        assert_eq!(
            harness.drain_events(),
            vec![PluginEvent::PresenterMoved { dx: 0.0, dy: 4.0 }]
        );
    }

    #[tokio::test]
    async fn test_empty_body_is_invalid() {
        let harness = harness();
        let mut plugin = PresenterPlugin::new();

        let packet = Packet::new(PACKET_TYPE_PRESENTER, json!({}));
        let result = plugin
            .handle_packet(&packet, &harness.device, &harness.context)
            .await;
        assert!(matches!(result, Err(ProtocolError::InvalidPacket(_))));
    }
}
