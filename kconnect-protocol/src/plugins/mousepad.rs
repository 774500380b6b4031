//! Mousepad Plugin
//!
//! Remote keyboard and touchpad input.
//!
//! `kdeconnect.mousepad.request` carries pointer movement (`dx`, `dy`,
//! `scroll`), clicks (`singleclick`, `doubleclick`, `middleclick`,
//! `rightclick`, `singlehold`, `singlerelease`) and key presses (`key`,
//! `specialKey` with `alt`/`ctrl`/`shift`). When `sendAck` is set the
//! receiver answers with `kdeconnect.mousepad.echo`, the same body with
//! `isAck: true`.
//!
//! `kdeconnect.mousepad.keyboardstate` tells whether the sender currently
//! accepts keyboard input.

use super::{capability_list, Plugin, PluginContext, PluginEvent, PluginFactory};
use crate::{Device, Packet, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use tracing::{debug, warn};

pub const PACKET_TYPE_MOUSEPAD_REQUEST: &str = "kdeconnect.mousepad.request";
pub const PACKET_TYPE_MOUSEPAD_ECHO: &str = "kdeconnect.mousepad.echo";
pub const PACKET_TYPE_MOUSEPAD_KEYBOARDSTATE: &str = "kdeconnect.mousepad.keyboardstate";

pub const INCOMING_CAPABILITIES: &[&str] = &[
    PACKET_TYPE_MOUSEPAD_REQUEST,
    PACKET_TYPE_MOUSEPAD_ECHO,
    PACKET_TYPE_MOUSEPAD_KEYBOARDSTATE,
];
pub const OUTGOING_CAPABILITIES: &[&str] = &[
    PACKET_TYPE_MOUSEPAD_REQUEST,
    PACKET_TYPE_MOUSEPAD_ECHO,
    PACKET_TYPE_MOUSEPAD_KEYBOARDSTATE,
];

/// One input event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MousepadRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub special_key: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctrl: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shift: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroll: Option<bool>,
    #[serde(rename = "singleclick", skip_serializing_if = "Option::is_none")]
    pub single_click: Option<bool>,
    #[serde(rename = "doubleclick", skip_serializing_if = "Option::is_none")]
    pub double_click: Option<bool>,
    #[serde(rename = "middleclick", skip_serializing_if = "Option::is_none")]
    pub middle_click: Option<bool>,
    #[serde(rename = "rightclick", skip_serializing_if = "Option::is_none")]
    pub right_click: Option<bool>,
    #[serde(rename = "singlehold", skip_serializing_if = "Option::is_none")]
    pub single_hold: Option<bool>,
    #[serde(rename = "singlerelease", skip_serializing_if = "Option::is_none")]
    pub single_release: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_ack: Option<bool>,
}

impl MousepadRequest {
    /// Relative pointer movement
    pub fn movement(dx: f64, dy: f64) -> Self {
        Self {
            dx: Some(dx),
            dy: Some(dy),
            ..Default::default()
        }
    }

    /// Typed text
    pub fn text(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct KeyboardStateBody {
    state: bool,
}

/// Send input to the device
pub fn create_request(request: &MousepadRequest) -> Result<Packet> {
    Ok(Packet::new(
        PACKET_TYPE_MOUSEPAD_REQUEST,
        serde_json::to_value(request)?,
    ))
}

/// Acknowledge input received from the device
pub fn create_echo(request: &MousepadRequest) -> Result<Packet> {
    Ok(Packet::new(PACKET_TYPE_MOUSEPAD_ECHO, serde_json::to_value(request)?)
        .with_body_field("isAck", true))
}

/// Tell the device whether we accept keyboard input
pub fn create_keyboard_state(active: bool) -> Packet {
    Packet::new(PACKET_TYPE_MOUSEPAD_KEYBOARDSTATE, json!({ "state": active }))
}

#[derive(Debug, Default)]
pub struct MousepadPlugin {
    keyboard_active: Option<bool>,
}

impl MousepadPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keyboard state the device reported last
    pub fn keyboard_active(&self) -> Option<bool> {
        self.keyboard_active
    }
}

#[async_trait]
impl Plugin for MousepadPlugin {
    fn name(&self) -> &str {
        "mousepad"
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
        match packet.packet_type.as_str() {
            PACKET_TYPE_MOUSEPAD_KEYBOARDSTATE => {
                let body: KeyboardStateBody = packet.parse_body()?;
                self.keyboard_active = Some(body.state);
                context.emit(PluginEvent::KeyboardStateChanged { active: body.state });
            }
            PACKET_TYPE_MOUSEPAD_ECHO => {
                let request: MousepadRequest = packet.parse_body()?;
                debug!("Input acknowledged by {}", context.device_id());
                context.emit(PluginEvent::MousepadEchoReceived(request));
            }
            _ => {
                let request: MousepadRequest = packet.parse_body()?;

                if request.send_ack.unwrap_or(false) {
                    let echo = MousepadRequest {
                        send_ack: None,
                        ..request.clone()
                    };
                    if let Err(e) = context.send(create_echo(&echo)?).await {
                        warn!("Failed to acknowledge input from {}: {}", context.device_id(), e);
                    }
                }

                context.emit(PluginEvent::MousepadInput(request));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MousepadPluginFactory;

impl PluginFactory for MousepadPluginFactory {
    fn name(&self) -> &str {
        "mousepad"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(MousepadPlugin::new())
    }
}
