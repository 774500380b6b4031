//! Run Command Plugin
//!
//! Lets a device trigger preconfigured commands.
//!
//! `kdeconnect.runcommand` carries the sender's command list. The list is a
//! JSON object keyed by command id, itself encoded as a string:
//!
//! ```json
//! { "commandList": "{\"a1\":{\"name\":\"Lock\",\"command\":\"loginctl lock-session\"}}" }
//! ```
//!
//! `kdeconnect.runcommand.request` asks the receiver for its list
//! (`requestCommandList`), to run a command (`key`), or to open its command
//! editor (`setup`). Commands are never run here; the host decides.

use super::{capability_list, Plugin, PluginContext, PluginEvent, PluginFactory};
use crate::{Device, Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use tracing::debug;

pub const PACKET_TYPE_RUNCOMMAND: &str = "kdeconnect.runcommand";
pub const PACKET_TYPE_RUNCOMMAND_REQUEST: &str = "kdeconnect.runcommand.request";

pub const INCOMING_CAPABILITIES: &[&str] = &[PACKET_TYPE_RUNCOMMAND, PACKET_TYPE_RUNCOMMAND_REQUEST];
pub const OUTGOING_CAPABILITIES: &[&str] = &[PACKET_TYPE_RUNCOMMAND, PACKET_TYPE_RUNCOMMAND_REQUEST];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandItem {
    pub name: String,
    pub command: String,
}

/// Ask the device for its commands
pub fn create_command_list_request() -> Packet {
    Packet::new(PACKET_TYPE_RUNCOMMAND_REQUEST, json!({ "requestCommandList": true }))
}

/// Run one of the device's commands
pub fn create_execute(key: &str) -> Packet {
    Packet::new(PACKET_TYPE_RUNCOMMAND_REQUEST, json!({ "key": key }))
}

/// Tell the device which commands we offer
pub fn create_command_list(commands: &HashMap<String, RunCommandItem>) -> Result<Packet> {
    Ok(Packet::new(
        PACKET_TYPE_RUNCOMMAND,
        json!({ "commandList": serde_json::to_string(commands)? }),
    ))
}

/// Parse a command list sent either as a JSON string or as an object
fn parse_command_list(value: &Value) -> Result<HashMap<String, RunCommandItem>> {
    let parsed = match value {
        Value::String(encoded) => serde_json::from_str(encoded),
        other => serde_json::from_value(other.clone()),
    };
    parsed.map_err(|e| ProtocolError::InvalidPacket(format!("Invalid command list: {}", e)))
}

#[derive(Debug, Default)]
pub struct RunCommandPlugin {
    commands: HashMap<String, RunCommandItem>,
}

impl RunCommandPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device's commands as last reported
    pub fn commands(&self) -> &HashMap<String, RunCommandItem> {
        &self.commands
    }
}

#[async_trait]
impl Plugin for RunCommandPlugin {
    fn name(&self) -> &str {
        "runcommand"
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

    async fn init(&mut self, device: &Device, context: &PluginContext) -> Result<()> {
        if device.has_outgoing_capability(PACKET_TYPE_RUNCOMMAND) {
            if let Err(e) = context.send(create_command_list_request()).await {
                debug!("Could not request commands from {}: {}", device.id(), e);
            }
        }
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        _device: &Device,
        context: &PluginContext,
    ) -> Result<()> {
        if packet.is_type(PACKET_TYPE_RUNCOMMAND) {
            let list = packet.body.get("commandList").ok_or_else(|| {
                ProtocolError::InvalidPacket("runcommand packet without commandList".to_string())
            })?;
            self.commands = parse_command_list(list)?;
            debug!("Device offers {} commands", self.commands.len());
            context.emit(PluginEvent::CommandListReceived {
                commands: self.commands.clone(),
            });
            return Ok(());
        }

        if packet.get_body_field::<bool>("requestCommandList").unwrap_or(false) {
            context.emit(PluginEvent::CommandListRequested);
        } else if let Some(key) = packet.get_body_field::<String>("key") {
            context.emit(PluginEvent::CommandExecuteRequested { key });
        } else if packet.get_body_field::<bool>("setup").unwrap_or(false) {
            context.emit(PluginEvent::CommandSetupRequested);
        } else {
            return Err(ProtocolError::InvalidPacket(
                "runcommand request asks for nothing".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunCommandPluginFactory;

impl PluginFactory for RunCommandPluginFactory {
    fn name(&self) -> &str {
        "runcommand"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(RunCommandPlugin::new())
    }
}
