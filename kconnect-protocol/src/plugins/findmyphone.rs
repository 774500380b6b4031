//! Find My Phone Plugin
//!
//! Makes a device ring so it can be found. `kdeconnect.findmyphone.request`
//! has an empty body; receiving one asks the host to ring (or stop ringing).

use super::{capability_list, Plugin, PluginContext, PluginEvent, PluginFactory};
use crate::{Device, Packet, Result};
use async_trait::async_trait;
use serde_json::json;
use std::any::Any;
use tracing::info;

pub const PACKET_TYPE_FINDMYPHONE_REQUEST: &str = "kdeconnect.findmyphone.request";

pub const INCOMING_CAPABILITIES: &[&str] = &[PACKET_TYPE_FINDMYPHONE_REQUEST];
pub const OUTGOING_CAPABILITIES: &[&str] = &[PACKET_TYPE_FINDMYPHONE_REQUEST];

/// Ask the device to ring
pub fn create_find_request() -> Packet {
    Packet::new(PACKET_TYPE_FINDMYPHONE_REQUEST, json!({}))
}

#[derive(Debug, Default)]
pub struct FindMyPhonePlugin;

#[async_trait]
impl Plugin for FindMyPhonePlugin {
    fn name(&self) -> &str {
        "findmyphone"
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
        _packet: &Packet,
        device: &Device,
        context: &PluginContext,
    ) -> Result<()> {
        info!("{} ({}) is looking for us", device.name(), device.id());
        context.emit(PluginEvent::FindMyPhoneRequested);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FindMyPhonePluginFactory;

impl PluginFactory for FindMyPhonePluginFactory {
    fn name(&self) -> &str {
        "findmyphone"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(FindMyPhonePlugin)
    }
}
