//! Battery Plugin
//!
//! Shares battery state between devices.
//!
//! ## Packet Format
//!
//! ```json
//! {
//!     "type": "kdeconnect.battery",
//!     "body": { "currentCharge": 85, "isCharging": false, "thresholdEvent": 0 }
//! }
//! ```
//!
//! `thresholdEvent` is `1` when the charge dropped below the low-battery
//! threshold, `0` otherwise. `kdeconnect.battery.request` asks the receiver
//! to send its state.
//!
//! This crate has no access to the local power source; the host reports it
//! with [`create_battery`].

use super::{capability_list, Plugin, PluginContext, PluginEvent, PluginFactory};
use crate::{Device, Packet, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;
use std::any::Any;
use tracing::{debug, info};

pub const PACKET_TYPE_BATTERY: &str = "kdeconnect.battery";
pub const PACKET_TYPE_BATTERY_REQUEST: &str = "kdeconnect.battery.request";

pub const INCOMING_CAPABILITIES: &[&str] = &[PACKET_TYPE_BATTERY, PACKET_TYPE_BATTERY_REQUEST];
pub const OUTGOING_CAPABILITIES: &[&str] = &[PACKET_TYPE_BATTERY, PACKET_TYPE_BATTERY_REQUEST];

/// Battery state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
    /// Charge in percent
    #[serde(rename = "currentCharge")]
    pub charge: i32,

    #[serde(rename = "isCharging")]
    pub is_charging: bool,

    /// Charge is below the low-battery threshold
    #[serde(
        rename = "thresholdEvent",
        default,
        serialize_with = "serialize_threshold",
        deserialize_with = "deserialize_threshold"
    )]
    pub under_threshold: bool,
}

fn serialize_threshold<S>(value: &bool, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_i32(i32::from(*value))
}

fn deserialize_threshold<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match i32::deserialize(deserializer)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Signed(other.into()),
            &"0 or 1",
        )),
    }
}

/// Report our battery state
pub fn create_battery(state: &BatteryState) -> Result<Packet> {
    Ok(Packet::new(PACKET_TYPE_BATTERY, serde_json::to_value(state)?))
}

/// Ask the device for its battery state
pub fn create_battery_request() -> Packet {
    Packet::new(PACKET_TYPE_BATTERY_REQUEST, json!({ "request": true }))
}

#[derive(Debug, Default)]
pub struct BatteryPlugin {
    state: Option<BatteryState>,
}

impl BatteryPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device's battery state as last reported
    pub fn state(&self) -> Option<BatteryState> {
        self.state
    }
}

#[async_trait]
impl Plugin for BatteryPlugin {
    fn name(&self) -> &str {
        "battery"
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
        if device.has_outgoing_capability(PACKET_TYPE_BATTERY) {
            if let Err(e) = context.send(create_battery_request()).await {
                debug!("Could not request battery state from {}: {}", device.id(), e);
            }
        }
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        device: &Device,
        context: &PluginContext,
    ) -> Result<()> {
        if packet.is_type(PACKET_TYPE_BATTERY_REQUEST) {
            context.emit(PluginEvent::BatteryRequested);
            return Ok(());
        }

        let state: BatteryState = packet.parse_body()?;
        if state.under_threshold {
            info!("{} battery low: {}%", device.name(), state.charge);
        } else {
            debug!(
                "{} battery: {}% (charging: {})",
                device.name(),
                state.charge,
                state.is_charging
            );
        }

        self.state = Some(state);
        context.emit(PluginEvent::BatteryUpdated(state));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatteryPluginFactory;

impl PluginFactory for BatteryPluginFactory {
    fn name(&self) -> &str {
        "battery"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(BatteryPlugin::new())
    }
}
