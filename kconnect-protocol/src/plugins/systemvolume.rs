//! System Volume Plugin
//!
//! Remote control of audio sinks (output devices).
//!
//! ## Protocol
//!
//! `kdeconnect.systemvolume` describes the sender's sinks, either as a full
//! list or as a change to one sink:
//!
//! ```json
//! { "sinkList": [{ "name": "alsa_output", "description": "Speakers",
//!                  "muted": false, "volume": 40, "maxVolume": 100 }] }
//! { "name": "alsa_output", "volume": 55 }
//! ```
//!
//! `kdeconnect.systemvolume.request` asks the receiver for its sinks
//! (`requestSinks`) or to change one of them (`name` plus any of `volume`,
//! `muted`, `enabled`).

use super::{capability_list, Plugin, PluginContext, PluginEvent, PluginFactory};
use crate::{Device, Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use tracing::debug;

pub const PACKET_TYPE_SYSTEMVOLUME: &str = "kdeconnect.systemvolume";
pub const PACKET_TYPE_SYSTEMVOLUME_REQUEST: &str = "kdeconnect.systemvolume.request";

pub const INCOMING_CAPABILITIES: &[&str] =
    &[PACKET_TYPE_SYSTEMVOLUME, PACKET_TYPE_SYSTEMVOLUME_REQUEST];
pub const OUTGOING_CAPABILITIES: &[&str] =
    &[PACKET_TYPE_SYSTEMVOLUME, PACKET_TYPE_SYSTEMVOLUME_REQUEST];

/// One audio sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSink {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub volume: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_volume: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// A change to one sink; absent fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeUpdate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl VolumeUpdate {
    fn apply_to(&self, sink: &mut VolumeSink) {
        if let Some(volume) = self.volume {
            sink.volume = volume;
        }
        if let Some(muted) = self.muted {
            sink.muted = muted;
        }
        if let Some(enabled) = self.enabled {
            sink.enabled = Some(enabled);
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SinkListBody {
    sink_list: Vec<VolumeSink>,
}

/// Ask the device for its sinks
pub fn create_sinks_request() -> Packet {
    Packet::new(PACKET_TYPE_SYSTEMVOLUME_REQUEST, json!({ "requestSinks": true }))
}

/// Ask the device to change one of its sinks
pub fn create_volume_request(update: &VolumeUpdate) -> Result<Packet> {
    Ok(Packet::new(
        PACKET_TYPE_SYSTEMVOLUME_REQUEST,
        serde_json::to_value(update)?,
    ))
}

/// Tell the device about our sinks
pub fn create_sink_list(sinks: &[VolumeSink]) -> Result<Packet> {
    Ok(Packet::new(
        PACKET_TYPE_SYSTEMVOLUME,
        json!({ "sinkList": serde_json::to_value(sinks)? }),
    ))
}

/// Tell the device one of our sinks changed
pub fn create_sink_update(update: &VolumeUpdate) -> Result<Packet> {
    Ok(Packet::new(
        PACKET_TYPE_SYSTEMVOLUME,
        serde_json::to_value(update)?,
    ))
}

/// Tracks the device's sinks
#[derive(Debug, Default)]
pub struct SystemVolumePlugin {
    sinks: Vec<VolumeSink>,
}

impl SystemVolumePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device's sinks as last reported
    pub fn sinks(&self) -> &[VolumeSink] {
        &self.sinks
    }

    fn handle_state(&mut self, packet: &Packet, context: &PluginContext) -> Result<()> {
        if packet.body.get("sinkList").is_some() {
            let body: SinkListBody = packet.parse_body()?;
            debug!("Device reported {} sinks", body.sink_list.len());
            self.sinks = body.sink_list.clone();
            context.emit(PluginEvent::VolumeSinksReceived {
                sinks: body.sink_list,
            });
            return Ok(());
        }

        let update: VolumeUpdate = packet.parse_body()?;
        match self.sinks.iter_mut().find(|sink| sink.name == update.name) {
            Some(sink) => update.apply_to(sink),
            None => debug!("Update for unknown sink '{}'", update.name),
        }
        context.emit(PluginEvent::VolumeSinkUpdated(update));
        Ok(())
    }

    fn handle_request(&self, packet: &Packet, context: &PluginContext) -> Result<()> {
        if packet.get_body_field::<bool>("requestSinks").unwrap_or(false) {
            context.emit(PluginEvent::VolumeSinksRequested);
            return Ok(());
        }

        let update: VolumeUpdate = packet.parse_body()?;
        if update.volume.is_none() && update.muted.is_none() && update.enabled.is_none() {
            return Err(ProtocolError::InvalidPacket(format!(
                "volume request for '{}' changes nothing",
                update.name
            )));
        }
        context.emit(PluginEvent::VolumeChangeRequested(update));
        Ok(())
    }
}

#[async_trait]
impl Plugin for SystemVolumePlugin {
    fn name(&self) -> &str {
        "systemvolume"
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
        if packet.is_type(PACKET_TYPE_SYSTEMVOLUME_REQUEST) {
            self.handle_request(packet, context)
        } else {
            self.handle_state(packet, context)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemVolumePluginFactory;

impl PluginFactory for SystemVolumePluginFactory {
    fn name(&self) -> &str {
        "systemvolume"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(SystemVolumePlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::harness;

    fn speakers() -> VolumeSink {
        VolumeSink {
            name: "alsa_output".to_string(),
            description: "Speakers".to_string(),
            muted: false,
            volume: 40,
            max_volume: Some(100),
            enabled: None,
        }
    }

    #[tokio::test]
    async fn test_sink_list_then_update() {
        let mut harness = harness();
        let mut plugin = SystemVolumePlugin::new();

        let list = create_sink_list(&[speakers()]).unwrap();
        plugin
            .handle_packet(&list, &harness.device, &harness.context)
            .await
            .unwrap();

        let update = VolumeUpdate {
            name: "alsa_output".to_string(),
            muted: Some(true),
            ..Default::default()
        };
        plugin
            .handle_packet(
                &create_sink_update(&update).unwrap(),
                &harness.device,
                &harness.context,
            )
            .await
            .unwrap();

        assert!(plugin.sinks()[0].muted);
        assert_eq!(plugin.sinks()[0].volume, 40);
        assert_eq!(
            harness.drain_events(),
            vec![
                PluginEvent::VolumeSinksReceived {
                    sinks: vec![speakers()]
                },
                PluginEvent::VolumeSinkUpdated(update)
            ]
        );
    }

    #[tokio::test]
    async fn test_requests() {
        let mut harness = harness();
        let mut plugin = SystemVolumePlugin::new();

        plugin
            .handle_packet(&create_sinks_request(), &harness.device, &harness.context)
            .await
            .unwrap();

        let change = VolumeUpdate {
            name: "alsa_output".to_string(),
            volume: Some(70),
            ..Default::default()
        };
        plugin
            .handle_packet(
                &create_volume_request(&change).unwrap(),
                &harness.device,
                &harness.context,
            )
            .await
            .unwrap();

        assert_eq!(
            harness.drain_events(),
            vec![
                PluginEvent::VolumeSinksRequested,
                PluginEvent::VolumeChangeRequested(change)
            ]
        );
    }

    #[tokio::test]
    async fn test_request_without_change_is_invalid() {
        let harness = harness();
        let mut plugin = SystemVolumePlugin::new();

        let packet = Packet::new(PACKET_TYPE_SYSTEMVOLUME_REQUEST, json!({ "name": "x" }));
        assert!(plugin
            .handle_packet(&packet, &harness.device, &harness.context)
            .await
            .is_err());
    }
}
