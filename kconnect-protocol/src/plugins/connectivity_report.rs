//! Connectivity Report Plugin
//!
//! Mobile network signal strength of a phone.
//!
//! ```json
//! { "signalStrengths": { "6": { "networkType": "4G", "signalStrength": 3 } } }
//! ```
//!
//! Keys identify SIM subscriptions; `signalStrength` ranges from 0 to 4.
//! `kdeconnect.connectivity_report.request` asks the receiver for a report.

use super::{capability_list, Plugin, PluginContext, PluginEvent, PluginFactory};
use crate::{Device, Packet, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;

pub const PACKET_TYPE_CONNECTIVITY_REPORT: &str = "kdeconnect.connectivity_report";
pub const PACKET_TYPE_CONNECTIVITY_REPORT_REQUEST: &str = "kdeconnect.connectivity_report.request";

pub const INCOMING_CAPABILITIES: &[&str] = &[
    PACKET_TYPE_CONNECTIVITY_REPORT,
    PACKET_TYPE_CONNECTIVITY_REPORT_REQUEST,
];
pub const OUTGOING_CAPABILITIES: &[&str] = &[
    PACKET_TYPE_CONNECTIVITY_REPORT,
    PACKET_TYPE_CONNECTIVITY_REPORT_REQUEST,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalStrength {
    pub network_type: String,
    pub signal_strength: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportBody {
    #[serde(default)]
    signal_strengths: HashMap<String, SignalStrength>,
}

/// Report our signal strengths
pub fn create_report(signals: &HashMap<String, SignalStrength>) -> Result<Packet> {
    Ok(Packet::new(
        PACKET_TYPE_CONNECTIVITY_REPORT,
        json!({ "signalStrengths": serde_json::to_value(signals)? }),
    ))
}

/// Ask the device for a report
pub fn create_report_request() -> Packet {
    Packet::new(PACKET_TYPE_CONNECTIVITY_REPORT_REQUEST, json!({}))
}

#[derive(Debug, Default)]
pub struct ConnectivityReportPlugin {
    signals: HashMap<String, SignalStrength>,
}

impl ConnectivityReportPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> &HashMap<String, SignalStrength> {
        &self.signals
    }
}

#[async_trait]
impl Plugin for ConnectivityReportPlugin {
    fn name(&self) -> &str {
        "connectivity_report"
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
        if packet.is_type(PACKET_TYPE_CONNECTIVITY_REPORT_REQUEST) {
            context.emit(PluginEvent::ConnectivityRequested);
            return Ok(());
        }

        let body: ReportBody = packet.parse_body()?;
        self.signals = body.signal_strengths.clone();
        context.emit(PluginEvent::ConnectivityUpdated {
            signals: body.signal_strengths,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectivityReportPluginFactory;

impl PluginFactory for ConnectivityReportPluginFactory {
    fn name(&self) -> &str {
        "connectivity_report"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(ConnectivityReportPlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::harness;

    #[tokio::test]
    async fn test_report() {
        let mut harness = harness();
        let mut plugin = ConnectivityReportPlugin::new();

        let signals = HashMap::from([(
            "6".to_string(),
            SignalStrength {
                network_type: "4G".to_string(),
                signal_strength: 3,
            },
        )]);
        plugin
            .handle_packet(
                &create_report(&signals).unwrap(),
                &harness.device,
                &harness.context,
            )
            .await
            .unwrap();

        assert_eq!(plugin.signals(), &signals);
        assert_eq!(
            harness.drain_events(),
            vec![PluginEvent::ConnectivityUpdated { signals }]
        );
    }

    #[tokio::test]
    async fn test_request() {
        let mut harness = harness();
        let mut plugin = ConnectivityReportPlugin::new();

        plugin
            .handle_packet(&create_report_request(), &harness.device, &harness.context)
            .await
            .unwrap();
        assert_eq!(
            harness.drain_events(),
            vec![PluginEvent::ConnectivityRequested]
        );
    }
}
