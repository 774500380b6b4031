//! Clipboard Plugin
//!
//! Clipboard sync.
//!
//! - `kdeconnect.clipboard`: `{ "content": "..." }`, sent whenever the
//!   sender's clipboard changes
//! - `kdeconnect.clipboard.connect`: `{ "content": "...", "timestamp": 1234 }`,
//!   sent right after connecting. A timestamp of `0` means the sender does
//!   not know when its clipboard was set; such packets are ignored, as are
//!   packets older than the content we already have.

use super::{capability_list, Plugin, PluginContext, PluginEvent, PluginFactory};
use crate::{Device, Packet, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::any::Any;
use tracing::debug;

pub const PACKET_TYPE_CLIPBOARD: &str = "kdeconnect.clipboard";
pub const PACKET_TYPE_CLIPBOARD_CONNECT: &str = "kdeconnect.clipboard.connect";

pub const INCOMING_CAPABILITIES: &[&str] = &[PACKET_TYPE_CLIPBOARD, PACKET_TYPE_CLIPBOARD_CONNECT];
pub const OUTGOING_CAPABILITIES: &[&str] = &[PACKET_TYPE_CLIPBOARD, PACKET_TYPE_CLIPBOARD_CONNECT];

#[derive(Debug, Deserialize)]
struct ClipboardBody {
    content: String,
    #[serde(default)]
    timestamp: i64,
}

/// Tell the device our clipboard changed
pub fn create_clipboard(content: &str) -> Packet {
    Packet::new(PACKET_TYPE_CLIPBOARD, json!({ "content": content }))
}

/// Offer our clipboard to a freshly connected device
///
/// `timestamp` is when the content was set, in UNIX milliseconds.
pub fn create_clipboard_connect(content: &str, timestamp: i64) -> Packet {
    Packet::new(
        PACKET_TYPE_CLIPBOARD_CONNECT,
        json!({ "content": content, "timestamp": timestamp }),
    )
}

#[derive(Debug, Default)]
pub struct ClipboardPlugin {
    content: Option<String>,
    /// When `content` was set (UNIX milliseconds)
    updated_at: i64,
}

impl ClipboardPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// The device's clipboard as last received
    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    fn update(&mut self, content: String, timestamp: i64, context: &PluginContext) {
        self.updated_at = timestamp;
        if self.content.as_deref() == Some(content.as_str()) {
            return;
        }
        self.content = Some(content.clone());
        context.emit(PluginEvent::ClipboardChanged { content });
    }
}

#[async_trait]
impl Plugin for ClipboardPlugin {
    fn name(&self) -> &str {
        "clipboard"
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
        let body: ClipboardBody = packet.parse_body()?;

        if packet.is_type(PACKET_TYPE_CLIPBOARD_CONNECT) {
            if body.timestamp == 0 || body.timestamp <= self.updated_at {
                debug!("Ignoring stale clipboard from {}", context.device_id());
                return Ok(());
            }
            self.update(body.content, body.timestamp, context);
        } else {
            self.update(body.content, Utc::now().timestamp_millis(), context);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClipboardPluginFactory;

impl PluginFactory for ClipboardPluginFactory {
    fn name(&self) -> &str {
        "clipboard"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(ClipboardPlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::test_support::harness;

    #[tokio::test]
    async fn test_clipboard_change() {
        let mut harness = harness();
        let mut plugin = ClipboardPlugin::new();

        for _ in 0..2 {
            plugin
                .handle_packet(&create_clipboard("copied"), &harness.device, &harness.context)
                .await
                .unwrap();
        }

        assert_eq!(plugin.content(), Some("copied"));
        // same content twice is one change
        assert_eq!(
            harness.drain_events(),
            vec![PluginEvent::ClipboardChanged {
                content: "copied".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_connect_with_zero_timestamp_ignored() {
        let mut harness = harness();
        let mut plugin = ClipboardPlugin::new();

        plugin
            .handle_packet(
                &create_clipboard_connect("old", 0),
                &harness.device,
                &harness.context,
            )
            .await
            .unwrap();

        assert!(plugin.content().is_none());
        assert!(harness.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_connect_older_than_current_ignored() {
        let mut harness = harness();
        let mut plugin = ClipboardPlugin::new();

        plugin
            .handle_packet(
                &create_clipboard_connect("first", 2_000),
                &harness.device,
                &harness.context,
            )
            .await
            .unwrap();
        plugin
            .handle_packet(
                &create_clipboard_connect("older", 1_000),
                &harness.device,
                &harness.context,
            )
            .await
            .unwrap();

        assert_eq!(plugin.content(), Some("first"));
        assert_eq!(harness.drain_events().len(), 1);
    }
}
