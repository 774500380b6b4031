//! Share Plugin
//!
//! Receives text, URLs and files.
//!
//! ## Packet Format
//!
//! `kdeconnect.share.request` carries exactly one of:
//! - `text`: plain text
//! - `url`: a link to open
//! - `filename`: a file, with `payloadSize` and `payloadTransferInfo`; may
//!   carry `creationTime`, `lastModified`, `open`, and for multi-file shares
//!   `numberOfFiles` / `totalPayloadSize`
//!
//! `kdeconnect.share.request.update` updates `numberOfFiles` and
//! `totalPayloadSize` while a multi-file share is in progress.
//!
//! Files are downloaded in the background into the download directory. An
//! existing file is never overwritten; the new one gets a timestamp prefix.

use super::{capability_list, Plugin, PluginContext, PluginEvent, PluginFactory};
use crate::transport::{FileTransferInfo, PayloadClient};
use crate::{Device, Packet, ProtocolError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::any::Any;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const PACKET_TYPE_SHARE_REQUEST: &str = "kdeconnect.share.request";
pub const PACKET_TYPE_SHARE_REQUEST_UPDATE: &str = "kdeconnect.share.request.update";

pub const INCOMING_CAPABILITIES: &[&str] =
    &[PACKET_TYPE_SHARE_REQUEST, PACKET_TYPE_SHARE_REQUEST_UPDATE];
pub const OUTGOING_CAPABILITIES: &[&str] =
    &[PACKET_TYPE_SHARE_REQUEST, PACKET_TYPE_SHARE_REQUEST_UPDATE];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShareBody {
    text: Option<String>,
    url: Option<String>,
    filename: Option<String>,
    #[serde(default)]
    open: bool,
    number_of_files: Option<u64>,
    total_payload_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateBody {
    number_of_files: u64,
    total_payload_size: u64,
}

/// Share text with the device
pub fn create_text(text: &str) -> Packet {
    Packet::new(PACKET_TYPE_SHARE_REQUEST, json!({ "text": text }))
}

/// Share a URL with the device
pub fn create_url(url: &str) -> Packet {
    Packet::new(PACKET_TYPE_SHARE_REQUEST, json!({ "url": url }))
}

/// Offer a file to the device, asking it to open the file once received
/// when `open` is set
///
/// The caller adds the payload port once the payload server is bound.
pub fn create_file(info: &FileTransferInfo, open: bool) -> Packet {
    let mut packet = Packet::new(
        PACKET_TYPE_SHARE_REQUEST,
        json!({ "filename": info.filename, "open": open }),
    )
    .with_payload_size(info.size as i64);

    if let Some(created) = info.creation_time {
        packet = packet.with_body_field("creationTime", created);
    }
    if let Some(modified) = info.last_modified {
        packet = packet.with_body_field("lastModified", modified);
    }
    packet
}

/// Offer one file of a multi-file share
///
/// `remaining_files` and `remaining_size` count this file and every file
/// still to come.
pub fn create_batch_file(
    info: &FileTransferInfo,
    open: bool,
    remaining_files: u64,
    remaining_size: u64,
) -> Packet {
    create_file(info, open)
        .with_body_field("numberOfFiles", remaining_files)
        .with_body_field("totalPayloadSize", remaining_size)
}

/// Announce the size of a multi-file share
pub fn create_update(number_of_files: u64, total_payload_size: u64) -> Packet {
    Packet::new(
        PACKET_TYPE_SHARE_REQUEST_UPDATE,
        json!({ "numberOfFiles": number_of_files, "totalPayloadSize": total_payload_size }),
    )
}

/// Strip any directory part from a name chosen by the peer
fn safe_file_name(filename: &str) -> Result<String> {
    Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::InvalidPacket(format!("Invalid filename '{}'", filename)))
}

/// Pick a destination that does not clobber an existing file
async fn destination(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    match tokio::fs::try_exists(&path).await {
        Ok(false) => path,
        _ => dir.join(format!("{}_{}", Utc::now().timestamp_millis(), name)),
    }
}

#[derive(Debug, Default)]
pub struct SharePlugin {
    transfers_started: u64,
}

impl SharePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of file downloads started
    pub fn transfers_started(&self) -> u64 {
        self.transfers_started
    }

    fn receive_file(
        &mut self,
        filename: &str,
        open: bool,
        packet: &Packet,
        device: &Device,
        context: &PluginContext,
    ) -> Result<()> {
        let name = safe_file_name(filename)?;
        let (addr, size) = context.payload_source(device, packet)?;
        self.transfers_started += 1;

        let context = context.clone();
        tokio::spawn(async move {
            let path = destination(context.download_dir(), &name).await;
            info!("Receiving '{}' ({} bytes) to {:?}", name, size, path);

            match PayloadClient::fetch_to_file(addr, size, context.tls(), &path).await {
                Ok(size) => context.emit(PluginEvent::FileReceived { path, size, open }),
                Err(e) => {
                    warn!("Failed to receive '{}': {}", name, e);
                    context.emit(PluginEvent::FileTransferFailed {
                        filename: name,
                        reason: e.to_string(),
                    });
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Plugin for SharePlugin {
    fn name(&self) -> &str {
        "share"
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
        device: &Device,
        context: &PluginContext,
    ) -> Result<()> {
        if packet.is_type(PACKET_TYPE_SHARE_REQUEST_UPDATE) {
            let update: UpdateBody = packet.parse_body()?;
            context.emit(PluginEvent::ShareProgress {
                number_of_files: update.number_of_files,
                total_payload_size: update.total_payload_size,
            });
            return Ok(());
        }

        let body: ShareBody = packet.parse_body()?;

        if let Some(text) = body.text {
            context.emit(PluginEvent::TextShared { text });
        } else if let Some(url) = body.url {
            context.emit(PluginEvent::UrlShared { url });
        } else if let Some(filename) = body.filename {
            if let (Some(number_of_files), Some(total_payload_size)) =
                (body.number_of_files, body.total_payload_size)
            {
                context.emit(PluginEvent::ShareProgress {
                    number_of_files,
                    total_payload_size,
                });
            }
            self.receive_file(&filename, body.open, packet, device, context)?;
        } else {
            return Err(ProtocolError::InvalidPacket(
                "share request without text, url or filename".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SharePluginFactory;

impl PluginFactory for SharePluginFactory {
    fn name(&self) -> &str {
        "share"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(SharePlugin::new())
    }
}
