//! MPRIS Plugin
//!
//! Remote media player control in both directions: we follow the players on
//! the device and the device can control ours.
//!
//! ## Protocol
//!
//! `kdeconnect.mpris` describes the sender's players:
//!
//! - Player list: `{ "playerList": ["spotify"], "supportAlbumArtPayload": true }`
//! - Player state: `{ "player": "spotify", "title": "...", "isPlaying": true, ... }`
//!   (fields are optional, absent ones are unchanged)
//! - Album art: `{ "player": "spotify", "albumArtUrl": "file:///...",
//!   "transferringAlbumArt": true }` with a payload holding the image
//!
//! `kdeconnect.mpris.request` asks the receiver for its player list
//! (`requestPlayerList`), for the state of a player (`requestNowPlaying`,
//! `requestVolume`, `albumArtUrl`), or to control a player (`action`,
//! `Seek`, `SetPosition`, `setVolume`, `setLoopStatus`, `setShuffle`).
//!
//! ## Album Art
//!
//! When a player reports a local (`file:`) album art URL and the device
//! advertised `supportAlbumArtPayload`, the art is requested and the image
//! is downloaded over a payload side-stream into `album_art/` below the
//! download directory.

use super::{capability_list, Plugin, PluginContext, PluginEvent, PluginFactory};
use crate::transport::PayloadClient;
use crate::{Device, Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub const PACKET_TYPE_MPRIS: &str = "kdeconnect.mpris";
pub const PACKET_TYPE_MPRIS_REQUEST: &str = "kdeconnect.mpris.request";

pub const INCOMING_CAPABILITIES: &[&str] = &[PACKET_TYPE_MPRIS, PACKET_TYPE_MPRIS_REQUEST];
pub const OUTGOING_CAPABILITIES: &[&str] = &[PACKET_TYPE_MPRIS, PACKET_TYPE_MPRIS_REQUEST];

/// Directory below the download directory holding album art
const ALBUM_ART_DIR: &str = "album_art";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopStatus {
    None,
    Track,
    Playlist,
}

/// State of one media player
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MprisPlayer {
    pub player: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_playing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_pause: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_play: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_go_next: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_go_previous: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_seek: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_status: Option<LoopStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shuffle: Option<bool>,
    /// Position in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos: Option<i64>,
    /// Track length in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album_art_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl MprisPlayer {
    /// Overwrite every field `update` carries
    pub fn merge(&mut self, update: MprisPlayer) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if update.$field.is_some() {
                    self.$field = update.$field;
                })*
            };
        }

        take!(
            title,
            artist,
            album,
            is_playing,
            can_pause,
            can_play,
            can_go_next,
            can_go_previous,
            can_seek,
            loop_status,
            shuffle,
            pos,
            length,
            volume,
            album_art_url,
            url
        );
    }
}

/// Control a player
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MprisCommand {
    Play,
    Pause,
    PlayPause,
    Stop,
    Next,
    Previous,
    /// Relative seek in microseconds
    Seek(i64),
    /// Absolute position in milliseconds
    SetPosition(i64),
    SetVolume(i32),
    SetLoopStatus(LoopStatus),
    SetShuffle(bool),
}

impl MprisCommand {
    fn from_body(body: &Value) -> Result<Option<Self>> {
        let invalid = |field: &str| {
            ProtocolError::InvalidPacket(format!("invalid '{}' in mpris request", field))
        };

        if let Some(action) = body.get("action") {
            let command = match action.as_str() {
                Some("Play") => Self::Play,
                Some("Pause") => Self::Pause,
                Some("PlayPause") => Self::PlayPause,
                Some("Stop") => Self::Stop,
                Some("Next") => Self::Next,
                Some("Previous") => Self::Previous,
                _ => return Err(invalid("action")),
            };
            return Ok(Some(command));
        }

        if let Some(seek) = body.get("Seek") {
            return seek.as_i64().map(|s| Some(Self::Seek(s))).ok_or_else(|| invalid("Seek"));
        }
        if let Some(position) = body.get("SetPosition") {
            return position
                .as_i64()
                .map(|p| Some(Self::SetPosition(p)))
                .ok_or_else(|| invalid("SetPosition"));
        }
        if let Some(volume) = body.get("setVolume") {
            return volume
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(|v| Some(Self::SetVolume(v)))
                .ok_or_else(|| invalid("setVolume"));
        }
        if let Some(status) = body.get("setLoopStatus") {
            return serde_json::from_value(status.clone())
                .map(|s| Some(Self::SetLoopStatus(s)))
                .map_err(|_| invalid("setLoopStatus"));
        }
        if let Some(shuffle) = body.get("setShuffle") {
            return shuffle
                .as_bool()
                .map(|s| Some(Self::SetShuffle(s)))
                .ok_or_else(|| invalid("setShuffle"));
        }

        Ok(None)
    }

    fn write_to(&self, body: &mut Map<String, Value>) {
        let (key, value) = match self {
            Self::Play => ("action", json!("Play")),
            Self::Pause => ("action", json!("Pause")),
            Self::PlayPause => ("action", json!("PlayPause")),
            Self::Stop => ("action", json!("Stop")),
            Self::Next => ("action", json!("Next")),
            Self::Previous => ("action", json!("Previous")),
            Self::Seek(offset) => ("Seek", json!(offset)),
            Self::SetPosition(position) => ("SetPosition", json!(position)),
            Self::SetVolume(volume) => ("setVolume", json!(volume)),
            Self::SetLoopStatus(status) => ("setLoopStatus", json!(status)),
            Self::SetShuffle(shuffle) => ("setShuffle", json!(shuffle)),
        };
        body.insert(key.to_string(), value);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerListBody {
    player_list: Vec<String>,
    #[serde(default)]
    support_album_art_payload: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerRequestBody {
    player: Option<String>,
    #[serde(default)]
    request_now_playing: bool,
    #[serde(default)]
    request_volume: bool,
    album_art_url: Option<String>,
}

/// Ask the device for its players
pub fn create_player_list_request() -> Packet {
    Packet::new(PACKET_TYPE_MPRIS_REQUEST, json!({ "requestPlayerList": true }))
}

/// Ask the device for the state of one of its players
pub fn create_player_request(player: &str) -> Packet {
    Packet::new(
        PACKET_TYPE_MPRIS_REQUEST,
        json!({ "player": player, "requestNowPlaying": true, "requestVolume": true }),
    )
}

/// Ask the device to send the album art at `url` as a payload
pub fn create_album_art_request(player: &str, url: &str) -> Packet {
    Packet::new(
        PACKET_TYPE_MPRIS_REQUEST,
        json!({ "player": player, "albumArtUrl": url }),
    )
}

/// Control one of the device's players
pub fn create_command(player: &str, command: MprisCommand) -> Packet {
    let mut body = Map::new();
    body.insert("player".to_string(), json!(player));
    command.write_to(&mut body);
    Packet::new(PACKET_TYPE_MPRIS_REQUEST, Value::Object(body))
}

/// Tell the device which players we have
pub fn create_player_list(players: &[String], support_album_art: bool) -> Packet {
    Packet::new(
        PACKET_TYPE_MPRIS,
        json!({ "playerList": players, "supportAlbumArtPayload": support_album_art }),
    )
}

/// Tell the device the state of one of our players
pub fn create_player_info(player: &MprisPlayer) -> Result<Packet> {
    Ok(Packet::new(PACKET_TYPE_MPRIS, serde_json::to_value(player)?))
}

/// Follows the device's players
#[derive(Debug, Default)]
pub struct MprisPlugin {
    players: HashMap<String, MprisPlayer>,
    supports_album_art: bool,
    /// Album art URL last requested per player
    requested_art: HashMap<String, String>,
}

impl MprisPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn players(&self) -> &HashMap<String, MprisPlayer> {
        &self.players
    }

    pub fn player(&self, name: &str) -> Option<&MprisPlayer> {
        self.players.get(name)
    }

    async fn send(&self, context: &PluginContext, packet: Packet) {
        if let Err(e) = context.send(packet).await {
            warn!("Failed to send mpris request to {}: {}", context.device_id(), e);
        }
    }

    async fn handle_player_list(&mut self, packet: &Packet, context: &PluginContext) -> Result<()> {
        let body: PlayerListBody = packet.parse_body()?;
        self.supports_album_art = body.support_album_art_payload;

        self.players
            .retain(|name, _| body.player_list.contains(name));
        self.requested_art
            .retain(|name, _| body.player_list.contains(name));

        for name in &body.player_list {
            if !self.players.contains_key(name) {
                self.players.insert(
                    name.clone(),
                    MprisPlayer {
                        player: name.clone(),
                        ..Default::default()
                    },
                );
                self.send(context, create_player_request(name)).await;
            }
        }

        debug!("Device has {} players", body.player_list.len());
        context.emit(PluginEvent::MprisPlayersReceived {
            players: body.player_list,
        });
        Ok(())
    }

    async fn handle_player_info(&mut self, packet: &Packet, context: &PluginContext) -> Result<()> {
        let update: MprisPlayer = packet.parse_body()?;
        if update.player.is_empty() {
            return Err(ProtocolError::InvalidPacket(
                "mpris state without player".to_string(),
            ));
        }

        let player = self
            .players
            .entry(update.player.clone())
            .or_insert_with(|| MprisPlayer {
                player: update.player.clone(),
                ..Default::default()
            });
        player.merge(update);
        let player = player.clone();

        if let Some(url) = player.album_art_url.as_deref() {
            let already_requested = self.requested_art.get(&player.player).map(String::as_str)
                == Some(url);
            if self.supports_album_art && url.starts_with("file:") && !already_requested {
                self.requested_art
                    .insert(player.player.clone(), url.to_string());
                self.send(context, create_album_art_request(&player.player, url))
                    .await;
            }
        }

        context.emit(PluginEvent::MprisPlayerUpdated { player });
        Ok(())
    }

    fn handle_album_art(
        &self,
        packet: &Packet,
        device: &Device,
        context: &PluginContext,
    ) -> Result<()> {
        let player: String = packet.get_body_field("player").ok_or_else(|| {
            ProtocolError::InvalidPacket("album art without player".to_string())
        })?;
        let (addr, size) = context.payload_source(device, packet)?;

        let file_name = format!("{}.png", hex::encode(format!("{}__{}", device.id(), player)));
        let path: PathBuf = context.download_dir().join(ALBUM_ART_DIR).join(file_name);
        let context = context.clone();

        tokio::spawn(async move {
            match PayloadClient::fetch_to_file(addr, size, context.tls(), &path).await {
                Ok(_) => {
                    info!("Saved album art for player {} to {:?}", player, path);
                    context.emit(PluginEvent::MprisAlbumArtReceived { player, path });
                }
                Err(e) => warn!("Failed to receive album art for player {}: {}", player, e),
            }
        });
        Ok(())
    }

    fn handle_request(&self, packet: &Packet, context: &PluginContext) -> Result<()> {
        if packet.get_body_field::<bool>("requestPlayerList").unwrap_or(false) {
            context.emit(PluginEvent::MprisPlayersRequested);
            return Ok(());
        }

        let body: PlayerRequestBody = packet.parse_body()?;
        let player = body.player.ok_or_else(|| {
            ProtocolError::InvalidPacket("mpris request without player".to_string())
        })?;

        let command = MprisCommand::from_body(&packet.body)?;
        let wants_state =
            body.request_now_playing || body.request_volume || body.album_art_url.is_some();

        if command.is_none() && !wants_state {
            return Err(ProtocolError::InvalidPacket(format!(
                "mpris request for '{}' asks for nothing",
                player
            )));
        }

        if let Some(command) = command {
            context.emit(PluginEvent::MprisActionRequested {
                player: player.clone(),
                command,
            });
        }

        if wants_state {
            context.emit(PluginEvent::MprisPlayerRequested {
                player,
                now_playing: body.request_now_playing,
                volume: body.request_volume,
                album_art_url: body.album_art_url,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for MprisPlugin {
    fn name(&self) -> &str {
        "mpris"
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
        if device.has_outgoing_capability(PACKET_TYPE_MPRIS) {
            self.send(context, create_player_list_request()).await;
        }
        Ok(())
    }

    async fn handle_packet(
        &mut self,
        packet: &Packet,
        device: &Device,
        context: &PluginContext,
    ) -> Result<()> {
        if packet.is_type(PACKET_TYPE_MPRIS_REQUEST) {
            return self.handle_request(packet, context);
        }

        if packet.body.get("playerList").is_some() {
            self.handle_player_list(packet, context).await
        } else if packet
            .get_body_field::<bool>("transferringAlbumArt")
            .unwrap_or(false)
        {
            self.handle_album_art(packet, device, context)
        } else {
            self.handle_player_info(packet, context).await
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MprisPluginFactory;

impl PluginFactory for MprisPluginFactory {
    fn name(&self) -> &str {
        "mpris"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        capability_list(INCOMING_CAPABILITIES)
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        capability_list(OUTGOING_CAPABILITIES)
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(MprisPlugin::new())
    }
}
