//! Device Communication Service
//!
//! The host-facing boundary of the crate. A host (desktop shell, daemon, CLI)
//! drives devices only through [`DeviceCommunicationService`] and learns about
//! them from the [`ServiceEvent`] stream returned by `subscribe`.
//!
//! [`ConnectService`] is the implementation: it owns discovery, connections,
//! pairing and plugin dispatch, and is started and stopped explicitly.
//!
//! ```no_run
//! use kconnect_protocol::service::{ConnectService, DeviceCommunicationService, ServiceConfig};
//! use kconnect_protocol::DeviceType;
//!
//! # async fn run() -> kconnect_protocol::Result<()> {
//! let config = ServiceConfig::new("My Desktop", DeviceType::Desktop, "/tmp/kconnect");
//! let service = ConnectService::new(config).await?;
//! let mut events = service.subscribe();
//! service.start().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod connect;
mod events;

pub use config::{
    ServiceConfig, DEFAULT_EVENT_CAPACITY, DEVICE_ID_FILE, REGISTRY_FILE, TRUSTED_DIR,
};
pub use connect::ConnectService;
pub use events::ServiceEvent;

use crate::plugins::battery::{self, BatteryState};
use crate::plugins::mousepad::{self, MousepadRequest};
use crate::plugins::mpris::{self, MprisCommand};
use crate::plugins::systemvolume::{self, VolumeUpdate};
use crate::plugins::{clipboard, findmyphone, ping, presenter, runcommand, share};
use crate::{Device, Packet, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

/// Operations a host performs on devices
///
/// Every packet-sending operation fails with `NotPaired` for a device that
/// is not paired and `NotConnected` when no session to it is up.
#[async_trait]
pub trait DeviceCommunicationService: Send + Sync {
    /// Devices with a live session
    async fn connected_devices(&self) -> Vec<Device>;

    async fn paired_devices(&self) -> Vec<Device>;

    /// Every known device, reachable or not
    async fn devices(&self) -> Vec<Device>;

    async fn device(&self, device_id: &str) -> Option<Device>;

    /// Announce ourselves now instead of waiting for the next interval
    async fn rebroadcast(&self);

    /// Open a session to a known device at its last address
    async fn connect(&self, device_id: &str) -> Result<()>;

    async fn disconnect(&self, device_id: &str) -> Result<()>;

    async fn request_pairing(&self, device_id: &str) -> Result<()>;

    /// Accept a pending request from the device
    async fn accept_pairing(&self, device_id: &str) -> Result<()>;

    async fn reject_pairing(&self, device_id: &str) -> Result<()>;

    async fn unpair(&self, device_id: &str) -> Result<()>;

    /// Key both users compare before accepting a pairing
    async fn verification_key(&self, device_id: &str) -> Result<String>;

    /// Send a capability packet to a paired device
    async fn send_packet(&self, device_id: &str, packet: Packet) -> Result<()>;

    /// Offer a file to a paired device, asking it to open the file once
    /// received when `open` is set
    ///
    /// Returns once the offer is sent; the payload is served in the background.
    async fn send_file(&self, device_id: &str, path: &Path, open: bool) -> Result<()>;

    /// Offer several files as one share
    ///
    /// The device first learns the file count and total size, then gets the
    /// files one after another. Returns once every file was found and the
    /// share announced.
    async fn send_files(&self, device_id: &str, paths: &[PathBuf], open: bool) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent>;

    /// Stop all activity and persist the device registry
    async fn shutdown(&self);

    async fn send_ping(&self, device_id: &str, message: Option<String>) -> Result<()> {
        self.send_packet(device_id, ping::create_ping(message)).await
    }

    /// Make the device ring
    async fn find_device(&self, device_id: &str) -> Result<()> {
        self.send_packet(device_id, findmyphone::create_find_request())
            .await
    }

    async fn presenter_move(&self, device_id: &str, dx: f64, dy: f64) -> Result<()> {
        self.send_packet(device_id, presenter::create_move(dx, dy))
            .await
    }

    async fn presenter_stop(&self, device_id: &str) -> Result<()> {
        self.send_packet(device_id, presenter::create_stop()).await
    }

    async fn request_volume_sinks(&self, device_id: &str) -> Result<()> {
        self.send_packet(device_id, systemvolume::create_sinks_request())
            .await
    }

    async fn set_volume(&self, device_id: &str, update: &VolumeUpdate) -> Result<()> {
        self.send_packet(device_id, systemvolume::create_volume_request(update)?)
            .await
    }

    async fn request_players(&self, device_id: &str) -> Result<()> {
        self.send_packet(device_id, mpris::create_player_list_request())
            .await
    }

    async fn mpris_command(
        &self,
        device_id: &str,
        player: &str,
        command: MprisCommand,
    ) -> Result<()> {
        self.send_packet(device_id, mpris::create_command(player, command))
            .await
    }

    async fn send_mouse_input(&self, device_id: &str, request: &MousepadRequest) -> Result<()> {
        self.send_packet(device_id, mousepad::create_request(request)?)
            .await
    }

    async fn request_commands(&self, device_id: &str) -> Result<()> {
        self.send_packet(device_id, runcommand::create_command_list_request())
            .await
    }

    async fn run_command(&self, device_id: &str, key: &str) -> Result<()> {
        self.send_packet(device_id, runcommand::create_execute(key))
            .await
    }

    async fn share_text(&self, device_id: &str, text: &str) -> Result<()> {
        self.send_packet(device_id, share::create_text(text)).await
    }

    async fn share_url(&self, device_id: &str, url: &str) -> Result<()> {
        self.send_packet(device_id, share::create_url(url)).await
    }

    /// Report our battery state, as read by the host
    async fn send_battery(&self, device_id: &str, state: &BatteryState) -> Result<()> {
        self.send_packet(device_id, battery::create_battery(state)?)
            .await
    }

    async fn request_battery(&self, device_id: &str) -> Result<()> {
        self.send_packet(device_id, battery::create_battery_request())
            .await
    }

    async fn send_clipboard(&self, device_id: &str, content: &str) -> Result<()> {
        self.send_packet(device_id, clipboard::create_clipboard(content))
            .await
    }
}
