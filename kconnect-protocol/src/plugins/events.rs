//! Plugin Events
//!
//! Side effects plugins report to the host application.

use super::battery::BatteryState;
use super::connectivity_report::SignalStrength;
use super::mousepad::MousepadRequest;
use super::mpris::{MprisCommand, MprisPlayer};
use super::runcommand::RunCommandItem;
use super::systemvolume::{VolumeSink, VolumeUpdate};
use std::collections::HashMap;
use std::path::PathBuf;

/// A plugin event together with the device it came from
#[derive(Debug, Clone)]
pub struct PluginNotification {
    pub device_id: String,
    pub event: PluginEvent,
}

/// Something a plugin wants the host to know about or act on
#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    PingReceived {
        message: Option<String>,
    },

    /// The device wants us to ring
    FindMyPhoneRequested,

    /// Laser pointer movement
    PresenterMoved {
        dx: f64,
        dy: f64,
    },
    PresenterStopped,

    /// The device sent its full list of audio sinks
    VolumeSinksReceived {
        sinks: Vec<VolumeSink>,
    },
    /// One of the device's sinks changed
    VolumeSinkUpdated(VolumeUpdate),
    /// The device wants one of our sinks changed
    VolumeChangeRequested(VolumeUpdate),
    /// The device wants our list of sinks
    VolumeSinksRequested,

    MprisPlayersReceived {
        players: Vec<String>,
    },
    /// State of a player on the device, merged with what we knew before
    MprisPlayerUpdated {
        player: MprisPlayer,
    },
    /// Album art of a player on the device was stored at `path`
    MprisAlbumArtReceived {
        player: String,
        path: PathBuf,
    },
    /// The device wants our list of players
    MprisPlayersRequested,
    /// The device wants the state of one of our players
    MprisPlayerRequested {
        player: String,
        now_playing: bool,
        volume: bool,
        album_art_url: Option<String>,
    },
    /// The device wants one of our players controlled
    MprisActionRequested {
        player: String,
        command: MprisCommand,
    },

    /// Remote input to inject
    MousepadInput(MousepadRequest),
    /// The device confirmed input we sent
    MousepadEchoReceived(MousepadRequest),
    KeyboardStateChanged {
        active: bool,
    },

    CommandListReceived {
        commands: HashMap<String, RunCommandItem>,
    },
    CommandListRequested,
    CommandExecuteRequested {
        key: String,
    },
    /// The device wants the command editor opened
    CommandSetupRequested,

    TextShared {
        text: String,
    },
    UrlShared {
        url: String,
    },
    FileReceived {
        path: PathBuf,
        size: u64,
        /// The sender asked for the file to be opened
        open: bool,
    },
    FileTransferFailed {
        filename: String,
        reason: String,
    },
    /// Progress of a multi-file share
    ShareProgress {
        number_of_files: u64,
        total_payload_size: u64,
    },

    BatteryUpdated(BatteryState),
    BatteryRequested,

    ClipboardChanged {
        content: String,
    },

    ConnectivityUpdated {
        signals: HashMap<String, SignalStrength>,
    },
    ConnectivityRequested,
}
