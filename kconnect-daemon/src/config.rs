//! Daemon Configuration
//!
//! TOML configuration at `$XDG_CONFIG_HOME/kconnect/daemon.toml`, created
//! with defaults on first run.

use anyhow::{Context, Result};
use kconnect_protocol::discovery::DiscoveryConfig;
use kconnect_protocol::pairing::PairingConfig;
use kconnect_protocol::{DeviceType, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "daemon.toml";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub pairing: PairingSettings,

    pub paths: PathConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,

    /// desktop, laptop, phone, tablet or tv
    pub device_type: String,

    /// Device ID (generated and kept in the data directory if not set)
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP port for device connections
    #[serde(default = "default_port")]
    pub listen_port: u16,

    /// UDP discovery port
    #[serde(default = "default_port")]
    pub discovery_port: u16,

    /// Discovery broadcast interval in seconds
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval: u64,

    /// Seconds of silence before an unpaired device is forgotten
    #[serde(default = "default_device_timeout")]
    pub device_timeout: u64,

    #[serde(default = "default_true")]
    pub enable_discovery: bool,

    #[serde(default)]
    pub enable_mdns: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSettings {
    /// Seconds a pairing request waits for an answer
    #[serde(default = "default_pairing_timeout")]
    pub timeout: u64,

    /// Accept every incoming pairing request without asking
    #[serde(default)]
    pub auto_accept: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub config_dir: PathBuf,

    /// Certificate, trusted devices and device registry
    pub data_dir: PathBuf,

    /// Received files
    pub download_dir: PathBuf,
}

fn default_port() -> u16 {
    1716
}

fn default_broadcast_interval() -> u64 {
    5
}

fn default_device_timeout() -> u64 {
    30
}

fn default_pairing_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: default_port(),
            discovery_port: default_port(),
            broadcast_interval: default_broadcast_interval(),
            device_timeout: default_device_timeout(),
            enable_discovery: true,
            enable_mdns: false,
        }
    }
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            timeout: default_pairing_timeout(),
            auto_accept: false,
        }
    }
}

/// `$XDG_CONFIG_HOME/kconnect`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("kconnect")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("kconnect");

        let download_dir = dirs::download_dir().unwrap_or_else(|| data_dir.join("downloads"));

        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_type: "desktop".to_string(),
                device_id: None,
            },
            network: NetworkConfig::default(),
            pairing: PairingSettings::default(),
            paths: PathConfig {
                config_dir: default_config_dir(),
                data_dir,
                download_dir,
            },
        }
    }
}

impl Config {
    /// Load configuration from `path`, creating it with defaults if absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {:?}", path))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {:?}", path))
        } else {
            let mut config = Config::default();
            if let Some(dir) = path.parent() {
                config.paths.config_dir = dir.to_path_buf();
            }
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    pub fn device_type(&self) -> Result<DeviceType> {
        DeviceType::from_wire(&self.device.device_type)
            .with_context(|| format!("Unknown device type '{}'", self.device.device_type))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.paths.data_dir.join(kconnect_protocol::service::REGISTRY_FILE)
    }

    /// Service configuration for these settings
    pub fn service_config(&self) -> Result<ServiceConfig> {
        let mut service = ServiceConfig::new(
            self.device.name.clone(),
            self.device_type()?,
            self.paths.data_dir.clone(),
        )
        .with_download_dir(self.paths.download_dir.clone())
        .with_listen_port(self.network.listen_port)
        .with_pairing(PairingConfig {
            timeout: Duration::from_secs(self.pairing.timeout),
            ..Default::default()
        });

        if let Some(id) = &self.device.device_id {
            service = service.with_device_id(id.clone());
        }

        if self.network.enable_discovery {
            service = service
                .with_discovery(DiscoveryConfig {
                    broadcast_interval: Duration::from_secs(self.network.broadcast_interval),
                    device_timeout: Duration::from_secs(self.network.device_timeout),
                    bind_port: self.network.discovery_port,
                    ..Default::default()
                })
                .with_mdns(self.network.enable_mdns);
        } else {
            service = service.without_discovery();
        }

        Ok(service)
    }
}
