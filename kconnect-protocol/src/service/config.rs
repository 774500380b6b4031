//! Service Configuration

use crate::connection::ReconnectionStrategy;
use crate::discovery::{DiscoveryConfig, DISCOVERY_PORT};
use crate::pairing::PairingConfig;
use crate::{DeviceInfo, DeviceType, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Registry file inside the data directory
pub const REGISTRY_FILE: &str = "devices.json";
/// Persisted device id inside the data directory
pub const DEVICE_ID_FILE: &str = "device_id";
/// Trusted peer certificates inside the data directory
pub const TRUSTED_DIR: &str = "trusted";

/// Default capacity of the service event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Configuration of a [`crate::service::ConnectService`]
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Name announced to other devices (1-32 characters)
    pub device_name: String,
    pub device_type: DeviceType,
    /// Our device id; loaded from or persisted to the data directory when unset
    pub device_id: Option<String>,
    /// Certificate, trusted certificates and device registry live here
    pub data_dir: PathBuf,
    /// Where received files are written
    pub download_dir: PathBuf,
    /// TCP port for device connections; 0 picks an ephemeral port
    pub listen_port: u16,
    pub discovery: DiscoveryConfig,
    /// Run UDP discovery; without it devices are only reached by [`connect_to`]
    ///
    /// [`connect_to`]: crate::service::ConnectService::connect_to
    pub enable_discovery: bool,
    pub pairing: PairingConfig,
    pub reconnect: ReconnectionStrategy,
    /// Events a slow subscriber may fall behind before it starts losing them
    pub event_capacity: usize,
}

impl ServiceConfig {
    pub fn new(
        device_name: impl Into<String>,
        device_type: DeviceType,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        let data_dir = data_dir.into();
        Self {
            device_name: device_name.into(),
            device_type,
            device_id: None,
            download_dir: data_dir.join("downloads"),
            data_dir,
            listen_port: DISCOVERY_PORT,
            discovery: DiscoveryConfig::default(),
            enable_discovery: true,
            pairing: PairingConfig::default(),
            reconnect: ReconnectionStrategy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self.enable_discovery = true;
        self
    }

    /// Advertise over mDNS in addition to UDP broadcast
    pub fn with_mdns(mut self, enabled: bool) -> Self {
        self.discovery.enable_mdns = enabled;
        self
    }

    pub fn without_discovery(mut self) -> Self {
        self.enable_discovery = false;
        self
    }

    pub fn with_pairing(mut self, pairing: PairingConfig) -> Self {
        self.pairing = pairing;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectionStrategy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(REGISTRY_FILE)
    }

    pub fn trusted_dir(&self) -> PathBuf {
        self.data_dir.join(TRUSTED_DIR)
    }

    /// Our device id: configured, persisted, or newly generated and persisted
    pub async fn resolve_device_id(&self) -> Result<String> {
        if let Some(id) = &self.device_id {
            return Ok(id.clone());
        }

        let path = self.data_dir.join(DEVICE_ID_FILE);
        if let Some(id) = read_device_id(&path).await? {
            return Ok(id);
        }

        let id = DeviceInfo::generate_device_id();
        tokio::fs::create_dir_all(&self.data_dir).await?;
        tokio::fs::write(&path, &id).await?;
        info!("Generated device id {}", id);
        Ok(id)
    }
}

async fn read_device_id(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let id = content.trim();
            Ok((!id.is_empty()).then(|| id.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::new("Desktop", DeviceType::Desktop, "/tmp/kc");
        assert_eq!(config.listen_port, 1716);
        assert!(config.enable_discovery);
        assert_eq!(config.download_dir, PathBuf::from("/tmp/kc/downloads"));
        assert_eq!(config.registry_path(), PathBuf::from("/tmp/kc/devices.json"));
        assert_eq!(config.trusted_dir(), PathBuf::from("/tmp/kc/trusted"));
    }

    #[tokio::test]
    async fn test_device_id_is_persisted() {
        let dir = TempDir::new().unwrap();
        let config = ServiceConfig::new("Desktop", DeviceType::Desktop, dir.path());

        let first = config.resolve_device_id().await.unwrap();
        let second = config.resolve_device_id().await.unwrap();
        assert_eq!(first, second);

        let configured = config.with_device_id("fixed").resolve_device_id().await.unwrap();
        assert_eq!(configured, "fixed");
    }
}
