//! Device Registry
//!
//! Tracks every device we know about: connected ones, paired ones and ones
//! that are reachable but not paired.
//!
//! ## Device Lifecycle
//!
//! 1. **Discovered**: first identity received (UDP or TCP) creates an
//!    Unpaired / Disconnected record
//! 2. **Connected**: TLS session established
//! 3. **Paired**: pairing handshake completed, certificate trusted
//! 4. **Evicted**: discovery timeout while neither connected nor paired, or
//!    explicit removal
//!
//! Reachability is written by the transport side, pairing status only by
//! [`crate::pairing::PairingService`]. Unpairing never deletes a record.
//!
//! ## Persistence
//!
//! The registry is saved as JSON so paired devices are remembered across
//! restarts. Session data (connection state, pending requests, the presented
//! certificate) is not restored.

use crate::{DeviceInfo, PairingStatus, ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Device connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Last connection attempt gave up after retrying
    Failed,
}

impl ConnectionState {
    /// Check if device is connected
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if device is reachable (connected or connecting)
    pub fn is_reachable(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Connecting
        )
    }
}

/// Complete device state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Identity as last announced by the device
    #[serde(flatten)]
    pub info: DeviceInfo,

    pub connection_state: ConnectionState,

    pub pairing_status: PairingStatus,

    /// Last time the device was heard from (UNIX seconds)
    pub last_seen: i64,

    /// Last time a session was established (UNIX seconds)
    pub last_connected: Option<i64>,

    /// Address the device is reachable at
    pub address: Option<SocketAddr>,

    /// SHA-256 fingerprint of the certificate presented on the current
    /// or last session
    pub certificate_fingerprint: Option<String>,

    /// DER certificate presented on the current session
    #[serde(skip)]
    pub certificate_data: Option<Vec<u8>>,
}

impl Device {
    /// Create a new device from an identity
    pub fn from_discovery(info: DeviceInfo) -> Self {
        Self {
            info,
            connection_state: ConnectionState::Disconnected,
            pairing_status: PairingStatus::Unpaired,
            last_seen: now(),
            last_connected: None,
            address: None,
            certificate_fingerprint: None,
            certificate_data: None,
        }
    }

    /// Get device ID
    pub fn id(&self) -> &str {
        &self.info.device_id
    }

    /// Get device name
    pub fn name(&self) -> &str {
        &self.info.device_name
    }

    /// Check if device is currently connected
    pub fn is_connected(&self) -> bool {
        self.connection_state.is_connected()
    }

    /// Check if device is paired
    pub fn is_paired(&self) -> bool {
        self.pairing_status == PairingStatus::Paired
    }

    /// Check if device is reachable
    pub fn is_reachable(&self) -> bool {
        self.connection_state.is_reachable()
    }

    /// Update last seen timestamp
    pub fn update_last_seen(&mut self) {
        self.last_seen = now();
    }

    fn mark_connected(&mut self, address: SocketAddr) {
        self.connection_state = ConnectionState::Connected;
        self.address = Some(address);
        self.last_connected = Some(now());
        self.update_last_seen();
        info!(
            "Device {} ({}) connected at {}",
            self.id(),
            self.name(),
            address
        );
    }

    fn mark_disconnected(&mut self) {
        self.connection_state = ConnectionState::Disconnected;
        self.certificate_data = None;
        info!("Device {} ({}) disconnected", self.id(), self.name());
    }

    /// Check if device has a specific incoming capability
    pub fn has_incoming_capability(&self, capability: &str) -> bool {
        self.info
            .incoming_capabilities
            .iter()
            .any(|c| c == capability)
    }

    /// Check if device has a specific outgoing capability
    pub fn has_outgoing_capability(&self, capability: &str) -> bool {
        self.info
            .outgoing_capabilities
            .iter()
            .any(|c| c == capability)
    }

    /// Get time since last seen in seconds
    pub fn seconds_since_last_seen(&self) -> i64 {
        (now() - self.last_seen).max(0)
    }
}

/// Registry of all known devices
pub struct DeviceManager {
    devices: HashMap<String, Device>,

    /// Where the registry is persisted, if anywhere
    registry_path: Option<PathBuf>,
}

impl DeviceManager {
    /// Create a registry persisted at `registry_path`, loading what is there
    pub fn new(registry_path: impl Into<PathBuf>) -> Result<Self> {
        let registry_path = registry_path.into();

        if let Some(parent) = registry_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut manager = Self {
            devices: HashMap::new(),
            registry_path: Some(registry_path),
        };

        manager.load_registry()?;

        Ok(manager)
    }

    /// Create a registry that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            devices: HashMap::new(),
            registry_path: None,
        }
    }

    /// Insert or replace a device record
    pub fn add_device(&mut self, device: Device) {
        debug!("Adding device: {} ({})", device.name(), device.id());
        self.devices.insert(device.id().to_string(), device);
    }

    /// Record an identity; returns `true` if the device was not known
    ///
    /// Existing records keep their pairing and connection state.
    pub fn upsert_from_identity(&mut self, info: DeviceInfo, address: Option<SocketAddr>) -> bool {
        match self.devices.get_mut(&info.device_id) {
            Some(device) => {
                device.info = info;
                if address.is_some() && !device.is_connected() {
                    device.address = address;
                }
                device.update_last_seen();
                false
            }
            None => {
                info!(
                    "New device: {} ({}, {})",
                    info.device_name, info.device_id, info.device_type
                );
                let mut device = Device::from_discovery(info);
                device.address = address;
                self.add_device(device);
                true
            }
        }
    }

    /// Record an unauthenticated discovery announcement; returns `true` if
    /// the device was not known
    ///
    /// A connected device keeps the identity its session presented and only
    /// has its last-seen time refreshed.
    pub fn record_announcement(&mut self, info: DeviceInfo, address: SocketAddr) -> bool {
        match self.devices.get_mut(&info.device_id) {
            Some(device) if device.is_connected() => {
                device.update_last_seen();
                false
            }
            _ => self.upsert_from_identity(info, Some(address)),
        }
    }

    /// Get a device by ID
    pub fn get_device(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    /// Cloned snapshot of one device
    pub fn snapshot(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).cloned()
    }

    /// Remove a device by ID
    pub fn remove_device(&mut self, device_id: &str) -> Option<Device> {
        info!("Removing device: {}", device_id);
        self.devices.remove(device_id)
    }

    /// Remove a device that timed out, unless it is connected or paired
    pub fn evict_if_stale(&mut self, device_id: &str) -> Option<Device> {
        let stale = self
            .devices
            .get(device_id)
            .is_some_and(|d| !d.is_connected() && !d.is_paired());

        if stale {
            debug!("Evicting stale device {}", device_id);
            self.devices.remove(device_id)
        } else {
            None
        }
    }

    /// Check if a device exists
    pub fn has_device(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// Get all devices
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Get all connected devices
    pub fn connected_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(|d| d.is_connected())
    }

    /// Get all paired devices
    pub fn paired_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(|d| d.is_paired())
    }

    /// Get count of devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_mut(&mut self, device_id: &str) -> Result<&mut Device> {
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))
    }

    /// Mark a device as being connected to
    pub fn mark_connecting(&mut self, device_id: &str) -> Result<()> {
        let device = self.device_mut(device_id)?;
        if !device.is_connected() {
            device.connection_state = ConnectionState::Connecting;
        }
        Ok(())
    }

    /// Mark device as connected
    pub fn mark_connected(&mut self, device_id: &str, address: SocketAddr) -> Result<()> {
        self.device_mut(device_id)?.mark_connected(address);
        Ok(())
    }

    /// Mark device as disconnected; pairing status is untouched
    pub fn mark_disconnected(&mut self, device_id: &str) -> Result<()> {
        self.device_mut(device_id)?.mark_disconnected();
        Ok(())
    }

    /// Mark the last connection attempt as failed
    pub fn mark_failed(&mut self, device_id: &str) -> Result<()> {
        let device = self.device_mut(device_id)?;
        if !device.is_connected() {
            device.connection_state = ConnectionState::Failed;
            warn!("Device {} ({}) connection failed", device.id(), device.name());
        }
        Ok(())
    }

    /// Record the certificate presented on the current session
    pub fn set_peer_certificate(
        &mut self,
        device_id: &str,
        certificate: Vec<u8>,
        fingerprint: String,
    ) -> Result<()> {
        let device = self.device_mut(device_id)?;
        device.certificate_fingerprint = Some(fingerprint);
        device.certificate_data = Some(certificate);
        Ok(())
    }

    /// Update pairing status; only the pairing service calls this
    pub(crate) fn set_pairing_status(&mut self, device_id: &str, status: PairingStatus) -> Result<()> {
        let device = self.device_mut(device_id)?;
        if device.pairing_status != status {
            debug!(
                "Device {} pairing status {:?} -> {:?}",
                device_id, device.pairing_status, status
            );
            device.pairing_status = status;
        }
        Ok(())
    }

    /// Save device registry to disk
    pub fn save_registry(&self) -> Result<()> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&self.devices)?;
        fs::write(path, json)?;
        debug!("Saved device registry to {:?}", path);
        Ok(())
    }

    /// Load device registry from disk
    ///
    /// Loaded devices start disconnected, and pairing requests that were in
    /// flight when the registry was saved are dropped.
    pub fn load_registry(&mut self) -> Result<()> {
        let Some(path) = &self.registry_path else {
            return Ok(());
        };

        if !path.exists() {
            debug!("No existing registry file at {:?}", path);
            return Ok(());
        }

        let json = fs::read_to_string(path)?;
        let mut devices: HashMap<String, Device> = serde_json::from_str(&json)?;

        for device in devices.values_mut() {
            device.connection_state = ConnectionState::Disconnected;
            if !device.is_paired() {
                device.pairing_status = PairingStatus::Unpaired;
            }
        }

        info!("Loaded {} devices from registry", devices.len());
        self.devices = devices;
        Ok(())
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceType;
    use tempfile::TempDir;

    fn phone(id: &str) -> DeviceInfo {
        DeviceInfo::with_id(id, "Phone", DeviceType::Phone, 1716)
    }

    fn addr() -> SocketAddr {
        "192.168.1.100:1716".parse().unwrap()
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Failed.is_connected());
        assert!(ConnectionState::Connecting.is_reachable());
        assert!(!ConnectionState::Disconnected.is_reachable());
    }

    #[test]
    fn test_new_identity_creates_unpaired_disconnected_record() {
        let mut manager = DeviceManager::in_memory();
        assert!(manager.upsert_from_identity(phone("dev1"), Some(addr())));

        let device = manager.get_device("dev1").unwrap();
        assert_eq!(device.connection_state, ConnectionState::Disconnected);
        assert_eq!(device.pairing_status, PairingStatus::Unpaired);
        assert_eq!(device.address, Some(addr()));
    }

    #[test]
    fn test_upsert_keeps_state() {
        let mut manager = DeviceManager::in_memory();
        manager.upsert_from_identity(phone("dev1"), None);
        manager.mark_connected("dev1", addr()).unwrap();
        manager
            .set_pairing_status("dev1", PairingStatus::Paired)
            .unwrap();

        let renamed = DeviceInfo::with_id("dev1", "Renamed", DeviceType::Phone, 1716);
        assert!(!manager.upsert_from_identity(renamed, Some("10.0.0.2:1716".parse().unwrap())));

        let device = manager.get_device("dev1").unwrap();
        assert_eq!(device.name(), "Renamed");
        assert!(device.is_connected());
        assert!(device.is_paired());
        assert_eq!(device.address, Some(addr()));
    }

    #[test]
    fn test_announcement_does_not_override_session_identity() {
        let mut manager = DeviceManager::in_memory();
        manager.upsert_from_identity(phone("dev1"), None);
        manager.mark_connected("dev1", addr()).unwrap();

        let spoofed = DeviceInfo::with_id("dev1", "Spoofed", DeviceType::Tv, 1716);
        assert!(!manager.record_announcement(spoofed.clone(), "10.0.0.9:1716".parse().unwrap()));
        let device = manager.get_device("dev1").unwrap();
        assert_eq!(device.name(), "Phone");
        assert_eq!(device.address, Some(addr()));

        manager.mark_disconnected("dev1").unwrap();
        manager.record_announcement(spoofed, "10.0.0.9:1716".parse().unwrap());
        let device = manager.get_device("dev1").unwrap();
        assert_eq!(device.name(), "Spoofed");
        assert_eq!(device.address, Some("10.0.0.9:1716".parse().unwrap()));
    }

    #[test]
    fn test_disconnect_keeps_pairing() {
        let mut manager = DeviceManager::in_memory();
        manager.upsert_from_identity(phone("dev1"), None);
        manager.mark_connected("dev1", addr()).unwrap();
        manager
            .set_peer_certificate("dev1", vec![1, 2, 3], "ab".into())
            .unwrap();
        manager
            .set_pairing_status("dev1", PairingStatus::Paired)
            .unwrap();

        manager.mark_disconnected("dev1").unwrap();
        let device = manager.get_device("dev1").unwrap();
        assert!(!device.is_connected());
        assert!(device.is_paired());
        assert!(device.certificate_data.is_none());
        assert_eq!(device.certificate_fingerprint.as_deref(), Some("ab"));
    }

    #[test]
    fn test_unknown_device_errors() {
        let mut manager = DeviceManager::in_memory();
        assert!(matches!(
            manager.mark_connected("ghost", addr()),
            Err(ProtocolError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_evict_only_unconnected_unpaired() {
        let mut manager = DeviceManager::in_memory();
        manager.upsert_from_identity(phone("idle"), None);
        manager.upsert_from_identity(phone("online"), None);
        manager.upsert_from_identity(phone("trusted"), None);
        manager.mark_connected("online", addr()).unwrap();
        manager
            .set_pairing_status("trusted", PairingStatus::Paired)
            .unwrap();

        assert!(manager.evict_if_stale("idle").is_some());
        assert!(manager.evict_if_stale("online").is_none());
        assert!(manager.evict_if_stale("trusted").is_none());
        assert_eq!(manager.device_count(), 2);
    }

    #[test]
    fn test_connected_and_paired_filters() {
        let mut manager = DeviceManager::in_memory();
        manager.upsert_from_identity(phone("a"), None);
        manager.upsert_from_identity(phone("b"), None);
        manager.mark_connected("a", addr()).unwrap();
        manager.set_pairing_status("b", PairingStatus::Paired).unwrap();

        assert_eq!(manager.connected_devices().count(), 1);
        assert_eq!(manager.paired_devices().count(), 1);
    }

    #[test]
    fn test_persistence_resets_session_state() {
        let temp_dir = TempDir::new().unwrap();
        let registry_path = temp_dir.path().join("devices").join("registry.json");

        {
            let mut manager = DeviceManager::new(&registry_path).unwrap();
            manager.upsert_from_identity(phone("paired"), None);
            manager.upsert_from_identity(phone("pending"), None);
            manager.mark_connected("paired", addr()).unwrap();
            manager
                .set_pairing_status("paired", PairingStatus::Paired)
                .unwrap();
            manager
                .set_pairing_status("pending", PairingStatus::RequestedIncoming)
                .unwrap();
            manager.save_registry().unwrap();
        }

        let manager = DeviceManager::new(&registry_path).unwrap();
        assert_eq!(manager.device_count(), 2);

        let paired = manager.get_device("paired").unwrap();
        assert!(paired.is_paired());
        assert_eq!(paired.connection_state, ConnectionState::Disconnected);

        let pending = manager.get_device("pending").unwrap();
        assert_eq!(pending.pairing_status, PairingStatus::Unpaired);
    }
}
