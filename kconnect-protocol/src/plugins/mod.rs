//! KDE Connect Plugin Architecture
//!
//! Plugins implement device capabilities. A device advertises which packet
//! types it can receive (`incomingCapabilities`) and send
//! (`outgoingCapabilities`) in its identity packet; each plugin handles a set
//! of incoming types and provides builders for the packets it sends.
//!
//! ## Packet Types
//!
//! Plugin packet types follow the pattern `kdeconnect.<plugin>[.<action>]`:
//! - `kdeconnect.battery` - Battery status broadcast
//! - `kdeconnect.battery.request` - Request battery status
//! - `kdeconnect.mpris` - Media player state
//! - `kdeconnect.mpris.request` - Media player commands
//!
//! ## Dispatch
//!
//! [`PluginManager`] holds one [`PluginFactory`] per plugin and maps every
//! incoming packet type to the plugin that handles it. When a device connects
//! the manager creates a [`DevicePlugins`] set for it, owned by that device's
//! worker task, so packets from one device are handled in order and plugin
//! state is never shared between devices.
//!
//! [`DevicePlugins::dispatch`] enforces pairing: capability packets from a
//! device that is not paired are rejected with `Unauthorized` and never reach
//! a handler.
//!
//! ## Side Effects
//!
//! Plugins do not talk to the desktop directly. They report what happened as
//! [`PluginEvent`]s through their [`PluginContext`] and send replies through
//! its packet sink.
//!
//! ## References
//!
//! - [Valent Protocol Reference](https://valent.andyholmes.ca/documentation/protocol.html)
//! - [KDE Connect Community Wiki](https://community.kde.org/KDEConnect)

pub mod battery;
pub mod clipboard;
pub mod connectivity_report;
mod events;
pub mod findmyphone;
pub mod mousepad;
pub mod mpris;
pub mod ping;
pub mod presenter;
pub mod runcommand;
pub mod share;
pub mod systemvolume;

pub use events::{PluginEvent, PluginNotification};

use crate::connection::PacketSink;
use crate::packet::{PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR};
use crate::transport::TlsConfig;
use crate::{Device, Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Factory trait for creating plugin instances
///
/// The factory creates a new plugin instance for each device connection.
pub trait PluginFactory: Send + Sync {
    /// Get the plugin name this factory creates
    fn name(&self) -> &str;

    /// Get incoming capabilities for this plugin type
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Get outgoing capabilities for this plugin type
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Create a new plugin instance
    fn create(&self) -> Box<dyn Plugin>;
}

/// Plugin trait for extending KDE Connect functionality
///
/// ## Packet Handling
///
/// Plugins should:
/// - Handle packets idempotently (repeated packets should not cause errors)
/// - Not depend on receiving responses to sent packets
/// - Reject malformed bodies with `InvalidPacket`; the error is logged by the
///   dispatcher and affects nothing else
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Short, lowercase identifier like "ping", "battery", "mpris"
    fn name(&self) -> &str;

    /// Downcast support, used to inspect plugin state
    fn as_any(&self) -> &dyn Any;

    /// Packet types this plugin can receive
    fn incoming_capabilities(&self) -> Vec<String>;

    /// Packet types this plugin can send
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// Initialize the plugin for a device
    ///
    /// Called once after creation, before the first packet.
    async fn init(&mut self, _device: &Device, _context: &PluginContext) -> Result<()> {
        Ok(())
    }

    /// Start the plugin
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop the plugin
    ///
    /// Called when the device disconnects.
    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle an incoming packet
    ///
    /// Only called for packets whose type is one of the plugin's incoming
    /// capabilities, from a paired device.
    async fn handle_packet(
        &mut self,
        packet: &Packet,
        device: &Device,
        context: &PluginContext,
    ) -> Result<()>;
}

/// What plugins can reach while handling packets of one device
#[derive(Clone)]
pub struct PluginContext {
    device_id: String,
    sink: Arc<dyn PacketSink>,
    events: mpsc::UnboundedSender<PluginNotification>,
    tls: TlsConfig,
    download_dir: PathBuf,
}

impl PluginContext {
    pub fn new(
        device_id: impl Into<String>,
        sink: Arc<dyn PacketSink>,
        events: mpsc::UnboundedSender<PluginNotification>,
        tls: TlsConfig,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            sink,
            events,
            tls,
            download_dir: download_dir.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Send a packet to the device
    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.sink.send_packet(&self.device_id, &packet).await
    }

    /// Report a side effect to the host
    pub fn emit(&self, event: PluginEvent) {
        let notification = PluginNotification {
            device_id: self.device_id.clone(),
            event,
        };
        if self.events.send(notification).is_err() {
            debug!("No listener for plugin events of {}", self.device_id);
        }
    }

    /// TLS configuration for payload side-streams
    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    /// Where received files are stored
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Address and size of the payload a packet advertises
    ///
    /// The payload is served on the device's IP at the advertised port.
    pub fn payload_source(&self, device: &Device, packet: &Packet) -> Result<(SocketAddr, u64)> {
        let port = packet.payload_port().ok_or_else(|| {
            ProtocolError::InvalidPacket(format!(
                "'{}' carries no payload transfer info",
                packet.packet_type
            ))
        })?;

        let size = packet
            .payload_size
            .and_then(|size| u64::try_from(size).ok())
            .ok_or_else(|| {
                ProtocolError::InvalidPacket(format!(
                    "'{}' carries no usable payload size",
                    packet.packet_type
                ))
            })?;

        let address = device
            .address
            .ok_or_else(|| ProtocolError::NotConnected(device.id().to_string()))?;

        Ok((SocketAddr::new(address.ip(), port), size))
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("device_id", &self.device_id)
            .field("download_dir", &self.download_dir)
            .finish_non_exhaustive()
    }
}

/// Result of dispatching one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A plugin handled the packet
    Handled,
    /// No plugin handles this packet type; the packet was dropped
    Unhandled,
    /// Identity and pairing packets never reach plugins
    Ignored,
}

/// Plugin registry
///
/// Holds the plugin factories and the capability map used to route packets.
/// Registration rejects duplicate plugin names and incoming capabilities that
/// another plugin already handles.
pub struct PluginManager {
    /// Registered plugin factories by name
    factories: HashMap<String, Arc<dyn PluginFactory>>,

    /// Mapping from incoming capability to plugin name
    capability_map: Arc<HashMap<String, String>>,
}

impl PluginManager {
    /// Create a new empty plugin manager
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            capability_map: Arc::new(HashMap::new()),
        }
    }

    /// Create a manager with every built-in plugin registered
    pub fn with_builtin_plugins() -> Result<Self> {
        let mut manager = Self::new();
        for factory in builtin_factories() {
            manager.register_factory(factory)?;
        }
        Ok(manager)
    }

    /// Register a plugin factory
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - A plugin factory with the same name is already registered
    /// - A capability is already handled by another plugin
    pub fn register_factory(&mut self, factory: Arc<dyn PluginFactory>) -> Result<()> {
        let name = factory.name().to_string();

        if self.factories.contains_key(&name) {
            return Err(ProtocolError::Plugin(format!(
                "Plugin factory '{}' is already registered",
                name
            )));
        }

        let capabilities = factory.incoming_capabilities();
        for capability in &capabilities {
            if let Some(existing) = self.capability_map.get(capability) {
                return Err(ProtocolError::Plugin(format!(
                    "Capability '{}' already handled by plugin '{}'",
                    capability, existing
                )));
            }
        }

        let map = Arc::make_mut(&mut self.capability_map);
        for capability in capabilities {
            map.insert(capability, name.clone());
        }

        info!("Registered plugin factory: {}", name);
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Unregister a plugin factory by name
    ///
    /// Plugin sets created before this call keep the plugin.
    pub fn unregister_factory(&mut self, name: &str) -> Option<Arc<dyn PluginFactory>> {
        Arc::make_mut(&mut self.capability_map).retain(|_, plugin_name| plugin_name != name);

        let factory = self.factories.remove(name);
        if factory.is_some() {
            info!("Unregistered plugin factory: {}", name);
        }
        factory
    }

    /// Get list of all registered plugin factory names
    pub fn list_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get all incoming capabilities from registered factories
    pub fn get_all_incoming_capabilities(&self) -> Vec<String> {
        let mut capabilities: Vec<String> = self.capability_map.keys().cloned().collect();
        capabilities.sort();
        capabilities
    }

    /// Get all outgoing capabilities from registered factories
    pub fn get_all_outgoing_capabilities(&self) -> Vec<String> {
        let mut capabilities = Vec::new();
        for factory in self.factories.values() {
            capabilities.extend(factory.outgoing_capabilities());
        }
        capabilities.sort();
        capabilities.dedup();
        capabilities
    }

    /// Check if a packet type is supported
    pub fn supports_packet_type(&self, packet_type: &str) -> bool {
        self.capability_map.contains_key(packet_type)
    }

    /// Get the plugin name that handles a packet type
    pub fn get_plugin_for_packet(&self, packet_type: &str) -> Option<&str> {
        self.capability_map.get(packet_type).map(|s| s.as_str())
    }

    /// Get number of registered plugin factories
    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }

    /// Create and start the plugins for a newly connected device
    ///
    /// Plugins are initialized right away when the device is paired, and by
    /// [`DevicePlugins::init_all`] once it becomes paired otherwise. A plugin
    /// that fails to start or initialize is left out; the others still run.
    pub async fn create_device_plugins(
        &self,
        device: &Device,
        context: PluginContext,
    ) -> DevicePlugins {
        let device_id = device.id().to_string();
        info!(
            "Creating {} plugins for device {}",
            self.factories.len(),
            device_id
        );

        let mut plugins = HashMap::new();

        for (name, factory) in &self.factories {
            debug!("Creating plugin {} for device {}", name, device_id);
            let mut plugin = factory.create();

            if let Err(e) = plugin.start().await {
                error!(
                    "Failed to start plugin {} for device {}: {}",
                    name, device_id, e
                );
                continue;
            }

            plugins.insert(name.clone(), plugin);
        }

        let mut device_plugins = DevicePlugins {
            device_id,
            plugins,
            capability_map: self.capability_map.clone(),
            context,
            initialized: false,
        };

        if device.is_paired() {
            device_plugins.init_all(device).await;
        }

        device_plugins
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Plugin instances of one connected device
pub struct DevicePlugins {
    device_id: String,
    plugins: HashMap<String, Box<dyn Plugin>>,
    capability_map: Arc<HashMap<String, String>>,
    context: PluginContext,
    initialized: bool,
}

impl DevicePlugins {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Initialize every plugin for a paired device
    ///
    /// Runs once; later calls do nothing.
    pub async fn init_all(&mut self, device: &Device) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        let mut failed = Vec::new();
        for (name, plugin) in self.plugins.iter_mut() {
            if let Err(e) = plugin.init(device, &self.context).await {
                error!(
                    "Failed to initialize plugin {} for device {}: {}",
                    name, self.device_id, e
                );
                failed.push(name.clone());
            }
        }
        for name in failed {
            self.plugins.remove(&name);
        }

        info!(
            "Initialized {} plugins for device {}",
            self.plugins.len(),
            self.device_id
        );
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Route a packet to the plugin that handles its type
    ///
    /// `device` is the registry snapshot taken when the packet is handled;
    /// its pairing status decides whether the packet may be dispatched.
    ///
    /// # Errors
    ///
    /// - `Unauthorized` if the device is not paired
    /// - the handler's error if it rejected the packet
    pub async fn dispatch(&mut self, device: &Device, packet: Packet) -> Result<DispatchOutcome> {
        let packet_type = packet.packet_type.as_str();

        if packet_type == PACKET_TYPE_IDENTITY || packet_type == PACKET_TYPE_PAIR {
            return Ok(DispatchOutcome::Ignored);
        }

        if !device.is_paired() {
            warn!(
                "Dropping '{}' from unpaired device {}",
                packet_type,
                device.id()
            );
            return Err(ProtocolError::Unauthorized {
                device_id: device.id().to_string(),
                packet_type: packet.packet_type.clone(),
            });
        }

        let Some(plugin_name) = self.capability_map.get(packet_type) else {
            debug!(
                "No plugin handles '{}' from {}, dropping",
                packet_type,
                device.id()
            );
            return Ok(DispatchOutcome::Unhandled);
        };

        let Some(plugin) = self.plugins.get_mut(plugin_name) else {
            debug!(
                "Plugin '{}' is not running for {}, dropping '{}'",
                plugin_name,
                device.id(),
                packet_type
            );
            return Ok(DispatchOutcome::Unhandled);
        };

        debug!(
            "Routing packet {} to plugin {} for device {}",
            packet_type,
            plugin_name,
            device.id()
        );

        plugin.handle_packet(&packet, device, &self.context).await?;
        Ok(DispatchOutcome::Handled)
    }

    /// Get a plugin instance by name
    pub fn plugin(&self, name: &str) -> Option<&dyn Plugin> {
        self.plugins.get(name).map(|p| p.as_ref())
    }

    /// Get a plugin instance by concrete type
    pub fn get<T: Plugin + 'static>(&self) -> Option<&T> {
        self.plugins
            .values()
            .find_map(|plugin| plugin.as_any().downcast_ref::<T>())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Stop every plugin
    pub async fn stop_all(&mut self) {
        for (name, plugin) in self.plugins.iter_mut() {
            if let Err(e) = plugin.stop().await {
                warn!(
                    "Failed to stop plugin {} for device {}: {}",
                    name, self.device_id, e
                );
            }
        }
    }
}

/// Factories of every plugin shipped with this crate
pub fn builtin_factories() -> Vec<Arc<dyn PluginFactory>> {
    vec![
        Arc::new(ping::PingPluginFactory),
        Arc::new(findmyphone::FindMyPhonePluginFactory),
        Arc::new(presenter::PresenterPluginFactory),
        Arc::new(systemvolume::SystemVolumePluginFactory),
        Arc::new(mpris::MprisPluginFactory),
        Arc::new(mousepad::MousepadPluginFactory),
        Arc::new(runcommand::RunCommandPluginFactory),
        Arc::new(share::SharePluginFactory),
        Arc::new(battery::BatteryPluginFactory),
        Arc::new(clipboard::ClipboardPluginFactory),
        Arc::new(connectivity_report::ConnectivityReportPluginFactory),
    ]
}

/// Every packet type the built-in plugins send or receive
pub fn builtin_packet_types() -> Vec<&'static str> {
    let tables: [(&[&'static str], &[&'static str]); 11] = [
        (ping::INCOMING_CAPABILITIES, ping::OUTGOING_CAPABILITIES),
        (findmyphone::INCOMING_CAPABILITIES, findmyphone::OUTGOING_CAPABILITIES),
        (presenter::INCOMING_CAPABILITIES, presenter::OUTGOING_CAPABILITIES),
        (systemvolume::INCOMING_CAPABILITIES, systemvolume::OUTGOING_CAPABILITIES),
        (mpris::INCOMING_CAPABILITIES, mpris::OUTGOING_CAPABILITIES),
        (mousepad::INCOMING_CAPABILITIES, mousepad::OUTGOING_CAPABILITIES),
        (runcommand::INCOMING_CAPABILITIES, runcommand::OUTGOING_CAPABILITIES),
        (share::INCOMING_CAPABILITIES, share::OUTGOING_CAPABILITIES),
        (battery::INCOMING_CAPABILITIES, battery::OUTGOING_CAPABILITIES),
        (clipboard::INCOMING_CAPABILITIES, clipboard::OUTGOING_CAPABILITIES),
        (
            connectivity_report::INCOMING_CAPABILITIES,
            connectivity_report::OUTGOING_CAPABILITIES,
        ),
    ];

    let mut types: Vec<&'static str> = tables
        .iter()
        .flat_map(|(incoming, outgoing)| incoming.iter().chain(outgoing.iter()).copied())
        .collect();
    types.sort_unstable();
    types.dedup();
    types
}

/// Own the `&'static str` capability tables as the `Vec<String>` the traits
/// hand out
pub(crate) fn capability_list(capabilities: &[&str]) -> Vec<String> {
    capabilities.iter().map(|c| c.to_string()).collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::{CertificateInfo, DeviceInfo, DeviceType, PairingStatus};

    /// Packet sink that records everything sent through it
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: std::sync::Mutex<Vec<(String, Packet)>>,
    }

    impl RecordingSink {
        pub(crate) fn packets(&self) -> Vec<Packet> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn send_packet(&self, device_id: &str, packet: &Packet) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((device_id.to_string(), packet.clone()));
            Ok(())
        }
    }

    pub(crate) struct Harness {
        pub(crate) context: PluginContext,
        pub(crate) sink: Arc<RecordingSink>,
        pub(crate) events: mpsc::UnboundedReceiver<PluginNotification>,
        pub(crate) device: Device,
    }

    impl Harness {
        /// Plugin events emitted so far
        pub(crate) fn drain_events(&mut self) -> Vec<PluginEvent> {
            let mut events = Vec::new();
            while let Ok(notification) = self.events.try_recv() {
                events.push(notification.event);
            }
            events
        }
    }

    pub(crate) fn paired_device(device_id: &str) -> Device {
        let mut device =
            Device::from_discovery(DeviceInfo::with_id(device_id, "Phone", DeviceType::Phone, 1716));
        device.pairing_status = PairingStatus::Paired;
        device.address = Some("127.0.0.1:1716".parse().unwrap());
        device
    }

    pub(crate) fn harness_in(download_dir: &Path) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let (event_tx, events) = mpsc::unbounded_channel();
        let tls = TlsConfig::new(&CertificateInfo::generate("desktop").unwrap()).unwrap();
        let context = PluginContext::new("dev1", sink.clone(), event_tx, tls, download_dir);

        Harness {
            context,
            sink,
            events,
            device: paired_device("dev1"),
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_in(&std::env::temp_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    struct MockPluginFactory {
        name: &'static str,
        incoming: Vec<&'static str>,
    }

    impl PluginFactory for MockPluginFactory {
        fn name(&self) -> &str {
            self.name
        }

        fn incoming_capabilities(&self) -> Vec<String> {
            capability_list(&self.incoming)
        }

        fn outgoing_capabilities(&self) -> Vec<String> {
            Vec::new()
        }

        fn create(&self) -> Box<dyn Plugin> {
            Box::new(ping::PingPlugin::new())
        }
    }

    #[test]
    fn test_plugin_manager_creation() {
        let manager = PluginManager::new();
        assert_eq!(manager.factory_count(), 0);
        assert!(manager.list_plugins().is_empty());
    }

    #[test]
    fn test_builtin_registration() {
        let manager = PluginManager::with_builtin_plugins().unwrap();
        assert_eq!(manager.factory_count(), 11);
        assert_eq!(
            manager.get_plugin_for_packet("kdeconnect.mousepad.request"),
            Some("mousepad")
        );
        assert_eq!(
            manager.get_plugin_for_packet("kdeconnect.share.request.update"),
            Some("share")
        );
        assert!(!manager.supports_packet_type("kdeconnect.pair"));
        assert!(manager
            .get_all_outgoing_capabilities()
            .contains(&"kdeconnect.battery".to_string()));
    }

    #[test]
    fn test_duplicate_plugin_registration() {
        let mut manager = PluginManager::with_builtin_plugins().unwrap();
        let result = manager.register_factory(Arc::new(ping::PingPluginFactory));
        assert!(matches!(result, Err(ProtocolError::Plugin(_))));
    }

    #[test]
    fn test_duplicate_capability_registration() {
        let mut manager = PluginManager::with_builtin_plugins().unwrap();
        let result = manager.register_factory(Arc::new(MockPluginFactory {
            name: "echo",
            incoming: vec!["kdeconnect.ping"],
        }));
        assert!(matches!(result, Err(ProtocolError::Plugin(_))));
        assert_eq!(manager.get_plugin_for_packet("kdeconnect.ping"), Some("ping"));
    }

    #[test]
    fn test_plugin_unregistration() {
        let mut manager = PluginManager::with_builtin_plugins().unwrap();
        assert!(manager.unregister_factory("ping").is_some());
        assert!(!manager.supports_packet_type("kdeconnect.ping"));
        assert!(manager.unregister_factory("ping").is_none());
    }

    #[test]
    fn test_builtin_packet_types() {
        let types = builtin_packet_types();
        for expected in [
            "kdeconnect.ping",
            "kdeconnect.mpris.request",
            "kdeconnect.mousepad.echo",
            "kdeconnect.clipboard.connect",
            "kdeconnect.connectivity_report.request",
        ] {
            assert!(types.contains(&expected), "missing {}", expected);
        }
        let mut deduped = types.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), types.len());
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_plugin() {
        let harness = harness();
        let manager = PluginManager::with_builtin_plugins().unwrap();
        let mut plugins = manager
            .create_device_plugins(&harness.device, harness.context.clone())
            .await;
        assert_eq!(plugins.len(), 11);

        let outcome = plugins
            .dispatch(&harness.device, Packet::new("kdeconnect.ping", json!({})))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(plugins.get::<ping::PingPlugin>().unwrap().pings_received(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_rejects_unpaired_device() {
        let mut harness = harness();
        let manager = PluginManager::with_builtin_plugins().unwrap();
        let mut plugins = manager
            .create_device_plugins(&harness.device, harness.context.clone())
            .await;

        let mut unpaired = harness.device.clone();
        unpaired.pairing_status = crate::PairingStatus::Unpaired;

        let packet = Packet::new("kdeconnect.mousepad.request", json!({ "dx": 5, "dy": 3 }));
        let result = plugins.dispatch(&unpaired, packet).await;

        assert!(matches!(result, Err(ProtocolError::Unauthorized { .. })));
        assert!(harness.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_ignores_identity_and_pair() {
        let harness = harness();
        let manager = PluginManager::with_builtin_plugins().unwrap();
        let mut plugins = manager
            .create_device_plugins(&harness.device, harness.context.clone())
            .await;

        for packet_type in [PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR] {
            let outcome = plugins
                .dispatch(&harness.device, Packet::new(packet_type, json!({})))
                .await
                .unwrap();
            assert_eq!(outcome, DispatchOutcome::Ignored);
        }
    }

    #[tokio::test]
    async fn test_unsupported_packet_type() {
        let harness = harness();
        let manager = PluginManager::with_builtin_plugins().unwrap();
        let mut plugins = manager
            .create_device_plugins(&harness.device, harness.context.clone())
            .await;

        let outcome = plugins
            .dispatch(&harness.device, Packet::new("vendor.custom", json!({})))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Unhandled);
    }

    #[tokio::test]
    async fn test_handler_error_is_contained() {
        let mut harness = harness();
        let manager = PluginManager::with_builtin_plugins().unwrap();
        let mut plugins = manager
            .create_device_plugins(&harness.device, harness.context.clone())
            .await;

        let bad = Packet::new("kdeconnect.battery", json!({ "currentCharge": "lots" }));
        assert!(matches!(
            plugins.dispatch(&harness.device, bad).await,
            Err(ProtocolError::InvalidPacket(_))
        ));

        let ping = Packet::new("kdeconnect.ping", json!({ "message": "still here" }));
        plugins.dispatch(&harness.device, ping).await.unwrap();
        assert!(matches!(
            harness.drain_events().as_slice(),
            [PluginEvent::PingReceived { .. }]
        ));
    }

    #[tokio::test]
    async fn test_init_waits_for_pairing() {
        let harness = harness();
        let manager = PluginManager::with_builtin_plugins().unwrap();

        let mut device = harness.device.clone();
        device.info.outgoing_capabilities = vec!["kdeconnect.battery".to_string()];
        device.pairing_status = crate::PairingStatus::Unpaired;

        let mut plugins = manager
            .create_device_plugins(&device, harness.context.clone())
            .await;
        assert!(!plugins.is_initialized());
        assert!(harness.sink.packets().is_empty());

        device.pairing_status = crate::PairingStatus::Paired;
        plugins.init_all(&device).await;
        plugins.init_all(&device).await;

        assert!(plugins.is_initialized());
        let sent = harness.sink.packets();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_type("kdeconnect.battery.request"));
    }

    #[tokio::test]
    async fn test_payload_source() {
        let harness = harness();
        let packet = Packet::new("kdeconnect.share.request", json!({ "filename": "a.txt" }))
            .with_payload_size(42)
            .with_payload_port(1739);

        let (addr, size) = harness
            .context
            .payload_source(&harness.device, &packet)
            .unwrap();
        assert_eq!(addr, "127.0.0.1:1739".parse().unwrap());
        assert_eq!(size, 42);

        let no_payload = Packet::new("kdeconnect.share.request", json!({}));
        assert!(harness
            .context
            .payload_source(&harness.device, &no_payload)
            .is_err());
    }
}
