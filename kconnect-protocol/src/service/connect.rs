//! Connect Service
//!
//! Wires discovery, connections, pairing and plugins together:
//!
//! - discovery feeds the registry and opens connections to announced devices
//! - each connected device gets a worker task owning its plugin instances;
//!   the session's packets are queued to it in receipt order
//! - `kdeconnect.pair` packets go to the pairing service, never to plugins
//! - everything the host should know is re-emitted as a [`ServiceEvent`]

use super::{DeviceCommunicationService, ServiceConfig, ServiceEvent};
use crate::connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, PacketSink};
use crate::discovery::{DiscoveryEvent, DiscoveryService};
use crate::packet::{PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR};
use crate::pairing::{CertificateInfo, PairingEvent, PairingService, TrustStore};
use crate::plugins::{
    share, DevicePlugins, DispatchOutcome, PluginContext, PluginManager, PluginNotification,
};
use crate::transport::{FileTransferInfo, PayloadServer};
use crate::{Device, DeviceInfo, DeviceManager, Packet, PairingStatus, ProtocolError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time a worker gets to drain its queue on shutdown
const WORKER_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Created,
    Running,
    Stopped,
}

enum WorkerMessage {
    Packet(Packet),
    /// The device became paired; initialize its plugins
    Paired,
}

/// Per-device dispatch task
struct DeviceWorker {
    queue: mpsc::UnboundedSender<WorkerMessage>,
    task: JoinHandle<()>,
}

impl DeviceWorker {
    fn spawn(mut plugins: DevicePlugins, devices: Arc<RwLock<DeviceManager>>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let device_id = plugins.device_id().to_string();

            while let Some(message) = rx.recv().await {
                let Some(device) = devices.read().await.snapshot(&device_id) else {
                    warn!("Device {} left the registry, dropping its packets", device_id);
                    continue;
                };

                match message {
                    WorkerMessage::Paired => plugins.init_all(&device).await,
                    WorkerMessage::Packet(packet) => {
                        let packet_type = packet.packet_type.clone();
                        let dispatch = AssertUnwindSafe(plugins.dispatch(&device, packet));

                        match dispatch.catch_unwind().await {
                            Ok(Ok(DispatchOutcome::Handled)) => {}
                            Ok(Ok(outcome)) => {
                                debug!("'{}' from {}: {:?}", packet_type, device_id, outcome)
                            }
                            Ok(Err(e)) => {
                                warn!("Failed to handle '{}' from {}: {}", packet_type, device_id, e)
                            }
                            Err(_) => error!(
                                "Plugin panicked handling '{}' from {}",
                                packet_type, device_id
                            ),
                        }
                    }
                }
            }

            plugins.stop_all().await;
            debug!("Worker for {} finished", device_id);
        });

        Self { queue, task }
    }

    fn send(&self, message: WorkerMessage) -> bool {
        self.queue.send(message).is_ok()
    }

    /// Close the queue and let queued packets drain
    async fn shutdown(self) {
        let DeviceWorker { queue, mut task } = self;
        drop(queue);
        if tokio::time::timeout(WORKER_DRAIN_GRACE, &mut task)
            .await
            .is_err()
        {
            task.abort();
        }
    }
}

/// Routes events of the inner services
#[derive(Clone)]
struct Router {
    devices: Arc<RwLock<DeviceManager>>,
    connections: Arc<ConnectionManager>,
    pairing: Arc<PairingService>,
    plugins: Arc<PluginManager>,
    workers: Arc<Mutex<HashMap<String, DeviceWorker>>>,
    event_tx: broadcast::Sender<ServiceEvent>,
    plugin_tx: mpsc::UnboundedSender<PluginNotification>,
    download_dir: PathBuf,
}

impl Router {
    fn emit(&self, event: ServiceEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    async fn save_registry(&self) {
        if let Err(e) = self.devices.read().await.save_registry() {
            error!("Failed to save device registry: {}", e);
        }
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { device_info, .. } => {
                self.on_connected(&device_info.device_id).await
            }
            ConnectionEvent::Disconnected { device_id, reason } => {
                self.pairing.on_device_disconnected(&device_id).await;
                if let Some(worker) = self.workers.lock().await.remove(&device_id) {
                    worker.shutdown().await;
                }
                self.emit(ServiceEvent::DeviceDisconnected { device_id, reason });
            }
            ConnectionEvent::PacketReceived { device_id, packet } => {
                self.on_packet(&device_id, packet).await
            }
            ConnectionEvent::ConnectionError { device_id, message } => {
                self.emit(ServiceEvent::ConnectionFailed {
                    device_id,
                    reason: message,
                });
            }
            ConnectionEvent::ManagerStarted { port } => {
                debug!("Connection manager listening on {}", port)
            }
            ConnectionEvent::ManagerStopped => debug!("Connection manager stopped"),
        }
    }

    async fn on_connected(&self, device_id: &str) {
        if let Err(e) = self.pairing.on_device_connected(device_id).await {
            warn!("Refusing session from {}: {}", device_id, e);
            // nothing from the refused session may reach the old worker
            let worker = self.workers.lock().await.remove(device_id);
            let _ = self.connections.disconnect(device_id).await;
            if let Some(worker) = worker {
                worker.shutdown().await;
            }
            self.emit(ServiceEvent::ConnectionFailed {
                device_id: Some(device_id.to_string()),
                reason: e.to_string(),
            });
            return;
        }

        let Some(device) = self.devices.read().await.snapshot(device_id) else {
            return;
        };

        self.ensure_worker(&device).await;
        self.save_registry().await;
        self.emit(ServiceEvent::DeviceConnected { device });
    }

    /// Give a connected device a worker; a replacing session keeps the
    /// existing one and its plugin state
    async fn ensure_worker(&self, device: &Device) {
        let mut workers = self.workers.lock().await;

        if let Some(worker) = workers.get(device.id()) {
            if device.is_paired() {
                worker.send(WorkerMessage::Paired);
            }
            return;
        }

        let context = PluginContext::new(
            device.id(),
            self.connections.clone() as Arc<dyn PacketSink>,
            self.plugin_tx.clone(),
            self.connections.tls_config().clone(),
            self.download_dir.clone(),
        );
        let plugins = self.plugins.create_device_plugins(device, context).await;
        workers.insert(
            device.id().to_string(),
            DeviceWorker::spawn(plugins, self.devices.clone()),
        );
    }

    async fn on_packet(&self, device_id: &str, packet: Packet) {
        if packet.is_type(PACKET_TYPE_PAIR) {
            if let Err(e) = self.pairing.handle_pair_packet(device_id, &packet).await {
                warn!("Pair packet from {} rejected: {}", device_id, e);
            }
            return;
        }

        if packet.is_type(PACKET_TYPE_IDENTITY) {
            debug!("Ignoring identity packet on session with {}", device_id);
            return;
        }

        let packet_type = packet.packet_type.clone();
        let queued = match self.workers.lock().await.get(device_id) {
            Some(worker) => worker.send(WorkerMessage::Packet(packet)),
            None => false,
        };
        if !queued {
            warn!("No worker for {}, dropping '{}'", device_id, packet_type);
        }
    }

    async fn on_discovery_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::DeviceDiscovered { info, address }
            | DiscoveryEvent::DeviceUpdated { info, address } => {
                self.on_announced(info, address).await
            }
            DiscoveryEvent::DeviceTimeout { device_id } => {
                let evicted = self.devices.write().await.evict_if_stale(&device_id);
                if evicted.is_some() {
                    info!("Forgetting unreachable device {}", device_id);
                    self.save_registry().await;
                    self.emit(ServiceEvent::DeviceLost { device_id });
                }
            }
            DiscoveryEvent::ServiceStarted { port } => debug!("Discovery on UDP port {}", port),
            DiscoveryEvent::ServiceStopped => debug!("Discovery stopped"),
        }
    }

    async fn on_announced(&self, info: DeviceInfo, address: SocketAddr) {
        let device_id = info.device_id.clone();

        let (is_new, device) = {
            let mut devices = self.devices.write().await;
            let is_new = devices.record_announcement(info.clone(), address);
            (is_new, devices.snapshot(&device_id))
        };

        if is_new {
            if let Some(device) = device {
                self.emit(ServiceEvent::DeviceDiscovered { device });
            }
        }

        if self.connections.has_connection(&device_id).await {
            return;
        }

        let connections = self.connections.clone();
        tokio::spawn(async move {
            // failures are reported as ConnectionError events
            if let Err(e) = connections.connect(info, address).await {
                debug!("Connecting to {} failed: {}", device_id, e);
            }
        });
    }

    async fn on_pairing_event(&self, event: PairingEvent) {
        if let PairingEvent::StatusChanged { device_id, status } = &event {
            self.save_registry().await;

            match status {
                PairingStatus::Paired => {
                    let device = self.devices.read().await.snapshot(device_id);
                    if let Some(device) = device.filter(Device::is_connected) {
                        self.ensure_worker(&device).await;
                    }
                }
                PairingStatus::Unpaired => {
                    // plugin state of the old pairing is dropped
                    let worker = self.workers.lock().await.remove(device_id);
                    if let Some(worker) = worker {
                        worker.shutdown().await;
                    }
                    let device = self.devices.read().await.snapshot(device_id);
                    if let Some(device) = device.filter(Device::is_connected) {
                        self.ensure_worker(&device).await;
                    }
                }
                _ => {}
            }
        }

        self.emit(ServiceEvent::Pairing(event));
    }
}

/// Bind a payload server for `info` and send the offer `packet` with its port
async fn offer_file(
    connections: &ConnectionManager,
    device_id: &str,
    info: &FileTransferInfo,
    packet: Packet,
) -> Result<PayloadServer> {
    let server = PayloadServer::bind(connections.tls_config()).await?;
    let packet = packet.with_payload_port(server.port());
    connections.send_packet(device_id, &packet).await?;
    info!(
        "Offering '{}' ({} bytes) to {} on port {}",
        info.filename,
        info.size,
        device_id,
        server.port()
    );
    Ok(server)
}

/// KDE Connect compatible device communication service
///
/// Construct with [`ConnectService::new`], then [`start`](Self::start). A
/// stopped service cannot be started again.
pub struct ConnectService {
    config: ServiceConfig,
    certificate: Arc<CertificateInfo>,
    router: Router,
    plugin_rx: Mutex<Option<mpsc::UnboundedReceiver<PluginNotification>>>,
    discovery: Mutex<Option<DiscoveryService>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<RunState>,
}

impl ConnectService {
    /// Load or create our identity and persisted state
    ///
    /// Nothing touches the network until [`start`](Self::start).
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        let device_id = config.resolve_device_id().await?;
        info!("Initializing service for device {}", device_id);

        let certificate = Arc::new(CertificateInfo::load_or_generate(
            &device_id,
            &config.data_dir,
        )?);
        let trust_store = TrustStore::open(config.trusted_dir())?;
        let devices = Arc::new(RwLock::new(DeviceManager::new(config.registry_path())?));
        let plugins = Arc::new(PluginManager::with_builtin_plugins()?);

        let identity = DeviceInfo::with_id(
            device_id,
            config.device_name.clone(),
            config.device_type,
            config.listen_port,
        )
        .with_incoming_capabilities(plugins.get_all_incoming_capabilities())
        .with_outgoing_capabilities(plugins.get_all_outgoing_capabilities());

        let connections = Arc::new(ConnectionManager::new(
            &certificate,
            identity,
            devices.clone(),
            ConnectionConfig {
                listen_port: config.listen_port,
                reconnect: config.reconnect.clone(),
            },
        )?);

        let pairing = Arc::new(
            PairingService::new(
                certificate.clone(),
                trust_store,
                devices.clone(),
                connections.clone() as Arc<dyn PacketSink>,
                config.pairing.clone(),
            )
            .await?,
        );

        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (plugin_tx, plugin_rx) = mpsc::unbounded_channel();

        Ok(Self {
            router: Router {
                devices,
                connections,
                pairing,
                plugins,
                workers: Arc::new(Mutex::new(HashMap::new())),
                event_tx,
                plugin_tx,
                download_dir: config.download_dir.clone(),
            },
            config,
            certificate,
            plugin_rx: Mutex::new(Some(plugin_rx)),
            discovery: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            state: Mutex::new(RunState::Created),
        })
    }

    /// Start listening, discovering and routing; returns the TCP port
    pub async fn start(&self) -> Result<u16> {
        let mut state = self.state.lock().await;
        match *state {
            RunState::Running => {
                return Err(ProtocolError::Configuration(
                    "Service is already running".to_string(),
                ))
            }
            RunState::Stopped => {
                return Err(ProtocolError::Configuration(
                    "A stopped service cannot be restarted".to_string(),
                ))
            }
            RunState::Created => {}
        }

        let Some(mut plugin_rx) = self.plugin_rx.lock().await.take() else {
            return Err(ProtocolError::Configuration(
                "Plugin event channel already taken".to_string(),
            ));
        };

        let router = &self.router;
        let mut connection_events = router.connections.subscribe().await;
        let mut pairing_events = router.pairing.subscribe().await;

        let port = router.connections.start().await?;
        router.pairing.start();

        let mut tasks = Vec::new();

        let r = router.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = connection_events.recv().await {
                r.on_connection_event(event).await;
            }
        }));

        let r = router.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = pairing_events.recv().await {
                r.on_pairing_event(event).await;
            }
        }));

        let r = router.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(PluginNotification { device_id, event }) = plugin_rx.recv().await {
                r.emit(ServiceEvent::Plugin { device_id, event });
            }
        }));

        if self.config.enable_discovery {
            match self.start_discovery().await {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    error!("Failed to start discovery: {}", e);
                    for task in tasks {
                        task.abort();
                    }
                    router.pairing.stop();
                    router.connections.stop().await;
                    *state = RunState::Stopped;
                    return Err(e);
                }
            }
        }

        self.tasks.lock().await.extend(tasks);
        *state = RunState::Running;

        info!(
            "Service started for {} on TCP port {}",
            self.certificate.device_id, port
        );
        router.emit(ServiceEvent::Started { tcp_port: port });
        Ok(port)
    }

    async fn start_discovery(&self) -> Result<JoinHandle<()>> {
        let identity = self.router.connections.our_identity().await;
        let mut discovery =
            DiscoveryService::new((*identity).clone(), self.config.discovery.clone())?;
        let mut events = discovery.subscribe().await;
        discovery.start().await?;
        *self.discovery.lock().await = Some(discovery);

        let router = self.router.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                router.on_discovery_event(event).await;
            }
        }))
    }

    /// Stop everything and persist the registry
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if *state != RunState::Running {
            return;
        }
        *state = RunState::Stopped;
        info!("Stopping service");

        if let Some(mut discovery) = self.discovery.lock().await.take() {
            discovery.stop().await;
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        let router = &self.router;
        router.connections.stop().await;
        router.pairing.stop();

        let workers: Vec<DeviceWorker> = router
            .workers
            .lock()
            .await
            .drain()
            .map(|(_, worker)| worker)
            .collect();
        for worker in workers {
            worker.shutdown().await;
        }

        router.save_registry().await;
        router.emit(ServiceEvent::Stopped);
        info!("Service stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.state.lock().await == RunState::Running
    }

    /// Our identity as announced to other devices
    pub async fn identity(&self) -> DeviceInfo {
        (*self.router.connections.our_identity().await).clone()
    }

    pub fn device_id(&self) -> &str {
        &self.certificate.device_id
    }

    pub fn certificate(&self) -> &CertificateInfo {
        &self.certificate
    }

    /// UDP port discovery listens on, while running
    pub async fn discovery_port(&self) -> Option<u16> {
        self.discovery
            .lock()
            .await
            .as_ref()
            .and_then(|d| d.local_port().ok())
    }

    /// Send our identity to one address, e.g. a device not reachable by broadcast
    pub async fn announce_to(&self, target: SocketAddr) -> Result<()> {
        match self.discovery.lock().await.as_ref() {
            Some(discovery) => discovery.announce_to(target).await,
            None => Err(ProtocolError::Discovery(
                "Discovery is not running".to_string(),
            )),
        }
    }

    /// Connect to a device whose identity is already known
    pub async fn connect_to(&self, peer: DeviceInfo, addr: SocketAddr) -> Result<()> {
        self.router.connections.connect(peer, addr).await
    }

    /// Pairing requests still waiting for an answer
    pub async fn pending_pairing_requests(&self) -> Vec<crate::pairing::PairingRequest> {
        self.router.pairing.pending_requests().await
    }

    async fn require_paired(&self, device_id: &str) -> Result<()> {
        let devices = self.router.devices.read().await;
        let device = devices
            .get_device(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        if !device.is_paired() {
            return Err(ProtocolError::NotPaired);
        }
        Ok(())
    }

    async fn require_sendable(&self, device_id: &str) -> Result<()> {
        self.require_paired(device_id).await?;
        if !self.router.connections.has_connection(device_id).await {
            return Err(ProtocolError::NotConnected(device_id.to_string()));
        }
        Ok(())
    }

    async fn collect(&self, filter: impl Fn(&Device) -> bool) -> Vec<Device> {
        self.router
            .devices
            .read()
            .await
            .devices()
            .filter(|d| filter(d))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DeviceCommunicationService for ConnectService {
    async fn connected_devices(&self) -> Vec<Device> {
        self.collect(Device::is_connected).await
    }

    async fn paired_devices(&self) -> Vec<Device> {
        self.collect(Device::is_paired).await
    }

    async fn devices(&self) -> Vec<Device> {
        self.collect(|_| true).await
    }

    async fn device(&self, device_id: &str) -> Option<Device> {
        self.router.devices.read().await.snapshot(device_id)
    }

    async fn rebroadcast(&self) {
        match self.discovery.lock().await.as_ref() {
            Some(discovery) => discovery.rebroadcast(),
            None => debug!("Rebroadcast requested without discovery"),
        }
    }

    async fn connect(&self, device_id: &str) -> Result<()> {
        let (info, address) = {
            let devices = self.router.devices.read().await;
            let device = devices
                .get_device(device_id)
                .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
            (device.info.clone(), device.address)
        };

        let address = address.ok_or_else(|| ProtocolError::ConnectionFailed {
            device_id: device_id.to_string(),
            attempts: 0,
            reason: "No known address".to_string(),
        })?;
        self.connect_to(info, address).await
    }

    async fn disconnect(&self, device_id: &str) -> Result<()> {
        self.router.connections.disconnect(device_id).await
    }

    async fn request_pairing(&self, device_id: &str) -> Result<()> {
        self.router.pairing.request_pairing(device_id).await
    }

    async fn accept_pairing(&self, device_id: &str) -> Result<()> {
        self.router.pairing.accept_pairing(device_id).await
    }

    async fn reject_pairing(&self, device_id: &str) -> Result<()> {
        self.router.pairing.reject_pairing(device_id).await
    }

    async fn unpair(&self, device_id: &str) -> Result<()> {
        self.router.pairing.unpair(device_id).await
    }

    async fn verification_key(&self, device_id: &str) -> Result<String> {
        self.router.pairing.verification_key(device_id).await
    }

    async fn send_packet(&self, device_id: &str, packet: Packet) -> Result<()> {
        if packet.is_type(PACKET_TYPE_PAIR) || packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::InvalidPacket(format!(
                "'{}' is sent by the service itself",
                packet.packet_type
            )));
        }
        self.require_paired(device_id).await?;
        self.router.connections.send_packet(device_id, &packet).await
    }

    async fn send_file(&self, device_id: &str, path: &Path, open: bool) -> Result<()> {
        self.require_sendable(device_id).await?;

        let info = FileTransferInfo::from_path(path).await?;
        let packet = share::create_file(&info, open);
        let server = offer_file(&self.router.connections, device_id, &info, packet).await?;

        let path = path.to_path_buf();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            match server.serve_file(&path).await {
                Ok(sent) => info!("Sent {} bytes of {:?} to {}", sent, path, device_id),
                Err(e) => warn!("Transfer of {:?} to {} failed: {}", path, device_id, e),
            }
        });
        Ok(())
    }

    async fn send_files(&self, device_id: &str, paths: &[PathBuf], open: bool) -> Result<()> {
        self.require_sendable(device_id).await?;
        if paths.is_empty() {
            return Ok(());
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push((path.clone(), FileTransferInfo::from_path(path).await?));
        }
        let mut remaining_files = files.len() as u64;
        let mut remaining_size: u64 = files.iter().map(|(_, info)| info.size).sum();

        self.router
            .connections
            .send_packet(
                device_id,
                &share::create_update(remaining_files, remaining_size),
            )
            .await?;

        let connections = self.router.connections.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            for (path, info) in files {
                let packet =
                    share::create_batch_file(&info, open, remaining_files, remaining_size);
                remaining_files -= 1;
                remaining_size = remaining_size.saturating_sub(info.size);

                let result = match offer_file(&connections, &device_id, &info, packet).await {
                    Ok(server) => server.serve_file(&path).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(sent) => info!("Sent {} bytes of {:?} to {}", sent, path, device_id),
                    Err(e) => {
                        warn!("Transfer of {:?} to {} failed: {}", path, device_id, e);
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.router.event_tx.subscribe()
    }

    async fn shutdown(&self) {
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::PairingPacket;
    use crate::DeviceType;
    use tempfile::TempDir;

    async fn service(dir: &TempDir) -> ConnectService {
        let config = ServiceConfig::new("Desktop", DeviceType::Desktop, dir.path())
            .with_device_id("desktop")
            .with_listen_port(0)
            .without_discovery();
        ConnectService::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_identity_advertises_plugin_capabilities() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;

        let identity = service.identity().await;
        assert_eq!(identity.device_id, "desktop");
        assert!(identity
            .incoming_capabilities
            .contains(&"kdeconnect.ping".to_string()));
        assert!(identity
            .outgoing_capabilities
            .contains(&"kdeconnect.mpris.request".to_string()));
        assert!(dir.path().join("certificate.pem").exists());
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let mut events = service.subscribe();

        let port = service.start().await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(service.identity().await.tcp_port, port);
        assert!(service.is_running().await);
        assert!(matches!(
            service.start().await,
            Err(ProtocolError::Configuration(_))
        ));

        service.shutdown().await;
        assert!(!service.is_running().await);
        assert!(dir.path().join("devices.json").exists());
        assert!(matches!(
            service.start().await,
            Err(ProtocolError::Configuration(_))
        ));

        assert!(matches!(
            events.recv().await.unwrap(),
            ServiceEvent::Started { tcp_port } if tcp_port == port
        ));
        assert!(matches!(events.recv().await.unwrap(), ServiceEvent::Stopped));
    }

    #[tokio::test]
    async fn test_send_requires_known_paired_device() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;

        assert!(matches!(
            service.send_ping("phone", None).await,
            Err(ProtocolError::DeviceNotFound(_))
        ));

        service.router.devices.write().await.upsert_from_identity(
            DeviceInfo::with_id("phone", "Phone", DeviceType::Phone, 1716),
            None,
        );
        assert!(matches!(
            service.send_ping("phone", None).await,
            Err(ProtocolError::NotPaired)
        ));
        assert!(matches!(
            service
                .send_packet("phone", PairingPacket::request())
                .await,
            Err(ProtocolError::InvalidPacket(_))
        ));
        assert!(matches!(
            service.connect("phone").await,
            Err(ProtocolError::ConnectionFailed { attempts: 0, .. })
        ));

    }
}
