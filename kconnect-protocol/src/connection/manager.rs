//! Connection Manager
//!
//! Owns the TCP listener and one session per connected device.
//!
//! ## Duplicate connections
//!
//! Two devices that discover each other at the same moment both connect,
//! leaving two sessions for one pair. When a second session arrives for a
//! device, both ends keep the same one: a session replaces one opened by the
//! same side (the peer reconnected), otherwise the session opened by the
//! device with the greater id wins.

use super::events::ConnectionEvent;
use super::recovery::ReconnectionStrategy;
use super::session::{run_session, SessionCommand, SessionEnd};
use super::PacketSink;
use crate::transport::{tls, EstablishedConnection, TlsConfig, TlsListener};
use crate::{CertificateInfo, DeviceInfo, DeviceManager, Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time a closing session gets to flush before it is aborted
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// TCP port to listen on; 0 picks an ephemeral port
    pub listen_port: u16,
    /// Backoff used by [`ConnectionManager::connect`]
    pub reconnect: ReconnectionStrategy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            listen_port: crate::discovery::DISCOVERY_PORT,
            reconnect: ReconnectionStrategy::default(),
        }
    }
}

/// Active session to a device
struct ActiveSession {
    id: u64,
    /// Device id of the side that opened the connection
    initiator: String,
    remote_addr: SocketAddr,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

/// State shared with the accept loop and session tasks
struct Shared {
    own_device_id: String,
    sessions: RwLock<HashMap<String, ActiveSession>>,
    devices: Arc<RwLock<DeviceManager>>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    next_session_id: AtomicU64,
}

impl Shared {
    /// Register an established connection and start its session task
    async fn register<S>(
        self: &Arc<Self>,
        device_info: DeviceInfo,
        remote_addr: SocketAddr,
        peer_certificate: Vec<u8>,
        initiator: String,
        stream: S,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let device_id = device_info.device_id.clone();
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(&device_id) {
            let keep_existing =
                existing.initiator != initiator && existing.initiator > initiator;
            if keep_existing {
                debug!(
                    "Dropping duplicate connection from {} at {}",
                    device_id, remote_addr
                );
                return;
            }
            if let Some(replaced) = sessions.remove(&device_id) {
                info!(
                    "Replacing session with {} ({} -> {})",
                    device_id, replaced.remote_addr, remote_addr
                );
                let _ = replaced.command_tx.send(SessionCommand::Close);
            }
        }

        {
            let mut devices = self.devices.write().await;
            devices.upsert_from_identity(device_info.clone(), Some(remote_addr));
            let fingerprint = CertificateInfo::calculate_fingerprint(&peer_certificate);
            if let Err(e) = devices
                .mark_connected(&device_id, remote_addr)
                .and_then(|_| {
                    devices.set_peer_certificate(&device_id, peer_certificate.clone(), fingerprint)
                })
            {
                warn!("Failed to record connection of {}: {}", device_id, e);
            }
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let _ = self.event_tx.send(ConnectionEvent::Connected {
            device_info,
            remote_addr,
            peer_certificate,
        });

        let shared = self.clone();
        let session_device = device_id.clone();
        let task = tokio::spawn(async move {
            let end = run_session(
                stream,
                session_device.clone(),
                command_rx,
                shared.event_tx.clone(),
            )
            .await;
            shared.session_ended(&session_device, session_id, end).await;
        });

        sessions.insert(
            device_id.clone(),
            ActiveSession {
                id: session_id,
                initiator,
                remote_addr,
                command_tx,
                task,
            },
        );

        info!("Session {} established with {} at {}", session_id, device_id, remote_addr);
    }

    /// Clean up after a session task finished by itself
    async fn session_ended(&self, device_id: &str, session_id: u64, end: SessionEnd) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(device_id).map(|s| s.id) != Some(session_id) {
            // already removed or replaced
            return;
        }
        sessions.remove(device_id);
        drop(sessions);

        let reason = match end {
            SessionEnd::Closed => None,
            SessionEnd::Lost(reason) => Some(reason),
        };
        self.mark_gone(device_id, reason).await;
    }

    async fn mark_gone(&self, device_id: &str, reason: Option<String>) {
        if let Err(e) = self.devices.write().await.mark_disconnected(device_id) {
            debug!("Disconnected device {} not in registry: {}", device_id, e);
        }

        info!("Device {} disconnected", device_id);
        let _ = self.event_tx.send(ConnectionEvent::Disconnected {
            device_id: device_id.to_string(),
            reason,
        });
    }
}

/// Connection manager for handling multiple TLS connections
pub struct ConnectionManager {
    our_identity: RwLock<Arc<DeviceInfo>>,
    tls: TlsConfig,
    shared: Arc<Shared>,

    /// Devices with a connect attempt in flight
    connecting: Mutex<HashSet<String>>,

    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<ConnectionEvent>>>,

    config: ConnectionConfig,

    server_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a new connection manager
    pub fn new(
        certificate: &CertificateInfo,
        our_identity: DeviceInfo,
        devices: Arc<RwLock<DeviceManager>>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            shared: Arc::new(Shared {
                own_device_id: our_identity.device_id.clone(),
                sessions: RwLock::new(HashMap::new()),
                devices,
                event_tx,
                next_session_id: AtomicU64::new(1),
            }),
            our_identity: RwLock::new(Arc::new(our_identity)),
            tls: TlsConfig::new(certificate)?,
            connecting: Mutex::new(HashSet::new()),
            event_rx: Arc::new(RwLock::new(event_rx)),
            config,
            server_task: Mutex::new(None),
        })
    }

    /// Get a receiver for connection events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        let event_rx = self.event_rx.clone();
        tokio::spawn(async move {
            let mut rx_lock = event_rx.write().await;
            while let Some(event) = rx_lock.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        rx
    }

    /// TLS configuration, shared with payload transfers
    pub fn tls_config(&self) -> &TlsConfig {
        &self.tls
    }

    /// Our identity as sent on outgoing connections
    pub async fn our_identity(&self) -> Arc<DeviceInfo> {
        self.our_identity.read().await.clone()
    }

    /// Start listening; returns the bound TCP port
    ///
    /// The port is written into our identity's `tcpPort`.
    pub async fn start(&self) -> Result<u16> {
        let listener = TlsListener::bind(self.config.listen_port).await?;
        let port = listener.local_addr().port();

        {
            let mut identity = self.our_identity.write().await;
            *identity = Arc::new((**identity).clone().with_tcp_port(port));
        }

        let shared = self.shared.clone();
        let tls = self.tls.clone();

        let server_task = tokio::spawn(async move {
            loop {
                let (tcp_stream, remote_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        continue;
                    }
                };

                debug!("TCP connection accepted from {}", remote_addr);
                let shared = shared.clone();
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls::accept(tcp_stream, remote_addr, &shared.own_device_id, &tls).await
                    {
                        Ok(EstablishedConnection {
                            stream,
                            remote_addr,
                            identity,
                            peer_certificate,
                        }) => {
                            let initiator = identity.device_id.clone();
                            shared
                                .register(identity, remote_addr, peer_certificate, initiator, stream)
                                .await;
                        }
                        Err(e) => {
                            warn!("Incoming connection from {} failed: {}", remote_addr, e);
                            let _ = shared.event_tx.send(ConnectionEvent::ConnectionError {
                                device_id: None,
                                message: e.to_string(),
                            });
                        }
                    }
                });
            }
        });

        if let Some(previous) = self.server_task.lock().await.replace(server_task) {
            previous.abort();
        }

        let _ = self
            .shared
            .event_tx
            .send(ConnectionEvent::ManagerStarted { port });
        info!("Connection manager started on port {}", port);

        Ok(port)
    }

    /// Connect to a device at `addr`, retrying with backoff
    ///
    /// A no-op when a session exists or an attempt is already in flight.
    pub async fn connect(&self, peer: DeviceInfo, addr: SocketAddr) -> Result<()> {
        let device_id = peer.device_id.clone();

        if self.has_connection(&device_id).await {
            debug!("Already connected to device {}", device_id);
            return Ok(());
        }
        if !self.connecting.lock().await.insert(device_id.clone()) {
            debug!("Connection to {} already in progress", device_id);
            return Ok(());
        }

        {
            let mut devices = self.shared.devices.write().await;
            devices.upsert_from_identity(peer.clone(), Some(addr));
            devices.mark_connecting(&device_id)?;
        }

        let result = self.connect_with_retry(&peer, addr).await;
        self.connecting.lock().await.remove(&device_id);

        match result {
            Ok(connection) => {
                self.shared
                    .register(
                        connection.identity,
                        connection.remote_addr,
                        connection.peer_certificate,
                        self.shared.own_device_id.clone(),
                        connection.stream,
                    )
                    .await;
                Ok(())
            }
            Err(e) => {
                error!("Giving up on {}: {}", device_id, e);
                if let Err(mark_err) = self.shared.devices.write().await.mark_failed(&device_id) {
                    debug!("Could not mark {} failed: {}", device_id, mark_err);
                }
                let _ = self.shared.event_tx.send(ConnectionEvent::ConnectionError {
                    device_id: Some(device_id),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn connect_with_retry(
        &self,
        peer: &DeviceInfo,
        addr: SocketAddr,
    ) -> Result<EstablishedConnection> {
        let mut strategy = self.config.reconnect.clone();
        strategy.reset();

        loop {
            let identity = self.our_identity().await;
            match tls::connect(addr, &identity, peer.clone(), &self.tls).await {
                Ok(connection) => return Ok(connection),
                Err(e) => match strategy.next_delay() {
                    Some(delay) => {
                        warn!(
                            "Connection to {} failed ({}), retrying in {:?} ({})",
                            peer.device_id,
                            e,
                            delay,
                            strategy.status()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(ProtocolError::ConnectionFailed {
                            device_id: peer.device_id.clone(),
                            attempts: strategy.attempt,
                            reason: e.to_string(),
                        })
                    }
                },
            }
        }
    }

    /// Run a session over an already established stream
    ///
    /// The stream is treated as opened by the peer.
    pub async fn attach_stream<S>(
        &self,
        peer: DeviceInfo,
        remote_addr: SocketAddr,
        peer_certificate: Vec<u8>,
        stream: S,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let initiator = peer.device_id.clone();
        self.shared
            .register(peer, remote_addr, peer_certificate, initiator, stream)
            .await;
    }

    /// Queue a packet for a connected device
    pub async fn send_packet(&self, device_id: &str, packet: &Packet) -> Result<()> {
        let sessions = self.shared.sessions.read().await;
        let session = sessions
            .get(device_id)
            .ok_or_else(|| ProtocolError::NotConnected(device_id.to_string()))?;

        session
            .command_tx
            .send(SessionCommand::SendPacket(packet.clone()))
            .map_err(|_| ProtocolError::NotConnected(device_id.to_string()))?;

        debug!("Packet '{}' queued for device {}", packet.packet_type, device_id);
        Ok(())
    }

    /// Close the session to a device; pairing state is untouched
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let Some(mut session) = self.shared.sessions.write().await.remove(device_id) else {
            return Ok(());
        };

        info!("Disconnecting from device {}", device_id);
        let _ = session.command_tx.send(SessionCommand::Close);
        if tokio::time::timeout(CLOSE_GRACE, &mut session.task).await.is_err() {
            session.task.abort();
        }

        self.shared
            .mark_gone(device_id, Some("Disconnected locally".to_string()))
            .await;
        Ok(())
    }

    /// Check if there's an active session to a device
    pub async fn has_connection(&self, device_id: &str) -> bool {
        self.shared.sessions.read().await.contains_key(device_id)
    }

    /// Ids of devices with an active session
    pub async fn connected_device_ids(&self) -> Vec<String> {
        self.shared.sessions.read().await.keys().cloned().collect()
    }

    /// Stop listening and close every session
    pub async fn stop(&self) {
        info!("Stopping connection manager");

        if let Some(task) = self.server_task.lock().await.take() {
            task.abort();
        }

        for device_id in self.connected_device_ids().await {
            let _ = self.disconnect(&device_id).await;
        }

        let _ = self.shared.event_tx.send(ConnectionEvent::ManagerStopped);
        info!("Connection manager stopped");
    }
}

#[async_trait]
impl PacketSink for ConnectionManager {
    async fn send_packet(&self, device_id: &str, packet: &Packet) -> Result<()> {
        ConnectionManager::send_packet(self, device_id, packet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectionState, DeviceType};
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn manager(id: &str) -> (ConnectionManager, Arc<RwLock<DeviceManager>>) {
        let devices = Arc::new(RwLock::new(DeviceManager::in_memory()));
        let cert = CertificateInfo::generate(id).unwrap();
        let config = ConnectionConfig {
            listen_port: 0,
            reconnect: ReconnectionStrategy::new(
                2,
                Duration::from_millis(10),
                Duration::from_millis(20),
            ),
        };
        let manager = ConnectionManager::new(
            &cert,
            DeviceInfo::with_id(id, id, DeviceType::Desktop, 0),
            devices.clone(),
            config,
        )
        .unwrap();
        (manager, devices)
    }

    fn phone() -> DeviceInfo {
        DeviceInfo::with_id("dev1", "Phone", DeviceType::Phone, 1716)
    }

    #[tokio::test]
    async fn test_attached_session_round_trip() {
        let (manager, devices) = manager("desktop");
        let mut events = manager.subscribe().await;
        let (local, remote) = tokio::io::duplex(4096);

        manager
            .attach_stream(phone(), "127.0.0.1:1716".parse().unwrap(), vec![1, 2, 3], local)
            .await;

        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { .. }
        ));
        assert!(manager.has_connection("dev1").await);
        {
            let registry = devices.read().await;
            let device = registry.get_device("dev1").unwrap();
            assert_eq!(device.connection_state, ConnectionState::Connected);
            assert_eq!(device.certificate_data.as_deref(), Some(&[1u8, 2, 3][..]));
        }

        let (read_half, mut write_half) = tokio::io::split(remote);
        write_half
            .write_all(b"{\"id\":1,\"type\":\"kdeconnect.ping\",\"body\":{}}\n")
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            ConnectionEvent::PacketReceived { device_id, packet } => {
                assert_eq!(device_id, "dev1");
                assert!(packet.is_type("kdeconnect.ping"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        manager
            .send_packet("dev1", &Packet::new("kdeconnect.ping", json!({"message": "hi"})))
            .await
            .unwrap();
        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await.unwrap();
        assert!(line.contains("\"message\":\"hi\""));

        manager.disconnect("dev1").await.unwrap();
        assert!(!manager.has_connection("dev1").await);
        assert!(matches!(
            manager.send_packet("dev1", &Packet::new("kdeconnect.ping", json!({}))).await,
            Err(ProtocolError::NotConnected(_))
        ));
        assert_eq!(
            devices.read().await.get_device("dev1").unwrap().connection_state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_peer_close_emits_disconnected() {
        let (manager, _devices) = manager("desktop");
        let mut events = manager.subscribe().await;
        let (local, remote) = tokio::io::duplex(1024);

        manager
            .attach_stream(phone(), "127.0.0.1:1716".parse().unwrap(), vec![1], local)
            .await;
        drop(remote);

        loop {
            if let ConnectionEvent::Disconnected { device_id, reason } =
                events.recv().await.unwrap()
            {
                assert_eq!(device_id, "dev1");
                assert!(reason.is_some());
                break;
            }
        }
        assert!(!manager.has_connection("dev1").await);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_retries() {
        let (manager, devices) = manager("desktop");

        // bind and drop to get a port nobody listens on
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

        let result = manager.connect(phone(), addr).await;
        assert!(matches!(
            result,
            Err(ProtocolError::ConnectionFailed { attempts: 2, .. })
        ));
        assert_eq!(
            devices.read().await.get_device("dev1").unwrap().connection_state,
            ConnectionState::Failed
        );
    }

    #[tokio::test]
    async fn test_two_managers_connect() {
        let (a, _) = manager("device_a");
        let (b, b_devices) = manager("device_b");
        let mut b_events = b.subscribe().await;

        let port = b.start().await.unwrap();
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let b_identity = (*b.our_identity().await).clone();
        assert_eq!(b_identity.tcp_port, port);

        a.connect(b_identity, addr).await.unwrap();
        assert!(a.has_connection("device_b").await);

        loop {
            if let ConnectionEvent::Connected { device_info, .. } = b_events.recv().await.unwrap()
            {
                assert_eq!(device_info.device_id, "device_a");
                break;
            }
        }
        assert!(b_devices.read().await.get_device("device_a").is_some());

        a.send_packet("device_b", &Packet::new("kdeconnect.ping", json!({})))
            .await
            .unwrap();
        loop {
            if let ConnectionEvent::PacketReceived { device_id, .. } =
                b_events.recv().await.unwrap()
            {
                assert_eq!(device_id, "device_a");
                break;
            }
        }

        a.stop().await;
        b.stop().await;
    }
}
