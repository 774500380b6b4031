//! Async Discovery Service
//!
//! Broadcasts this device's identity on an interval and listens for the
//! identities of other devices. A device seen for the first time also gets a
//! directed identity so it can connect back without waiting for our next
//! broadcast.

use super::events::DiscoveryEvent;
use super::mdns::MdnsDiscovery;
use super::{DISCOVERY_PORT, PORT_RANGE_END, PORT_RANGE_START};
use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{DeviceInfo, Packet, ProtocolError, Result};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Default broadcast interval (5 seconds)
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Default device timeout (30 seconds)
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest identity datagram we accept
const MAX_DATAGRAM_SIZE: usize = 8192;

/// Configuration for discovery service
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How often to broadcast identity packets
    pub broadcast_interval: Duration,

    /// How long before a device is considered timed out
    pub device_timeout: Duration,

    /// How often timed out devices are looked for
    pub timeout_check_interval: Duration,

    /// Whether to enable device timeout checking
    pub enable_timeout_check: bool,

    /// UDP port to listen on; 0 binds an ephemeral port without fallback
    pub bind_port: u16,

    /// Where identity broadcasts are sent
    pub broadcast_address: SocketAddr,

    /// Advertise and browse `_kdeconnect._udp` over mDNS as well
    pub enable_mdns: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            device_timeout: DEFAULT_DEVICE_TIMEOUT,
            timeout_check_interval: Duration::from_secs(5),
            enable_timeout_check: true,
            bind_port: DISCOVERY_PORT,
            broadcast_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DISCOVERY_PORT),
            enable_mdns: false,
        }
    }
}

/// State shared by the broadcaster, listener and timeout checker
#[derive(Clone)]
struct Announcer {
    socket: Arc<UdpSocket>,
    device_info: Arc<DeviceInfo>,
    event_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    last_seen: Arc<RwLock<HashMap<String, Instant>>>,
}

impl Announcer {
    async fn send_identity(&self, target: SocketAddr) -> Result<()> {
        let bytes = self.device_info.to_identity_packet().to_bytes()?;
        let sent = self.socket.send_to(&bytes, target).await?;
        debug!("Sent identity packet ({} bytes) to {}", sent, target);
        Ok(())
    }

    async fn handle_datagram(&self, data: &[u8], src_addr: SocketAddr) -> Result<()> {
        let packet = Packet::from_bytes(data)?;

        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            debug!(
                "Ignoring {} datagram from {}",
                packet.packet_type, src_addr
            );
            return Ok(());
        }

        let info = DeviceInfo::from_identity_packet(&packet)?;

        if info.device_id == self.device_info.device_id {
            debug!("Ignoring our own broadcast");
            return Ok(());
        }

        let is_new = self
            .last_seen
            .write()
            .await
            .insert(info.device_id.clone(), Instant::now())
            .is_none();

        let address = SocketAddr::new(src_addr.ip(), info.tcp_port);

        let event = if is_new {
            info!(
                "Discovered new device: {} ({}) at {}",
                info.device_name, info.device_type, address
            );
            if let Err(e) = self.send_identity(src_addr).await {
                warn!("Failed to send directed identity to {}: {}", src_addr, e);
            }
            DiscoveryEvent::DeviceDiscovered { info, address }
        } else {
            debug!("Updated device: {} at {}", info.device_name, address);
            DiscoveryEvent::DeviceUpdated { info, address }
        };

        let _ = self.event_tx.send(event);
        Ok(())
    }
}

/// Async discovery service
///
/// Runs three concurrent tasks:
/// - Broadcaster: sends identity packets at regular intervals and on demand
/// - Listener: receives and processes incoming identity packets
/// - Timeout checker: reports devices that went quiet
pub struct DiscoveryService {
    announcer: Announcer,

    /// Event channel receiver
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<DiscoveryEvent>>>,

    config: DiscoveryConfig,

    /// Wakes the broadcaster outside its interval
    rebroadcast: Arc<Notify>,

    tasks: Vec<JoinHandle<()>>,

    mdns: Option<MdnsDiscovery>,
}

impl DiscoveryService {
    /// Create a new discovery service and bind its socket
    ///
    /// `device_info.tcp_port` must already be the port of the TCP listener.
    pub fn new(device_info: DeviceInfo, config: DiscoveryConfig) -> Result<Self> {
        let socket = UdpSocket::from_std(Self::bind_socket(config.bind_port)?)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            announcer: Announcer {
                socket: Arc::new(socket),
                device_info: Arc::new(device_info),
                event_tx,
                last_seen: Arc::new(RwLock::new(HashMap::new())),
            },
            event_rx: Arc::new(RwLock::new(event_rx)),
            config,
            rebroadcast: Arc::new(Notify::new()),
            tasks: Vec::new(),
            mdns: None,
        })
    }

    /// Create a discovery service with default configuration
    pub fn with_defaults(device_info: DeviceInfo) -> Result<Self> {
        Self::new(device_info, DiscoveryConfig::default())
    }

    /// Bind UDP socket with fallback ports
    fn bind_socket(port: u16) -> Result<std::net::UdpSocket> {
        let configure = |socket: std::net::UdpSocket| -> Result<std::net::UdpSocket> {
            socket.set_broadcast(true)?;
            socket.set_nonblocking(true)?;
            Ok(socket)
        };

        match std::net::UdpSocket::bind(("0.0.0.0", port)) {
            Ok(socket) => {
                info!("Bound to UDP port {}", socket.local_addr()?.port());
                configure(socket)
            }
            Err(e) if port == 0 => Err(ProtocolError::Io(e)),
            Err(e) => {
                warn!(
                    "Failed to bind to primary port {}: {}. Trying fallback range...",
                    port, e
                );

                for fallback in PORT_RANGE_START..=PORT_RANGE_END {
                    if fallback == port {
                        continue;
                    }

                    if let Ok(socket) = std::net::UdpSocket::bind(("0.0.0.0", fallback)) {
                        info!("Bound to fallback UDP port {}", fallback);
                        return configure(socket);
                    }
                }

                Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!(
                        "Failed to bind to any port in range {}-{}",
                        PORT_RANGE_START, PORT_RANGE_END
                    ),
                )))
            }
        }
    }

    /// Get the local port this service is bound to
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.announcer.socket.local_addr()?.port())
    }

    /// Identity this service announces
    pub fn device_info(&self) -> &DeviceInfo {
        &self.announcer.device_info
    }

    /// Get a receiver for discovery events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
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

    /// Start broadcasting and listening
    pub async fn start(&mut self) -> Result<()> {
        let port = self.local_port()?;
        info!("Starting discovery service on port {}", port);

        let _ = self
            .announcer
            .event_tx
            .send(DiscoveryEvent::ServiceStarted { port });

        self.tasks.push(self.spawn_broadcaster());
        self.tasks.push(self.spawn_listener());

        if self.config.enable_timeout_check {
            self.tasks.push(self.spawn_timeout_checker());
        }

        if self.config.enable_mdns {
            match MdnsDiscovery::start(&self.announcer.device_info, self.rebroadcast.clone()) {
                Ok(mdns) => self.mdns = Some(mdns),
                Err(e) => warn!("mDNS unavailable, using UDP broadcast only: {}", e),
            }
        }

        Ok(())
    }

    /// Broadcast our identity now instead of at the next interval
    pub fn rebroadcast(&self) {
        debug!("Rebroadcast requested");
        self.rebroadcast.notify_one();
    }

    /// Send our identity to one address
    pub async fn announce_to(&self, target: SocketAddr) -> Result<()> {
        self.announcer.send_identity(target).await
    }

    /// Feed one received datagram through the identity handler
    pub async fn handle_datagram(&self, data: &[u8], src_addr: SocketAddr) -> Result<()> {
        self.announcer.handle_datagram(data, src_addr).await
    }

    fn spawn_broadcaster(&self) -> JoinHandle<()> {
        let announcer = self.announcer.clone();
        let target = self.config.broadcast_address;
        let rebroadcast = self.rebroadcast.clone();
        let broadcast_interval = self.config.broadcast_interval;

        tokio::spawn(async move {
            let mut interval = interval(broadcast_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = rebroadcast.notified() => {}
                }

                if let Err(e) = announcer.send_identity(target).await {
                    error!("Failed to broadcast identity: {}", e);
                }
            }
        })
    }

    fn spawn_listener(&self) -> JoinHandle<()> {
        let announcer = self.announcer.clone();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match announcer.socket.recv_from(&mut buf).await {
                    Ok((size, src_addr)) => {
                        if let Err(e) = announcer.handle_datagram(&buf[..size], src_addr).await {
                            debug!("Error handling datagram from {}: {}", src_addr, e);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }

    fn spawn_timeout_checker(&self) -> JoinHandle<()> {
        let last_seen = self.announcer.last_seen.clone();
        let event_tx = self.announcer.event_tx.clone();
        let timeout = self.config.device_timeout;
        let check_interval = self.config.timeout_check_interval;

        tokio::spawn(async move {
            let mut interval = interval(check_interval);

            loop {
                interval.tick().await;

                let mut last_seen_map = last_seen.write().await;
                let timed_out: Vec<String> = last_seen_map
                    .iter()
                    .filter(|(_, seen)| seen.elapsed() > timeout)
                    .map(|(device_id, _)| device_id.clone())
                    .collect();

                for device_id in timed_out {
                    info!("Device timed out: {}", device_id);
                    last_seen_map.remove(&device_id);
                    let _ = event_tx.send(DiscoveryEvent::DeviceTimeout { device_id });
                }
            }
        })
    }

    /// Stop the discovery service
    pub async fn stop(&mut self) {
        info!("Stopping discovery service");

        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Some(mdns) = self.mdns.take() {
            mdns.shutdown();
        }

        let _ = self.announcer.event_tx.send(DiscoveryEvent::ServiceStopped);
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceType;
    use tokio::time::timeout;

    fn local_config(target: SocketAddr) -> DiscoveryConfig {
        DiscoveryConfig {
            bind_port: 0,
            broadcast_address: target,
            broadcast_interval: Duration::from_secs(3600),
            ..DiscoveryConfig::default()
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<DiscoveryEvent>) -> DiscoveryEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    async fn recv_identity(socket: &UdpSocket) -> DeviceInfo {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (size, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("datagram timeout")
            .unwrap();
        DeviceInfo::from_identity_packet(&Packet::from_bytes(&buf[..size]).unwrap()).unwrap()
    }

    #[test]
    fn test_discovery_config_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.broadcast_interval, DEFAULT_BROADCAST_INTERVAL);
        assert_eq!(config.device_timeout, DEFAULT_DEVICE_TIMEOUT);
        assert_eq!(config.broadcast_address.port(), DISCOVERY_PORT);
        assert!(config.enable_timeout_check);
        assert!(!config.enable_mdns);
    }

    #[tokio::test]
    async fn test_broadcast_on_start_and_rebroadcast() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let own = DeviceInfo::with_id("desktop1", "Desktop", DeviceType::Desktop, 1716);

        let mut service =
            DiscoveryService::new(own, local_config(peer.local_addr().unwrap())).unwrap();
        service.start().await.unwrap();

        assert_eq!(recv_identity(&peer).await.device_id, "desktop1");

        service.rebroadcast();
        assert_eq!(recv_identity(&peer).await.device_id, "desktop1");

        service.stop().await;
    }

    #[tokio::test]
    async fn test_identity_datagrams_produce_events() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let own = DeviceInfo::with_id("desktop1", "Desktop", DeviceType::Desktop, 1716);
        let mut config = local_config(peer.local_addr().unwrap());
        config.enable_timeout_check = false;

        let mut service = DiscoveryService::new(own.clone(), config).unwrap();
        let service_addr: SocketAddr =
            format!("127.0.0.1:{}", service.local_port().unwrap()).parse().unwrap();
        let mut events = service.subscribe().await;
        service.start().await.unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            DiscoveryEvent::ServiceStarted { .. }
        ));
        // initial broadcast
        recv_identity(&peer).await;

        let phone = DeviceInfo::with_id("dev1", "Phone", DeviceType::Phone, 1764);
        let bytes = phone.to_identity_packet().to_bytes().unwrap();
        peer.send_to(&bytes, service_addr).await.unwrap();

        match next_event(&mut events).await {
            DiscoveryEvent::DeviceDiscovered { info, address } => {
                assert_eq!(info.device_id, "dev1");
                assert_eq!(address, "127.0.0.1:1764".parse::<SocketAddr>().unwrap());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // directed reply to a new device
        assert_eq!(recv_identity(&peer).await.device_id, "desktop1");

        peer.send_to(&bytes, service_addr).await.unwrap();
        assert!(next_event(&mut events).await.is_device_updated());

        // our own identity echoed back is ignored
        let echo = own.to_identity_packet().to_bytes().unwrap();
        peer.send_to(&echo, service_addr).await.unwrap();
        assert!(timeout(Duration::from_millis(200), events.recv())
            .await
            .is_err());

        service.stop().await;
    }

    #[tokio::test]
    async fn test_garbage_datagram_is_rejected() {
        let own = DeviceInfo::with_id("desktop1", "Desktop", DeviceType::Desktop, 1716);
        let service =
            DiscoveryService::new(own, local_config("127.0.0.1:9".parse().unwrap())).unwrap();
        let src: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        assert!(service.handle_datagram(b"not json", src).await.is_err());

        let ping = Packet::new("kdeconnect.ping", serde_json::json!({}))
            .to_bytes()
            .unwrap();
        assert!(service.handle_datagram(&ping, src).await.is_ok());
    }

    #[tokio::test]
    async fn test_device_timeout() {
        let own = DeviceInfo::with_id("desktop1", "Desktop", DeviceType::Desktop, 1716);
        let mut config = local_config("127.0.0.1:9".parse().unwrap());
        config.device_timeout = Duration::from_millis(100);
        config.timeout_check_interval = Duration::from_millis(50);

        let mut service = DiscoveryService::new(own, config).unwrap();
        let mut events = service.subscribe().await;
        service.start().await.unwrap();

        let phone = DeviceInfo::with_id("dev1", "Phone", DeviceType::Phone, 1764);
        let bytes = phone.to_identity_packet().to_bytes().unwrap();
        service
            .handle_datagram(&bytes, "127.0.0.1:5000".parse().unwrap())
            .await
            .unwrap();

        let mut timed_out = false;
        for _ in 0..5 {
            if let DiscoveryEvent::DeviceTimeout { device_id } = next_event(&mut events).await {
                assert_eq!(device_id, "dev1");
                timed_out = true;
                break;
            }
        }
        assert!(timed_out);

        service.stop().await;
    }
}
