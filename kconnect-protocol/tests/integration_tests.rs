//! Integration Tests for KDE Connect Protocol
//!
//! These tests run real services over loopback TLS and UDP: discovery,
//! connecting, pairing, plugin dispatch, file sharing and per-device
//! ordering.

use bytes::BytesMut;
use kconnect_protocol::connection::{ConnectionConfig, ConnectionManager};
use kconnect_protocol::discovery::DiscoveryConfig;
use kconnect_protocol::pairing::{PairingEvent, PairingPacket};
use kconnect_protocol::plugins::{mousepad, ping, PluginEvent};
use kconnect_protocol::service::{
    ConnectService, DeviceCommunicationService, ServiceConfig, ServiceEvent,
};
use kconnect_protocol::{
    CertificateInfo, ConnectionState, DeviceInfo, DeviceManager, DeviceType, Packet,
    PacketCodec, PairingStatus,
};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, RwLock};
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Helper to create a running service without discovery
async fn start_service(dir: &TempDir, id: &str, name: &str) -> (ConnectService, SocketAddr) {
    let config = ServiceConfig::new(name, DeviceType::Desktop, dir.path())
        .with_device_id(id)
        .with_listen_port(0)
        .without_discovery();
    let service = ConnectService::new(config)
        .await
        .expect("Failed to create service");
    let port = service.start().await.expect("Failed to start service");
    (service, SocketAddr::from(([127, 0, 0, 1], port)))
}

/// Helper to create a bare connection manager standing in for a phone
async fn raw_peer(id: &str) -> ConnectionManager {
    let certificate = CertificateInfo::generate(id).expect("Failed to generate test certificate");
    let identity = DeviceInfo::with_id(id, "Phone", DeviceType::Phone, 0)
        .with_outgoing_capability(ping::PACKET_TYPE_PING)
        .with_outgoing_capability(mousepad::PACKET_TYPE_MOUSEPAD_REQUEST);
    ConnectionManager::new(
        &certificate,
        identity,
        Arc::new(RwLock::new(DeviceManager::in_memory())),
        ConnectionConfig {
            listen_port: 0,
            ..Default::default()
        },
    )
    .expect("Failed to create connection manager")
}

/// Wait for the first event matching `predicate`
async fn wait_for<F>(rx: &mut broadcast::Receiver<ServiceEvent>, mut predicate: F) -> ServiceEvent
where
    F: FnMut(&ServiceEvent) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

fn connected(device_id: &'static str) -> impl FnMut(&ServiceEvent) -> bool {
    move |event| matches!(event, ServiceEvent::DeviceConnected { device } if device.id() == device_id)
}

/// Connect a raw peer to `service` and have the service pair with it
async fn paired_raw_peer(
    service: &ConnectService,
    events: &mut broadcast::Receiver<ServiceEvent>,
    addr: SocketAddr,
    id: &'static str,
) -> ConnectionManager {
    let peer = raw_peer(id).await;
    peer.connect(service.identity().await, addr)
        .await
        .expect("Failed to connect");
    wait_for(events, connected(id)).await;

    peer.send_packet(service.device_id(), &PairingPacket::request())
        .await
        .unwrap();
    wait_for(events, |e| {
        matches!(e, ServiceEvent::Pairing(PairingEvent::RequestReceived { device_id, .. }) if device_id == id)
    })
    .await;
    service.accept_pairing(id).await.unwrap();
    peer
}

/// Start two services and pair them; the phone connects to the desktop
async fn paired_services(
    desktop_dir: &TempDir,
    phone_dir: &TempDir,
) -> (
    ConnectService,
    broadcast::Receiver<ServiceEvent>,
    ConnectService,
) {
    let (desktop, desktop_addr) = start_service(desktop_dir, "desktop", "Desktop").await;
    let (phone, _) = start_service(phone_dir, "phone", "Phone").await;
    let mut desktop_events = desktop.subscribe();
    let mut phone_events = phone.subscribe();

    phone
        .connect_to(desktop.identity().await, desktop_addr)
        .await
        .unwrap();
    wait_for(&mut desktop_events, connected("phone")).await;
    wait_for(&mut phone_events, connected("desktop")).await;

    phone.request_pairing("desktop").await.unwrap();
    wait_for(&mut desktop_events, |e| {
        matches!(e, ServiceEvent::Pairing(PairingEvent::RequestReceived { .. }))
    })
    .await;
    desktop.accept_pairing("phone").await.unwrap();
    wait_for(&mut phone_events, |e| {
        matches!(e, ServiceEvent::Pairing(PairingEvent::StatusChanged { status: PairingStatus::Paired, .. }))
    })
    .await;

    (desktop, desktop_events, phone)
}

/// A TCP port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_pair_then_ping() {
    let desktop_dir = TempDir::new().unwrap();
    let phone_dir = TempDir::new().unwrap();
    let (desktop, desktop_addr) = start_service(&desktop_dir, "desktop", "Desktop").await;
    let (phone, _) = start_service(&phone_dir, "phone", "Phone").await;
    let mut desktop_events = desktop.subscribe();
    let mut phone_events = phone.subscribe();

    phone
        .connect_to(desktop.identity().await, desktop_addr)
        .await
        .unwrap();
    wait_for(&mut desktop_events, connected("phone")).await;
    wait_for(&mut phone_events, connected("desktop")).await;

    let record = desktop.device("phone").await.unwrap();
    assert_eq!(record.name(), "Phone");
    assert_eq!(record.pairing_status, PairingStatus::Unpaired);
    assert_eq!(record.connection_state, ConnectionState::Connected);

    phone.request_pairing("desktop").await.unwrap();
    let request = wait_for(&mut desktop_events, |e| {
        matches!(e, ServiceEvent::Pairing(PairingEvent::RequestReceived { .. }))
    })
    .await;
    if let ServiceEvent::Pairing(PairingEvent::RequestReceived { device_id, .. }) = request {
        assert_eq!(device_id, "phone");
    }
    assert_eq!(
        desktop.device("phone").await.unwrap().pairing_status,
        PairingStatus::RequestedIncoming
    );
    assert_eq!(
        desktop.verification_key("phone").await.unwrap(),
        phone.verification_key("desktop").await.unwrap()
    );

    desktop.accept_pairing("phone").await.unwrap();
    wait_for(&mut phone_events, |e| {
        matches!(e, ServiceEvent::Pairing(PairingEvent::StatusChanged { status: PairingStatus::Paired, .. }))
    })
    .await;
    assert!(desktop.device("phone").await.unwrap().is_paired());
    assert!(desktop_dir.path().join("trusted").join("phone.pem").exists());
    assert_eq!(desktop.paired_devices().await.len(), 1);

    phone
        .send_ping("desktop", Some("hello".to_string()))
        .await
        .unwrap();
    let ping = wait_for(&mut desktop_events, |e| {
        matches!(e, ServiceEvent::Plugin { event: PluginEvent::PingReceived { .. }, .. })
    })
    .await;
    match ping {
        ServiceEvent::Plugin { device_id, event } => {
            assert_eq!(device_id, "phone");
            assert_eq!(
                event,
                PluginEvent::PingReceived {
                    message: Some("hello".to_string())
                }
            );
        }
        other => panic!("unexpected event {:?}", other),
    }

    // handled exactly once
    let again = timeout(Duration::from_millis(300), async {
        loop {
            if let Ok(ServiceEvent::Plugin {
                event: PluginEvent::PingReceived { .. },
                ..
            }) = desktop_events.recv().await
            {
                return;
            }
        }
    })
    .await;
    assert!(again.is_err());

    phone.shutdown().await;
    desktop.shutdown().await;
}

#[tokio::test]
async fn test_unpaired_mousepad_is_dropped() {
    let dir = TempDir::new().unwrap();
    let (desktop, addr) = start_service(&dir, "desktop", "Desktop").await;
    let mut events = desktop.subscribe();

    let peer = raw_peer("phone").await;
    peer.connect(desktop.identity().await, addr).await.unwrap();
    wait_for(&mut events, connected("phone")).await;

    let mouse = Packet::new(
        mousepad::PACKET_TYPE_MOUSEPAD_REQUEST,
        json!({ "dx": 5.0, "dy": 3.0 }),
    );
    peer.send_packet("desktop", &mouse).await.unwrap();
    // a ping after it proves the mousepad packet was processed
    peer.send_packet("desktop", &ping::create_ping(None))
        .await
        .unwrap();

    let input = timeout(Duration::from_millis(500), async {
        loop {
            if let Ok(ServiceEvent::Plugin { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(input.is_err(), "unpaired device reached a plugin");
    assert_eq!(
        desktop.device("phone").await.unwrap().pairing_status,
        PairingStatus::Unpaired
    );

    desktop.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_devices_keep_order() {
    const PACKETS: usize = 100;

    let dir = TempDir::new().unwrap();
    let (desktop, addr) = start_service(&dir, "desktop", "Desktop").await;
    let mut events = desktop.subscribe();

    let first = paired_raw_peer(&desktop, &mut events, addr, "phone_a").await;
    let second = paired_raw_peer(&desktop, &mut events, addr, "phone_b").await;
    for id in ["phone_a", "phone_b"] {
        assert!(desktop.device(id).await.unwrap().is_paired());
    }

    let send_all = |peer: ConnectionManager| async move {
        for i in 0..PACKETS {
            peer.send_packet("desktop", &ping::create_ping(Some(i.to_string())))
                .await
                .unwrap();
        }
        peer
    };
    let (first, second) = tokio::join!(send_all(first), send_all(second));

    let mut received: std::collections::HashMap<String, Vec<usize>> = Default::default();
    timeout(EVENT_TIMEOUT, async {
        while received.values().map(Vec::len).sum::<usize>() < 2 * PACKETS {
            if let Ok(ServiceEvent::Plugin {
                device_id,
                event: PluginEvent::PingReceived { message: Some(n) },
            }) = events.recv().await
            {
                received
                    .entry(device_id)
                    .or_default()
                    .push(n.parse().unwrap());
            }
        }
    })
    .await
    .expect("Timed out waiting for pings");

    let expected: Vec<usize> = (0..PACKETS).collect();
    assert_eq!(received["phone_a"], expected);
    assert_eq!(received["phone_b"], expected);

    first.stop().await;
    second.stop().await;
    desktop.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_pair_requests_create_one_request() {
    let dir = TempDir::new().unwrap();
    let (desktop, addr) = start_service(&dir, "desktop", "Desktop").await;
    let mut events = desktop.subscribe();

    let peer = raw_peer("phone").await;
    peer.connect(desktop.identity().await, addr).await.unwrap();
    wait_for(&mut events, connected("phone")).await;

    let request = PairingPacket::request();
    let (a, b) = tokio::join!(
        peer.send_packet("desktop", &request),
        peer.send_packet("desktop", &request)
    );
    a.unwrap();
    b.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, ServiceEvent::Pairing(PairingEvent::RequestReceived { .. }))
    })
    .await;
    let second = timeout(Duration::from_millis(300), async {
        loop {
            if let Ok(ServiceEvent::Pairing(PairingEvent::RequestReceived { .. })) =
                events.recv().await
            {
                return;
            }
        }
    })
    .await;
    assert!(second.is_err());
    assert_eq!(desktop.pending_pairing_requests().await.len(), 1);
    assert_eq!(
        desktop.device("phone").await.unwrap().pairing_status,
        PairingStatus::RequestedIncoming
    );

    desktop.shutdown().await;
}

#[tokio::test]
async fn test_paired_device_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let (desktop, addr) = start_service(&dir, "desktop", "Desktop").await;
        let mut events = desktop.subscribe();
        let peer = paired_raw_peer(&desktop, &mut events, addr, "phone").await;
        wait_for(&mut events, |e| {
            matches!(e, ServiceEvent::Pairing(PairingEvent::PairingAccepted { .. }))
        })
        .await;
        peer.stop().await;
        desktop.shutdown().await;
    }

    let config = ServiceConfig::new("Desktop", DeviceType::Desktop, dir.path())
        .with_listen_port(0)
        .without_discovery();
    let desktop = ConnectService::new(config).await.unwrap();
    assert_eq!(desktop.device_id(), "desktop");

    let phone = desktop.device("phone").await.unwrap();
    assert!(phone.is_paired());
    assert_eq!(phone.connection_state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_announced_identity_creates_record_and_times_out() {
    let dir = TempDir::new().unwrap();
    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = ServiceConfig::new("Desktop", DeviceType::Desktop, dir.path())
        .with_device_id("desktop")
        .with_listen_port(0)
        .with_discovery(DiscoveryConfig {
            bind_port: 0,
            broadcast_address: sink.local_addr().unwrap(),
            broadcast_interval: Duration::from_secs(3600),
            device_timeout: Duration::from_millis(300),
            timeout_check_interval: Duration::from_millis(50),
            ..Default::default()
        });
    let desktop = ConnectService::new(config).await.unwrap();
    let mut events = desktop.subscribe();
    let tcp_port = desktop.start().await.unwrap();
    let discovery_addr = SocketAddr::from((
        [127, 0, 0, 1],
        desktop.discovery_port().await.expect("discovery is running"),
    ));

    // a paired device that has gone offline
    let tablet = paired_raw_peer(
        &desktop,
        &mut events,
        SocketAddr::from(([127, 0, 0, 1], tcp_port)),
        "tablet",
    )
    .await;
    wait_for(&mut events, |e| {
        matches!(e, ServiceEvent::Pairing(PairingEvent::PairingAccepted { .. }))
    })
    .await;
    tablet.stop().await;
    wait_for(&mut events, |e| {
        matches!(e, ServiceEvent::DeviceDisconnected { device_id, .. } if device_id == "tablet")
    })
    .await;

    let port = closed_port().await;
    let phone = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for (id, device_type) in [("tablet", DeviceType::Tablet), ("phone", DeviceType::Phone)] {
        let identity = DeviceInfo::with_id(id, id, device_type, port).to_identity_packet();
        phone
            .send_to(&identity.to_bytes().unwrap(), discovery_addr)
            .await
            .unwrap();
    }

    let discovered = wait_for(&mut events, |e| {
        matches!(e, ServiceEvent::DeviceDiscovered { device } if device.id() == "phone")
    })
    .await;
    if let ServiceEvent::DeviceDiscovered { device } = discovered {
        assert_eq!(device.name(), "phone");
        assert_eq!(device.info.device_type, DeviceType::Phone);
        assert_eq!(device.pairing_status, PairingStatus::Unpaired);
        assert_ne!(device.connection_state, ConnectionState::Connected);
        assert_eq!(device.address, Some(SocketAddr::from(([127, 0, 0, 1], port))));
    }

    // new devices get a directed identity back
    let mut buf = vec![0u8; 64 * 1024];
    let (size, _) = timeout(EVENT_TIMEOUT, phone.recv_from(&mut buf))
        .await
        .expect("no directed identity")
        .unwrap();
    let reply = DeviceInfo::from_identity_packet(&Packet::from_bytes(&buf[..size]).unwrap()).unwrap();
    assert_eq!(reply.device_id, "desktop");
    assert_eq!(reply.tcp_port, tcp_port);

    wait_for(&mut events, |e| {
        matches!(e, ServiceEvent::DeviceLost { device_id } if device_id == "phone")
    })
    .await;
    assert!(desktop.device("phone").await.is_none());

    // the tablet timed out in the same sweep but stays known
    tokio::time::sleep(Duration::from_millis(300)).await;
    let tablet = desktop.device("tablet").await.expect("paired device was evicted");
    assert!(tablet.is_paired());
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(&event, ServiceEvent::DeviceLost { device_id } if device_id == "tablet"),
            "paired device reported lost"
        );
    }

    desktop.shutdown().await;
}

#[tokio::test]
async fn test_share_files_with_open_flag() {
    let desktop_dir = TempDir::new().unwrap();
    let phone_dir = TempDir::new().unwrap();
    let (desktop, mut events, phone) = paired_services(&desktop_dir, &phone_dir).await;

    let outbox = TempDir::new().unwrap();
    let files: Vec<(PathBuf, &[u8])> = vec![
        (outbox.path().join("first.txt"), &b"first file"[..]),
        (outbox.path().join("second.txt"), &b"the second file"[..]),
        (outbox.path().join("third.txt"), &b"third"[..]),
    ];
    for (path, content) in &files {
        tokio::fs::write(path, *content).await.unwrap();
    }

    let batch: Vec<PathBuf> = files[..2].iter().map(|(path, _)| path.clone()).collect();
    phone.send_files("desktop", &batch, true).await.unwrap();

    let mut progress = Vec::new();
    let mut received = Vec::new();
    timeout(EVENT_TIMEOUT, async {
        while received.len() < 2 {
            match events.recv().await {
                Ok(ServiceEvent::Plugin {
                    event:
                        PluginEvent::ShareProgress {
                            number_of_files,
                            total_payload_size,
                        },
                    ..
                }) => progress.push((number_of_files, total_payload_size)),
                Ok(ServiceEvent::Plugin {
                    device_id,
                    event: PluginEvent::FileReceived { path, size, open },
                }) => {
                    assert_eq!(device_id, "phone");
                    received.push((path, size, open));
                }
                Ok(ServiceEvent::Plugin {
                    event: PluginEvent::FileTransferFailed { reason, .. },
                    ..
                }) => panic!("transfer failed: {}", reason),
                _ => {}
            }
        }
    })
    .await
    .expect("Timed out waiting for shared files");

    assert_eq!(progress.first(), Some(&(2, 25)));
    assert!(progress.contains(&(1, 15)));
    received.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));
    for ((path, size, open), (sent_path, content)) in received.iter().zip(&files) {
        assert!(*open);
        assert_eq!(*size, content.len() as u64);
        assert_eq!(path.file_name(), sent_path.file_name());
        assert_eq!(tokio::fs::read(path).await.unwrap(), *content);
    }

    phone
        .send_file("desktop", &files[2].0, false)
        .await
        .unwrap();
    let single = wait_for(&mut events, |e| {
        matches!(e, ServiceEvent::Plugin { event: PluginEvent::FileReceived { .. }, .. })
    })
    .await;
    match single {
        ServiceEvent::Plugin {
            event: PluginEvent::FileReceived { path, open, .. },
            ..
        } => {
            assert!(!open);
            assert_eq!(tokio::fs::read(path).await.unwrap(), b"third");
        }
        other => panic!("unexpected event {:?}", other),
    }

    phone.shutdown().await;
    desktop.shutdown().await;
}

#[tokio::test]
async fn test_refused_session_reaches_no_plugin() {
    let dir = TempDir::new().unwrap();
    let (desktop, addr) = start_service(&dir, "desktop", "Desktop").await;
    let mut events = desktop.subscribe();

    let phone = paired_raw_peer(&desktop, &mut events, addr, "phone").await;
    wait_for(&mut events, |e| {
        matches!(e, ServiceEvent::Pairing(PairingEvent::PairingAccepted { .. }))
    })
    .await;

    // same id, different certificate
    let impostor = raw_peer("phone").await;
    impostor
        .connect(desktop.identity().await, addr)
        .await
        .unwrap();
    let _ = impostor
        .send_packet("desktop", &ping::create_ping(Some("spoofed".to_string())))
        .await;

    wait_for(&mut events, |e| {
        matches!(e, ServiceEvent::ConnectionFailed { device_id: Some(id), .. } if id == "phone")
    })
    .await;
    let reached = timeout(Duration::from_millis(500), async {
        loop {
            if let Ok(ServiceEvent::Plugin { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(reached.is_err(), "refused session reached a plugin");
    assert!(desktop.device("phone").await.unwrap().is_paired());

    impostor.stop().await;
    phone.stop().await;
    desktop.shutdown().await;
}

#[test]
fn test_split_frame_decodes_like_whole_frame() {
    let packet = Packet::new("kdeconnect.ping", json!({ "message": "split me" }));

    let mut encoded = BytesMut::new();
    PacketCodec::new()
        .encode(packet.clone(), &mut encoded)
        .unwrap();

    let mut whole = encoded.clone();
    let from_whole = PacketCodec::new().decode(&mut whole).unwrap().unwrap().unwrap();

    let mut codec = PacketCodec::new();
    let mut buf = BytesMut::new();
    let (head, tail) = encoded.split_at(encoded.len() / 2);
    buf.extend_from_slice(head);
    assert!(codec.decode(&mut buf).unwrap().is_none());
    buf.extend_from_slice(tail);
    let from_split = codec.decode(&mut buf).unwrap().unwrap().unwrap();

    assert_eq!(from_split, from_whole);
    assert_eq!(from_split, packet);
}
