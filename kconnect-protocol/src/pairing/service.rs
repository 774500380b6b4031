//! Pairing Service
//!
//! Runs the pairing handshake for every device. The service is the only
//! writer of [`PairingStatus`] in the registry, and it keeps the trust store
//! in step with it: a device is `Paired` exactly when its certificate is
//! stored.
//!
//! All transitions happen under the `active_requests` lock, so concurrent pair
//! packets for one device are applied one after the other and can never leave
//! two requests behind. Lock order is requests, then registry, then trust
//! store.

use super::certificate::{verification_key, CertificateInfo};
use super::events::PairingEvent;
use super::handler::{
    PairingDirection, PairingPacket, PairingRequest, PairingStatus, PAIRING_TIMEOUT,
};
use super::store::TrustStore;
use crate::connection::PacketSink;
use crate::device::DeviceManager;
use crate::{Device, Packet, PairingError, ProtocolError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pairing service configuration
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// How long a request waits for an answer
    pub timeout: Duration,
    /// How often expired requests are swept
    pub check_interval: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout: PAIRING_TIMEOUT,
            check_interval: Duration::from_secs(1),
        }
    }
}

/// Pairing service for managing device pairing
pub struct PairingService {
    /// Our device certificate
    certificate: Arc<CertificateInfo>,

    trust_store: Arc<RwLock<TrustStore>>,

    /// Active pairing requests (device_id -> request state)
    active_requests: Arc<Mutex<HashMap<String, PairingRequest>>>,

    devices: Arc<RwLock<DeviceManager>>,

    sink: Arc<dyn PacketSink>,

    event_tx: mpsc::UnboundedSender<PairingEvent>,
    event_rx: Arc<RwLock<mpsc::UnboundedReceiver<PairingEvent>>>,

    config: PairingConfig,

    timeout_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PairingService {
    /// Create a new pairing service
    ///
    /// Registry records claiming `Paired` without a stored certificate are
    /// downgraded to `Unpaired`.
    pub async fn new(
        certificate: Arc<CertificateInfo>,
        trust_store: TrustStore,
        devices: Arc<RwLock<DeviceManager>>,
        sink: Arc<dyn PacketSink>,
        config: PairingConfig,
    ) -> Result<Self> {
        {
            let mut registry = devices.write().await;
            let orphaned: Vec<String> = registry
                .paired_devices()
                .filter(|d| !trust_store.is_trusted(d.id()))
                .map(|d| d.id().to_string())
                .collect();
            for device_id in orphaned {
                warn!(
                    "Device {} marked paired without a stored certificate, unpairing",
                    device_id
                );
                registry.set_pairing_status(&device_id, PairingStatus::Unpaired)?;
            }
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Self {
            certificate,
            trust_store: Arc::new(RwLock::new(trust_store)),
            active_requests: Arc::new(Mutex::new(HashMap::new())),
            devices,
            sink,
            event_tx,
            event_rx: Arc::new(RwLock::new(event_rx)),
            config,
            timeout_task: std::sync::Mutex::new(None),
        })
    }

    /// Get a receiver for pairing events
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<PairingEvent> {
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

    /// Get our device certificate
    pub fn certificate(&self) -> &CertificateInfo {
        &self.certificate
    }

    /// Get our certificate fingerprint
    pub fn fingerprint(&self) -> &str {
        &self.certificate.fingerprint
    }

    /// Start sweeping expired requests
    pub fn start(&self) {
        let requests = self.active_requests.clone();
        let devices = self.devices.clone();
        let event_tx = self.event_tx.clone();
        let check_interval = self.config.check_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            loop {
                interval.tick().await;
                expire_requests(&requests, &devices, &event_tx).await;
            }
        });

        if let Ok(mut task) = self.timeout_task.lock() {
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Stop the timeout sweeper
    pub fn stop(&self) {
        if let Ok(mut task) = self.timeout_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    /// Expire overdue requests now
    pub async fn check_timeouts(&self) {
        expire_requests(&self.active_requests, &self.devices, &self.event_tx).await;
    }

    /// Snapshot of pending requests
    pub async fn pending_requests(&self) -> Vec<PairingRequest> {
        self.active_requests.lock().await.values().cloned().collect()
    }

    /// Check if a device is paired
    pub async fn is_paired(&self, device_id: &str) -> bool {
        self.trust_store.read().await.is_trusted(device_id)
    }

    /// Verification key for a device: from the certificate on its current
    /// session, or the stored one if it is not connected
    pub async fn verification_key(&self, device_id: &str) -> Result<String> {
        let presented = self
            .devices
            .read()
            .await
            .get_device(device_id)
            .and_then(|d| d.certificate_data.clone());

        let peer = match presented {
            Some(cert) => cert,
            None => self
                .trust_store
                .read()
                .await
                .get(device_id)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| {
                    ProtocolError::CertificateValidation(format!(
                        "No certificate known for {}",
                        device_id
                    ))
                })?,
        };

        Ok(verification_key(&self.certificate.certificate, &peer))
    }

    async fn try_verification_key(&self, device_id: &str) -> Option<String> {
        self.verification_key(device_id).await.ok()
    }

    fn emit(&self, event: PairingEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn send(&self, device_id: &str, packet: Packet) -> Result<()> {
        self.sink.send_packet(device_id, &packet).await
    }

    async fn save_registry(&self) {
        if let Err(e) = self.devices.read().await.save_registry() {
            warn!("Failed to save device registry: {}", e);
        }
    }

    /// Ask a device to pair
    ///
    /// Unpaired becomes RequestedOutgoing and `pair: true` is sent. The
    /// peer's answer arrives through [`Self::handle_pair_packet`].
    pub async fn request_pairing(&self, device_id: &str) -> Result<()> {
        {
            let mut requests = self.active_requests.lock().await;
            let mut devices = self.devices.write().await;

            let device = devices
                .get_device(device_id)
                .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

            if device.is_paired() {
                return Err(PairingError::AlreadyPaired(device_id.to_string()).into());
            }
            if requests.contains_key(device_id) {
                return Err(PairingError::AlreadyPairing(device_id.to_string()).into());
            }

            info!(
                "Requesting pairing with device {} ({})",
                device.name(),
                device_id
            );

            requests.insert(
                device_id.to_string(),
                PairingRequest::new(device_id, PairingDirection::Outgoing, self.config.timeout),
            );
            set_status(
                &mut devices,
                &self.event_tx,
                device_id,
                PairingStatus::RequestedOutgoing,
            )?;
        }

        if let Err(e) = self.send(device_id, PairingPacket::request()).await {
            warn!("Failed to send pairing request to {}: {}", device_id, e);
            let mut requests = self.active_requests.lock().await;
            requests.remove(device_id);
            let mut devices = self.devices.write().await;
            set_status(
                &mut devices,
                &self.event_tx,
                device_id,
                PairingStatus::Unpaired,
            )?;
            return Err(e);
        }

        self.emit(PairingEvent::RequestSent {
            device_id: device_id.to_string(),
            verification_key: self.try_verification_key(device_id).await,
        });

        Ok(())
    }

    /// Apply a `kdeconnect.pair` packet received from `device_id`
    pub async fn handle_pair_packet(&self, device_id: &str, packet: &Packet) -> Result<()> {
        let pairing = PairingPacket::from_packet(packet)?;
        debug!(
            "Pairing packet from {} - pair: {}",
            device_id, pairing.pair
        );

        if pairing.pair {
            self.on_pair_requested(device_id).await
        } else {
            self.on_pair_refused(device_id).await
        }
    }

    async fn on_pair_requested(&self, device_id: &str) -> Result<()> {
        let mut requests = self.active_requests.lock().await;
        let mut devices = self.devices.write().await;

        let device = devices
            .snapshot(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        if device.is_paired() {
            drop(devices);
            drop(requests);
            debug!("Pair request from already paired {}, confirming", device_id);
            return self.send(device_id, PairingPacket::accept()).await;
        }

        match requests.get(device_id).map(|r| (r.direction, r.is_expired())) {
            Some((PairingDirection::Outgoing, false)) => {
                requests.remove(device_id);
                let fingerprint = {
                    let mut trust = self.trust_store.write().await;
                    complete_pairing(&mut trust, &device)?
                };
                set_status(&mut devices, &self.event_tx, device_id, PairingStatus::Paired)?;
                drop(devices);
                drop(requests);

                info!("Pairing accepted by device {}", device_id);
                self.save_registry().await;
                self.emit(PairingEvent::PairingAccepted {
                    device_id: device_id.to_string(),
                    device_name: device.name().to_string(),
                    certificate_fingerprint: fingerprint,
                });
                Ok(())
            }
            Some((PairingDirection::Incoming, false)) => {
                debug!("Duplicate pairing request from {} ignored", device_id);
                Ok(())
            }
            Some((PairingDirection::Incoming, true)) => {
                requests.remove(device_id);
                set_status(&mut devices, &self.event_tx, device_id, PairingStatus::Unpaired)?;
                drop(devices);
                drop(requests);

                info!(
                    "Pairing request from {} repeated after expiry, rejecting",
                    device_id
                );
                self.emit(PairingEvent::PairingRejected {
                    device_id: device_id.to_string(),
                    reason: Some("Request expired".to_string()),
                });
                self.send(device_id, PairingPacket::reject()).await
            }
            Some((PairingDirection::Outgoing, true)) | None => {
                if requests.remove(device_id).is_some() {
                    self.emit(PairingEvent::PairingTimeout {
                        device_id: device_id.to_string(),
                    });
                }

                requests.insert(
                    device_id.to_string(),
                    PairingRequest::new(device_id, PairingDirection::Incoming, self.config.timeout),
                );
                set_status(
                    &mut devices,
                    &self.event_tx,
                    device_id,
                    PairingStatus::RequestedIncoming,
                )?;
                drop(devices);
                drop(requests);

                info!(
                    "Pairing request received from {} ({})",
                    device.name(),
                    device_id
                );
                let verification_key = device
                    .certificate_data
                    .as_ref()
                    .map(|peer| verification_key(&self.certificate.certificate, peer));
                self.emit(PairingEvent::RequestReceived {
                    device_id: device_id.to_string(),
                    device_name: device.name().to_string(),
                    verification_key,
                });
                Ok(())
            }
        }
    }

    async fn on_pair_refused(&self, device_id: &str) -> Result<()> {
        let mut requests = self.active_requests.lock().await;
        let mut devices = self.devices.write().await;

        let was_paired = devices.get_device(device_id).is_some_and(Device::is_paired);

        if was_paired {
            self.trust_store.write().await.remove(device_id)?;
            set_status(&mut devices, &self.event_tx, device_id, PairingStatus::Unpaired)?;
            drop(devices);
            drop(requests);

            info!("Unpaired by device {}", device_id);
            self.save_registry().await;
            self.emit(PairingEvent::DeviceUnpaired {
                device_id: device_id.to_string(),
            });
            return Ok(());
        }

        match requests.remove(device_id) {
            Some(request) => {
                set_status(&mut devices, &self.event_tx, device_id, PairingStatus::Unpaired)?;
                let reason = match request.direction {
                    PairingDirection::Outgoing => "Rejected by peer",
                    PairingDirection::Incoming => "Cancelled by peer",
                };
                info!("Pairing with {} ended: {}", device_id, reason);
                self.emit(PairingEvent::PairingRejected {
                    device_id: device_id.to_string(),
                    reason: Some(reason.to_string()),
                });
            }
            None => debug!("Unpair from already unpaired {} ignored", device_id),
        }

        Ok(())
    }

    /// Accept a pending incoming request (the host's decision)
    pub async fn accept_pairing(&self, device_id: &str) -> Result<()> {
        let (device, fingerprint) = {
            let mut requests = self.active_requests.lock().await;
            let mut devices = self.devices.write().await;

            let request = match requests.get(device_id) {
                Some(request) if request.direction == PairingDirection::Incoming => request,
                _ => return Err(PairingError::NotPending(device_id.to_string()).into()),
            };

            if request.is_expired() {
                requests.remove(device_id);
                set_status(&mut devices, &self.event_tx, device_id, PairingStatus::Unpaired)?;
                self.emit(PairingEvent::PairingTimeout {
                    device_id: device_id.to_string(),
                });
                return Err(PairingError::Expired(device_id.to_string()).into());
            }

            let device = devices
                .snapshot(device_id)
                .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

            let fingerprint = {
                let mut trust = self.trust_store.write().await;
                complete_pairing(&mut trust, &device)?
            };
            requests.remove(device_id);
            set_status(&mut devices, &self.event_tx, device_id, PairingStatus::Paired)?;
            (device, fingerprint)
        };

        info!("Accepted pairing with device {}", device_id);
        self.save_registry().await;

        if let Err(e) = self.send(device_id, PairingPacket::accept()).await {
            warn!("Failed to send pairing accept to {}: {}", device_id, e);
        }

        self.emit(PairingEvent::PairingAccepted {
            device_id: device_id.to_string(),
            device_name: device.name().to_string(),
            certificate_fingerprint: fingerprint,
        });

        Ok(())
    }

    /// Reject a pending incoming request, or cancel our own
    pub async fn reject_pairing(&self, device_id: &str) -> Result<()> {
        let request = {
            let mut requests = self.active_requests.lock().await;
            let request = requests
                .remove(device_id)
                .ok_or_else(|| PairingError::NotPending(device_id.to_string()))?;
            let mut devices = self.devices.write().await;
            set_status(&mut devices, &self.event_tx, device_id, PairingStatus::Unpaired)?;
            request
        };

        let reason = match request.direction {
            PairingDirection::Incoming => "Rejected by user",
            PairingDirection::Outgoing => "Cancelled by user",
        };
        info!("Pairing with {}: {}", device_id, reason);

        if let Err(e) = self.send(device_id, PairingPacket::reject()).await {
            warn!("Failed to send pairing reject to {}: {}", device_id, e);
        }

        self.emit(PairingEvent::PairingRejected {
            device_id: device_id.to_string(),
            reason: Some(reason.to_string()),
        });

        Ok(())
    }

    /// Unpair from a device; succeeds whatever the current state
    pub async fn unpair(&self, device_id: &str) -> Result<()> {
        let (was_paired, connected) = {
            let mut requests = self.active_requests.lock().await;
            let mut devices = self.devices.write().await;
            requests.remove(device_id);

            let trusted = self.trust_store.write().await.remove(device_id)?;
            let (paired, connected) = devices
                .get_device(device_id)
                .map(|d| (d.is_paired(), d.is_connected()))
                .unwrap_or((false, false));

            if devices.has_device(device_id) {
                set_status(&mut devices, &self.event_tx, device_id, PairingStatus::Unpaired)?;
            }
            (trusted || paired, connected)
        };

        if !was_paired {
            debug!("Unpair of {} that was not paired", device_id);
            return Ok(());
        }

        info!("Unpairing from device {}", device_id);
        self.save_registry().await;

        if connected {
            if let Err(e) = self.send(device_id, PairingPacket::unpair()).await {
                warn!("Failed to send unpair to {}: {}", device_id, e);
            }
        }

        self.emit(PairingEvent::DeviceUnpaired {
            device_id: device_id.to_string(),
        });

        Ok(())
    }

    /// Check a freshly connected device against the trust store
    ///
    /// A trusted device must present its stored certificate; a mismatch is a
    /// `CertificateValidation` error and the caller drops the session.
    pub async fn on_device_connected(&self, device_id: &str) -> Result<()> {
        let mut devices = self.devices.write().await;
        let device = devices
            .snapshot(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;

        let trust = self.trust_store.read().await;

        if trust.is_trusted(device_id) {
            let presented = device.certificate_data.as_deref().ok_or_else(|| {
                ProtocolError::CertificateValidation(format!(
                    "Paired device {} presented no certificate",
                    device_id
                ))
            })?;

            if !trust.matches(device_id, presented) {
                warn!(
                    "Paired device {} presented a different certificate",
                    device_id
                );
                return Err(ProtocolError::CertificateValidation(format!(
                    "Certificate of {} does not match the paired one",
                    device_id
                )));
            }

            if !device.is_paired() {
                set_status(&mut devices, &self.event_tx, device_id, PairingStatus::Paired)?;
            }
        } else if device.is_paired() {
            set_status(&mut devices, &self.event_tx, device_id, PairingStatus::Unpaired)?;
        }

        Ok(())
    }

    /// Drop any pending request for a device whose session ended
    pub async fn on_device_disconnected(&self, device_id: &str) {
        let mut requests = self.active_requests.lock().await;
        if requests.remove(device_id).is_some() {
            let mut devices = self.devices.write().await;
            if let Err(e) =
                set_status(&mut devices, &self.event_tx, device_id, PairingStatus::Unpaired)
            {
                debug!("Could not reset pairing status of {}: {}", device_id, e);
            }
            self.emit(PairingEvent::PairingRejected {
                device_id: device_id.to_string(),
                reason: Some("Device disconnected".to_string()),
            });
        }
    }
}

impl Drop for PairingService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Trust the certificate the device presented on its current session
fn complete_pairing(trust: &mut TrustStore, device: &Device) -> Result<String> {
    let certificate = device.certificate_data.as_deref().ok_or_else(|| {
        ProtocolError::CertificateValidation(format!(
            "Device {} has not presented a certificate",
            device.id()
        ))
    })?;

    trust.store(device.id(), certificate)?;
    Ok(CertificateInfo::calculate_fingerprint(certificate))
}

fn set_status(
    devices: &mut DeviceManager,
    event_tx: &mpsc::UnboundedSender<PairingEvent>,
    device_id: &str,
    status: PairingStatus,
) -> Result<()> {
    let previous = devices.get_device(device_id).map(|d| d.pairing_status);
    devices.set_pairing_status(device_id, status)?;

    if previous != Some(status) {
        let _ = event_tx.send(PairingEvent::StatusChanged {
            device_id: device_id.to_string(),
            status,
        });
    }
    Ok(())
}

async fn expire_requests(
    requests: &Mutex<HashMap<String, PairingRequest>>,
    devices: &RwLock<DeviceManager>,
    event_tx: &mpsc::UnboundedSender<PairingEvent>,
) {
    let mut requests = requests.lock().await;
    let expired: Vec<String> = requests
        .values()
        .filter(|r| r.is_expired())
        .map(|r| r.device_id.clone())
        .collect();

    if expired.is_empty() {
        return;
    }

    let mut devices = devices.write().await;
    for device_id in expired {
        info!("Pairing request timed out for device {}", device_id);
        requests.remove(&device_id);
        if let Err(e) = set_status(&mut devices, event_tx, &device_id, PairingStatus::Unpaired) {
            debug!("Could not reset pairing status of {}: {}", device_id, e);
        }
        let _ = event_tx.send(PairingEvent::PairingTimeout { device_id });
    }
}
