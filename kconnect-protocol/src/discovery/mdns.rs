//! mDNS advertisement
//!
//! Registers `_kdeconnect._udp.local.` with the identity properties and
//! browses for other devices. Networks that drop UDP broadcast still pass
//! multicast DNS; each resolved peer triggers an identity broadcast so it can
//! connect back.

use crate::{DeviceInfo, ProtocolError, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Service type advertised by KDE Connect peers
pub const MDNS_SERVICE_TYPE: &str = "_kdeconnect._udp.local.";

fn mdns_error(e: mdns_sd::Error) -> ProtocolError {
    ProtocolError::Discovery(format!("mDNS: {}", e))
}

/// Running mDNS registration and browser
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    fullname: String,
    browser: JoinHandle<()>,
}

impl MdnsDiscovery {
    /// Register our service and start browsing
    ///
    /// `announce` is notified whenever another device is resolved.
    pub fn start(device_info: &DeviceInfo, announce: Arc<Notify>) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(mdns_error)?;

        let mut properties = HashMap::new();
        properties.insert("id".to_string(), device_info.device_id.clone());
        properties.insert("name".to_string(), device_info.device_name.clone());
        properties.insert("type".to_string(), device_info.device_type.to_string());
        properties.insert(
            "protocol".to_string(),
            device_info.protocol_version.to_string(),
        );

        let service = ServiceInfo::new(
            MDNS_SERVICE_TYPE,
            &device_info.device_id,
            &format!("{}.local.", device_info.device_id),
            "",
            device_info.tcp_port,
            properties,
        )
        .map_err(mdns_error)?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();
        daemon.register(service).map_err(mdns_error)?;
        info!("Registered mDNS service {}", fullname);

        let receiver = daemon.browse(MDNS_SERVICE_TYPE).map_err(mdns_error)?;
        let own_id = device_info.device_id.clone();

        let browser = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                if let ServiceEvent::ServiceResolved(resolved) = event {
                    match resolved.get_property_val_str("id") {
                        Some(id) if id != own_id => {
                            debug!("Resolved KDE Connect peer {} over mDNS", id);
                            announce.notify_one();
                        }
                        Some(_) => {}
                        None => debug!("Resolved mDNS service without id property"),
                    }
                }
            }
        });

        Ok(Self {
            daemon,
            fullname,
            browser,
        })
    }

    /// Unregister and stop the daemon
    pub fn shutdown(self) {
        self.browser.abort();

        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!("Failed to unregister mDNS service: {}", e);
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!("Failed to stop mDNS daemon: {}", e);
        }
    }
}
