mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kconnect_protocol::pairing::PairingEvent;
use kconnect_protocol::plugins::PluginEvent;
use kconnect_protocol::{
    ConnectService, DeviceCommunicationService, DeviceManager, ServiceEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;

#[derive(Debug, Parser)]
#[command(name = "kconnect-daemon", version, about = "KDE Connect compatible daemon")]
struct Cli {
    /// Configuration file [default: $XDG_CONFIG_HOME/kconnect/daemon.toml]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device name announced to other devices
    #[arg(long)]
    name: Option<String>,

    /// Log filter, e.g. "debug" or "kconnect_protocol=trace" (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Accept every incoming pairing request
    #[arg(long)]
    auto_accept: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List known devices from the registry and exit
    Devices,
}

fn init_logging(cli: &Cli) {
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn list_devices(config: &Config) -> Result<()> {
    let registry = DeviceManager::new(config.registry_path())
        .context("Failed to open device registry")?;

    if registry.device_count() == 0 {
        println!("No known devices");
        return Ok(());
    }

    let mut devices: Vec<_> = registry.devices().collect();
    devices.sort_by(|a, b| a.name().cmp(b.name()));
    for device in devices {
        println!(
            "{}  {} ({})  {:?}",
            device.id(),
            device.name(),
            device.info.device_type,
            device.pairing_status
        );
    }
    Ok(())
}

/// Log service events and answer pairing requests
struct Daemon {
    service: Arc<dyn DeviceCommunicationService>,
    auto_accept: bool,
}

impl Daemon {
    async fn handle_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::Started { tcp_port } => info!("Listening on TCP port {}", tcp_port),
            ServiceEvent::Stopped => info!("Service stopped"),
            ServiceEvent::DeviceDiscovered { device } => {
                info!("Discovered {} ({})", device.name(), device.id())
            }
            ServiceEvent::DeviceConnected { device } => info!(
                "Connected to {} ({}), {:?}",
                device.name(),
                device.id(),
                device.pairing_status
            ),
            ServiceEvent::DeviceDisconnected { device_id, reason } => {
                info!("Disconnected from {}: {:?}", device_id, reason)
            }
            ServiceEvent::DeviceLost { device_id } => info!("Lost {}", device_id),
            ServiceEvent::ConnectionFailed { device_id, reason } => {
                warn!("Connection to {:?} failed: {}", device_id, reason)
            }
            ServiceEvent::Pairing(event) => self.handle_pairing(event).await,
            ServiceEvent::Plugin { device_id, event } => self.handle_plugin(&device_id, event),
        }
    }

    async fn handle_pairing(&self, event: PairingEvent) {
        match event {
            PairingEvent::RequestReceived {
                device_id,
                device_name,
                verification_key,
            } => {
                info!(
                    "Pairing request from {} ({}), verification key {}",
                    device_name,
                    device_id,
                    verification_key.as_deref().unwrap_or("unavailable")
                );
                if self.auto_accept {
                    match self.service.accept_pairing(&device_id).await {
                        Ok(()) => info!("Accepted pairing with {}", device_name),
                        Err(e) => error!("Failed to accept pairing with {}: {}", device_id, e),
                    }
                } else {
                    info!("Start with --auto-accept to accept pairing requests");
                }
            }
            PairingEvent::PairingAccepted { device_name, .. } => {
                info!("Paired with {}", device_name)
            }
            PairingEvent::PairingRejected { device_id, reason } => {
                info!("Pairing with {} rejected: {:?}", device_id, reason)
            }
            PairingEvent::DeviceUnpaired { device_id } => info!("Unpaired from {}", device_id),
            PairingEvent::PairingTimeout { device_id } => {
                info!("Pairing request of {} expired", device_id)
            }
            PairingEvent::Error { device_id, message } => {
                warn!("Pairing error ({:?}): {}", device_id, message)
            }
            other => debug!("Pairing event: {:?}", other),
        }
    }

    fn handle_plugin(&self, device_id: &str, event: PluginEvent) {
        match event {
            PluginEvent::PingReceived { message } => {
                info!("Ping from {}: {}", device_id, message.as_deref().unwrap_or(""))
            }
            PluginEvent::FindMyPhoneRequested => info!("{} is looking for this device", device_id),
            PluginEvent::FileReceived { path, size, open } => {
                info!("Received {:?} ({} bytes) from {}", path, size, device_id);
                if open {
                    info!("{} asked for {:?} to be opened", device_id, path);
                }
            }
            PluginEvent::FileTransferFailed { filename, reason } => {
                warn!("Receiving '{}' from {} failed: {}", filename, device_id, reason)
            }
            PluginEvent::BatteryUpdated(state) => info!(
                "{} battery {}%{}",
                device_id,
                state.charge,
                if state.is_charging { " (charging)" } else { "" }
            ),
            other => debug!("{}: {:?}", device_id, other),
        }
    }

    async fn run(&self, mut events: broadcast::Receiver<ServiceEvent>) -> Result<()> {
        info!("Press Ctrl+C to stop");

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl+C")?;
                    info!("Received shutdown signal");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Event log fell behind, {} events skipped", missed)
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::default_config_dir().join(config::CONFIG_FILE));
    let mut config = Config::load(&config_path).context("Failed to load configuration")?;
    if let Some(name) = &cli.name {
        config.device.name = name.clone();
    }

    if let Some(Command::Devices) = cli.command {
        return list_devices(&config);
    }

    info!("Starting KConnect daemon");
    info!("Device name: {}", config.device.name);
    info!("Device type: {}", config.device.device_type);

    let service_config = config.service_config()?;
    let service = ConnectService::new(service_config)
        .await
        .context("Failed to create service")?;
    info!("Device id: {}", service.device_id());
    info!("Certificate fingerprint: {}", service.certificate().fingerprint);

    let events = service.subscribe();
    service.start().await.context("Failed to start service")?;

    let daemon = Daemon {
        service: Arc::new(service),
        auto_accept: cli.auto_accept || config.pairing.auto_accept,
    };

    let result = daemon.run(events).await;
    daemon.service.shutdown().await;
    result
}
