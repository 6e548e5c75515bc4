//! SIP Sieve Agent
//!
//! Loads the `xdp_sip` classifier, attaches it to the configured interface,
//! keeps the blocked/allowed address maps in line with the configuration and
//! reports the classifier's counters.

use parking_lot::{Mutex, RwLock};
use sipsieve_common::{config::Config, telemetry};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub mod ebpf;
mod handlers;
pub mod policy;
pub mod reporter;

use ebpf::interface::NetworkInterface;
use ebpf::loader::{EbpfLoader, XdpMode};
use ebpf::maps::MapManager;
use policy::{DesiredPolicy, OwnedEntries};

const SERVICE_NAME: &str = "agent";

/// Agent runtime state
pub struct AgentRuntime {
    /// Loaded object and attachment
    pub loader: Arc<RwLock<EbpfLoader>>,
    /// Classifier maps
    pub maps: Arc<RwLock<MapManager>>,
    /// Current configuration, replaced on reload
    pub config: Arc<RwLock<Config>>,
    /// Interface the classifier is attached to
    pub interface: Arc<NetworkInterface>,
    /// Map entries inserted by this process
    owned: Mutex<OwnedEntries>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AgentRuntime {
    pub fn new(
        loader: EbpfLoader,
        maps: MapManager,
        config: Config,
        interface: NetworkInterface,
        owned: OwnedEntries,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            loader: Arc::new(RwLock::new(loader)),
            maps: Arc::new(RwLock::new(maps)),
            config: Arc::new(RwLock::new(config)),
            interface: Arc::new(interface),
            owned: Mutex::new(owned),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Get a clone of the shutdown receiver
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Re-read the configuration and re-apply its policy section.
    ///
    /// Interface, program and server settings need a restart.
    pub fn reload_policy(&self) -> sipsieve_common::Result<()> {
        let config = Config::load(SERVICE_NAME)?;
        let desired = DesiredPolicy::from_config(&config.policy)?;

        let mut owned = self.owned.lock();
        let report = policy::apply(&mut *self.maps.write(), &desired, &mut owned)?;
        info!(
            blocked = report.blocked.entries,
            allowed = report.allowed.entries,
            strict_protocol = desired.config.strict_protocol(),
            "Policy reloaded"
        );

        *self.config.write() = config;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load(SERVICE_NAME)?;

    // Initialize telemetry
    telemetry::init(SERVICE_NAME, &config.telemetry)?;

    info!(
        "Starting {} service v{}",
        SERVICE_NAME,
        env!("CARGO_PKG_VERSION")
    );

    // Check for root privileges (required for eBPF)
    if !nix::unistd::geteuid().is_root() {
        warn!("Agent is not running as root - the XDP program will likely fail to load");
    }

    let interface = ebpf::interface::get_interface(&config.interface.name)?;
    info!(
        "Using interface {} (index: {}, ipv4: {:?}, xdp_capable: {})",
        interface.name,
        interface.index,
        interface.ipv4_addresses,
        interface.supports_xdp()
    );
    if !interface.supports_xdp() {
        warn!(interface = %interface.name, "Interface does not look XDP capable");
    }

    let mode: XdpMode = config.interface.xdp_mode.parse()?;

    // Validate the policy before touching the kernel
    let desired = DesiredPolicy::from_config(&config.policy)?;

    let mut loader = EbpfLoader::load_from_file(
        Path::new(&config.program.object_path),
        Path::new(&config.program.pin_path),
    )?;
    loader.init_logger();

    // Populate the maps before the first packet is classified
    let mut maps = loader.take_maps()?;
    let mut owned = OwnedEntries::new();
    let report = policy::apply(&mut maps, &desired, &mut owned)?;
    info!(
        blocked = report.blocked.entries,
        allowed = report.allowed.entries,
        strict_protocol = desired.config.strict_protocol(),
        authoritative = desired.authoritative,
        "Policy applied"
    );

    let attached_mode = loader.attach_xdp(&interface, mode)?;
    if attached_mode != mode {
        warn!(
            requested = mode.as_str(),
            attached = attached_mode.as_str(),
            "XDP attached in a fallback mode"
        );
    }

    let report_interval = Duration::from_secs(config.reporter.interval_secs.max(1));
    let http_addr: SocketAddr = config.http_addr().parse()?;

    let runtime = Arc::new(AgentRuntime::new(loader, maps, config, interface, owned));

    let agent_state = handlers::AgentState::new(
        Arc::clone(&runtime.loader),
        Arc::clone(&runtime.maps),
        Arc::clone(&runtime.config),
        Arc::clone(&runtime.interface),
    );

    // Start HTTP server (health checks, metrics, counters)
    let http_server = handlers::http::create_router(agent_state);
    let http_handle = tokio::spawn(async move {
        info!(addr = %http_addr, "Starting HTTP server");
        match tokio::net::TcpListener::bind(http_addr).await {
            Ok(listener) => {
                info!(addr = %http_addr, "HTTP server listening");
                if let Err(e) = axum::serve(listener, http_server).await {
                    error!(error = %e, "HTTP server error");
                }
            }
            Err(e) => {
                error!(error = %e, addr = %http_addr, "Failed to bind HTTP server");
            }
        }
    });

    let reporter_handle = reporter::spawn_reporter(
        Arc::clone(&runtime.maps),
        report_interval,
        runtime.shutdown_receiver(),
    );

    let reload_handle = spawn_reload_task(Arc::clone(&runtime));

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    runtime.shutdown();

    let shutdown_timeout = Duration::from_secs(10);
    tokio::select! {
        _ = tokio::time::sleep(shutdown_timeout) => {
            warn!("Shutdown timeout reached, forcing exit");
        }
        _ = async {
            let _ = reporter_handle.await;
            let _ = reload_handle.await;
        } => {
            info!("Background tasks stopped");
        }
    }
    http_handle.abort();

    // Pinned maps outlive the agent; only the program is removed.
    if let Err(e) = runtime.loader.write().detach_xdp() {
        error!(error = %e, "Failed to detach XDP program");
    }

    info!("Agent shutdown complete");
    Ok(())
}

/// Spawn the SIGHUP policy reload task
fn spawn_reload_task(runtime: Arc<AgentRuntime>) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = runtime.shutdown_receiver();

    tokio::spawn(async move {
        let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGHUP, policy reload disabled");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Reload task shutting down");
                        break;
                    }
                }
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received SIGHUP, reloading policy");
                    if let Err(e) = runtime.reload_policy() {
                        error!(error = %e, "Policy reload failed, keeping current maps");
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C signal"),
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM signal"),
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
