//! Connection Daemon
//!
//! Owns one tunnel for the lifetime of a connection and sequences
//! everything around it.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──▶ Connecting ──▶ Configuring ──▶ Connected ──▶ Disconnecting ──▶ Terminated
//!              │               │
//!              └───────┬───────┘
//!                      ▼
//!                   Failed
//! ```
//!
//! State is saved and the control channel opened before `Connected` is
//! published, so an observer of `Connected` can already query status.
//!
//! SIGINT/SIGTERM are watched from the start of [`Daemon::run`], so a
//! signal during `Connecting` cancels the tunnel connect and lets the
//! backend clean up instead of killing the process.
//!
//! Teardown always runs the same [`TEARDOWN_ORDER`], whichever trigger
//! (signal, IPC `disconnect`, parent cancellation) ended the wait. Routes
//! go before DNS and the tunnel goes last among the network steps since
//! the routes reference the tunnel interface.

use crate::ipc::{IpcEndpoint, IpcError, IpcHandler, IpcRequest, IpcResponse, IpcServer, CMD_DISCONNECT, CMD_STATUS};
use crate::profile::{Protocol, ServerProfile};
use crate::state::{ConnectionState, StateError, StateStore};
use crate::tunnel::{Tunnel, TunnelError};
use async_trait::async_trait;
use chrono::Utc;
use fos_network::{NetworkConfigurator, NetworkError};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

/// Interface name used when the tunnel does not report one
pub const DEFAULT_INTERFACE: &str = "fosvpn0";

/// Daemon lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonPhase {
    Idle,
    Connecting,
    Configuring,
    /// Network configured; traffic routes through the tunnel
    Connected,
    Disconnecting,
    Terminated,
    /// Connect or configure failed; nothing is left applied
    Failed,
}

impl DaemonPhase {
    /// No further transitions will happen
    pub fn is_final(&self) -> bool {
        matches!(self, DaemonPhase::Terminated | DaemonPhase::Failed)
    }
}

/// Daemon errors
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("VPN already connected to {0}")]
    AlreadyConnected(String),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("network configuration failed: {0}")]
    Network(#[from] NetworkError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// One independent teardown action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    CloseIpc,
    RemoveRoutes,
    RestoreDns,
    DisconnectTunnel,
    ClearState,
}

/// Order in which teardown runs
pub const TEARDOWN_ORDER: [TeardownStep; 5] = [
    TeardownStep::CloseIpc,
    TeardownStep::RemoveRoutes,
    TeardownStep::RestoreDns,
    TeardownStep::DisconnectTunnel,
    TeardownStep::ClearState,
];

/// State visible to IPC connection tasks
pub struct DaemonShared {
    tunnel: Arc<dyn Tunnel>,
    store: StateStore,
    cancel: CancellationToken,
}

impl DaemonShared {
    /// Stored state with live counters from the tunnel
    async fn status(&self) -> IpcResponse {
        let mut state = match self.store.load() {
            Ok(Some(state)) => state,
            Ok(None) => return IpcResponse::failure("not connected"),
            Err(e) => return IpcResponse::failure(e.to_string()),
        };

        if !self.tunnel.is_active() {
            return IpcResponse::with_state(state);
        }

        let live = self.tunnel.status().await;
        if live.has_counters() {
            state.tx_bytes = live.tx_bytes;
            state.rx_bytes = live.rx_bytes;
            if let Err(e) = self.store.save(&state) {
                debug!("Failed to persist refreshed counters: {}", e);
            }
        }

        IpcResponse::with_state(state)
    }
}

#[async_trait]
impl IpcHandler for DaemonShared {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request.command.as_str() {
            CMD_STATUS => self.status().await,
            CMD_DISCONNECT => {
                info!("Disconnect requested over IPC");
                self.cancel.cancel();
                IpcResponse::ok()
            }
            other => IpcResponse::failure(format!("unknown command: {}", other)),
        }
    }
}

/// Connection daemon
pub struct Daemon {
    profile: ServerProfile,
    tunnel: Arc<dyn Tunnel>,
    network: NetworkConfigurator,
    store: StateStore,
    ipc_endpoint: Option<IpcEndpoint>,
    ipc: Option<IpcServer>,
    handle_signals: bool,
    phase: watch::Sender<DaemonPhase>,
}

impl Daemon {
    /// Create a daemon around an unconnected tunnel
    pub fn new(
        profile: ServerProfile,
        tunnel: Arc<dyn Tunnel>,
        network: NetworkConfigurator,
        store: StateStore,
    ) -> Self {
        let (phase, _) = watch::channel(DaemonPhase::Idle);
        Self {
            profile,
            tunnel,
            network,
            store,
            ipc_endpoint: None,
            ipc: None,
            handle_signals: true,
            phase,
        }
    }

    /// Serve the control channel on `endpoint` while connected
    pub fn with_ipc(mut self, endpoint: IpcEndpoint) -> Self {
        self.ipc_endpoint = Some(endpoint);
        self
    }

    /// Do not listen for SIGINT/SIGTERM; only cancellation ends the wait
    pub fn without_signals(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Watch phase transitions
    pub fn subscribe(&self) -> watch::Receiver<DaemonPhase> {
        self.phase.subscribe()
    }

    /// Current phase
    pub fn phase(&self) -> DaemonPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: DaemonPhase) {
        debug!("Daemon phase: {:?}", phase);
        self.phase.send_replace(phase);
    }

    /// Connect, configure, serve until told to stop, then tear down.
    ///
    /// Returns an error only when the connection could not be established.
    /// Teardown problems are logged.
    pub async fn run(&mut self, parent: CancellationToken) -> Result<(), DaemonError> {
        if let Some(existing) = self.store.active()? {
            self.set_phase(DaemonPhase::Failed);
            return Err(DaemonError::AlreadyConnected(existing.server));
        }

        let cancel = parent.child_token();
        let _signals = self.handle_signals.then(|| listen_for_shutdown(cancel.clone()));

        info!("Connecting to {} ({})", self.profile.name, self.profile.endpoint);
        self.set_phase(DaemonPhase::Connecting);
        if let Err(e) = self.tunnel.connect(cancel.clone()).await {
            error!("Tunnel connect failed: {}", e);
            self.set_phase(DaemonPhase::Failed);
            return Err(e.into());
        }

        self.set_phase(DaemonPhase::Configuring);
        let status = self.tunnel.status().await;
        let interface = status
            .interface_name
            .clone()
            .unwrap_or_else(|| DEFAULT_INTERFACE.to_string());

        if let Err(e) = self.configure_network(&interface).await {
            error!("Network configuration failed: {}", e);
            self.teardown().await;
            self.set_phase(DaemonPhase::Failed);
            return Err(e);
        }

        let state = ConnectionState {
            server: self.profile.name.clone(),
            connected_at: status.connected_at.unwrap_or_else(Utc::now),
            interface_name: interface.clone(),
            tunnel_ip: self.profile.address.clone(),
            endpoint: self.profile.endpoint.clone(),
            pid: std::process::id(),
            tx_bytes: 0,
            rx_bytes: 0,
            protocol: self.tunnel.protocol(),
        };

        if let Err(e) = self.store.save(&state) {
            warn!("Failed to save connection state: {}", e);
        }
        self.start_ipc(cancel.clone()).await;

        info!("Connected to {} on {}", self.profile.name, interface);
        self.set_phase(DaemonPhase::Connected);

        cancel.cancelled().await;

        self.set_phase(DaemonPhase::Disconnecting);
        info!(
            "Disconnecting from {} ({})",
            self.profile.name,
            self.tunnel.status().await.format()
        );
        if let Some(e) = self.teardown().await {
            warn!("Teardown finished with errors, last: {}", e);
        }
        self.set_phase(DaemonPhase::Terminated);
        info!("Disconnected");
        Ok(())
    }

    /// Address, routes, then best-effort DNS. OpenVPN does its own.
    async fn configure_network(&mut self, interface: &str) -> Result<(), DaemonError> {
        if self.profile.protocol == Protocol::OpenVpn {
            debug!("Skipping network configuration for OpenVPN");
            return Ok(());
        }

        self.network.assign_address(interface, &self.profile.address).await?;
        self.network
            .add_vpn_routes(interface, self.profile.endpoint_host(), self.profile.needs_ipv6())
            .await?;

        if let Err(e) = self.network.set_dns(interface, &self.profile.dns).await {
            warn!("Failed to set DNS, continuing without it: {}", e);
        }
        Ok(())
    }

    async fn start_ipc(&mut self, cancel: CancellationToken) {
        let Some(endpoint) = self.ipc_endpoint.clone() else {
            return;
        };

        let shared = Arc::new(DaemonShared {
            tunnel: Arc::clone(&self.tunnel),
            store: self.store.clone(),
            cancel,
        });

        match IpcServer::start(endpoint, shared).await {
            Ok(server) => self.ipc = Some(server),
            Err(e) => warn!("Control channel unavailable: {}", e),
        }
    }

    /// Run every teardown step; returns the last failure
    async fn teardown(&mut self) -> Option<DaemonError> {
        let mut last = None;
        for step in TEARDOWN_ORDER {
            if let Err(e) = self.teardown_step(step).await {
                warn!("Teardown step {:?} failed: {}", step, e);
                last = Some(e);
            }
        }
        last
    }

    async fn teardown_step(&mut self, step: TeardownStep) -> Result<(), DaemonError> {
        match step {
            TeardownStep::CloseIpc => {
                if let Some(mut server) = self.ipc.take() {
                    server.close().await;
                }
            }
            TeardownStep::RemoveRoutes => self.network.remove_vpn_routes().await?,
            TeardownStep::RestoreDns => self.network.restore_dns().await?,
            TeardownStep::DisconnectTunnel => self.tunnel.disconnect().await?,
            TeardownStep::ClearState => self.store.clear()?,
        }
        Ok(())
    }
}

/// Cancel `cancel` on SIGINT/SIGTERM until the returned guard is dropped
fn listen_for_shutdown(cancel: CancellationToken) -> DropGuard {
    let stop = CancellationToken::new();
    let guard = stop.clone().drop_guard();
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = cancel.cancelled() => debug!("Cancellation received"),
            signal = shutdown_signal() => {
                info!("Received {}", signal);
                cancel.cancel();
            }
        }
    });
    guard
}

/// Resolves on SIGINT or (unix) SIGTERM with the signal's name
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl-C"
    }
}
