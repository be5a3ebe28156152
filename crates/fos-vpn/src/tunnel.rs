//! Tunnel Contract
//!
//! The protocol-agnostic interface every backend implements. The daemon
//! only ever talks to a `dyn Tunnel`.
//!
//! # Lifecycle
//!
//! ```text
//! connect(token) ──▶ ready interface ──▶ status()* ──▶ disconnect()
//!       │
//!       └── error: nothing left behind (device, subprocess, temp files)
//! ```

use crate::openvpn::OpenVpnError;
use crate::profile::Protocol;
use crate::wireguard::WireGuardError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Tunnel errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    WireGuard(#[from] WireGuardError),

    #[error(transparent)]
    OpenVpn(#[from] OpenVpnError),

    #[error("connect cancelled")]
    Cancelled,

    #[error("tunnel already connected")]
    AlreadyConnected,
}

/// Point-in-time view of a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStatus {
    pub connected: bool,
    pub protocol: Protocol,
    pub server_name: String,
    pub endpoint: String,
    pub tunnel_ip: String,
    pub connected_at: Option<DateTime<Utc>>,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    /// WireGuard only
    pub last_handshake: Option<DateTime<Utc>>,
    pub interface_name: Option<String>,
    /// Why the counters could not be read; `None` when they are live
    pub stats_error: Option<String>,
}

impl TunnelStatus {
    /// Snapshot for a tunnel that is not up
    pub fn disconnected(protocol: Protocol, server_name: &str, endpoint: &str, tunnel_ip: &str) -> Self {
        Self {
            connected: false,
            protocol,
            server_name: server_name.to_string(),
            endpoint: endpoint.to_string(),
            tunnel_ip: tunnel_ip.to_string(),
            connected_at: None,
            tx_bytes: 0,
            rx_bytes: 0,
            last_handshake: None,
            interface_name: None,
            stats_error: None,
        }
    }

    /// Connected and the counters were actually read
    pub fn has_counters(&self) -> bool {
        self.connected && self.stats_error.is_none()
    }

    /// Format counters as human-readable string
    pub fn format(&self) -> String {
        if let Some(e) = &self.stats_error {
            return format!("counters unavailable: {}", e);
        }
        format!(
            "TX: {:.2}MB, RX: {:.2}MB",
            self.tx_bytes as f64 / (1024.0 * 1024.0),
            self.rx_bytes as f64 / (1024.0 * 1024.0),
        )
    }
}

/// A VPN tunnel backend
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Protocol implemented by this backend
    fn protocol(&self) -> Protocol;

    /// Bring the tunnel up.
    ///
    /// Returns once the interface is ready, the attempt failed, or
    /// `cancel` fired. A failed attempt releases everything it created.
    async fn connect(&self, cancel: CancellationToken) -> Result<(), TunnelError>;

    /// Shut the tunnel down, gracefully if possible.
    ///
    /// Errors are informational only; callers keep tearing down.
    async fn disconnect(&self) -> Result<(), TunnelError>;

    /// Current status, with live counters when connected.
    ///
    /// Never fails: a connected tunnel whose counters cannot be read
    /// reports zero traffic and sets [`TunnelStatus::stats_error`].
    async fn status(&self) -> TunnelStatus;

    /// Cheap liveness check
    fn is_active(&self) -> bool;
}
