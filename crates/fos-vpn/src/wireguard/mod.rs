//! WireGuard Backend
//!
//! Cryptography and packet processing live in an external userspace
//! engine. This backend only:
//!
//! 1. Builds the engine configuration block (keys hex-encoded)
//! 2. Creates the virtual interface through an [`EngineLauncher`]
//! 3. Hands it the block and brings it up
//! 4. Reads counters back from the engine report
//!
//! `connect` is synchronous with respect to the engine: the handshake
//! itself is only observable through later status queries.

mod engine;
pub mod uapi;

pub use engine::ExternalEngine;

use crate::keys::KeyError;
use crate::profile::{Protocol, ServerProfile};
use crate::tunnel::{Tunnel, TunnelError, TunnelStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum interface name length accepted by the kernel
pub const MAX_INTERFACE_NAME: usize = 15;

/// WireGuard backend errors
#[derive(Debug, thiserror::Error)]
pub enum WireGuardError {
    #[error("invalid {field}: {source}")]
    InvalidKey {
        field: &'static str,
        #[source]
        source: KeyError,
    },

    #[error("peer endpoint is required")]
    MissingEndpoint,

    #[error("invalid peer endpoint: contains newline characters")]
    EndpointNewline,

    #[error("peer AllowedIPs is required (at least one entry needed)")]
    NoAllowedIps,

    #[error("invalid allowed IP: contains newline characters")]
    AllowedIpNewline,

    #[error("invalid interface name {0:?}")]
    InvalidInterface(String),

    #[error("wireguard engine not found (tried {0})")]
    EngineNotFound(String),

    #[error("failed to create WireGuard device: {0}")]
    CreateDevice(String),

    #[error("failed to configure device: engine returned errno {0}")]
    Configure(i64),

    #[error("failed to bring device up: {0}")]
    Up(String),

    #[error("engine protocol error: {0}")]
    Protocol(String),

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Materialized backend configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireGuardConfig {
    /// Base64 private key
    pub private_key: String,
    /// Base64 peer public key
    pub peer_public_key: String,
    pub preshared_key: Option<String>,
    pub endpoint: String,
    pub allowed_ips: Vec<String>,
    pub persistent_keepalive: u16,
    pub mtu: u16,
}

impl WireGuardConfig {
    /// Combine a profile with the user's private key
    pub fn from_profile(profile: &ServerProfile, private_key: &str) -> Self {
        Self {
            private_key: private_key.to_string(),
            peer_public_key: profile.public_key.clone(),
            preshared_key: profile.preshared_key.clone(),
            endpoint: profile.endpoint.clone(),
            allowed_ips: profile.allowed_ips.clone(),
            persistent_keepalive: profile.persistent_keepalive,
            mtu: profile.mtu,
        }
    }
}

/// Creates engine-backed virtual interfaces
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Create the interface `name` with the given MTU
    async fn create(&self, name: &str, mtu: u16) -> Result<Box<dyn EngineDevice>, WireGuardError>;
}

/// A live engine interface
#[async_trait]
pub trait EngineDevice: Send + Sync {
    /// Interface name as reported by the engine
    fn name(&self) -> &str;

    /// Apply a configuration block
    async fn configure(&mut self, block: &str) -> Result<(), WireGuardError>;

    /// Bring the interface up
    async fn up(&mut self) -> Result<(), WireGuardError>;

    /// Raw `key=value` report
    async fn report(&mut self) -> Result<String, WireGuardError>;

    /// Tear the interface down. Never fails.
    async fn close(&mut self);
}

struct ActiveDevice {
    device: Box<dyn EngineDevice>,
    connected_at: DateTime<Utc>,
}

/// WireGuard tunnel driven through an external engine
pub struct WireGuardTunnel {
    profile: ServerProfile,
    config: WireGuardConfig,
    interface: String,
    launcher: Box<dyn EngineLauncher>,
    active: Mutex<Option<ActiveDevice>>,
    running: AtomicBool,
}

impl WireGuardTunnel {
    /// Create a tunnel for `profile` with the user's base64 private key
    pub fn new(
        profile: ServerProfile,
        private_key: &str,
        interface: &str,
        launcher: Box<dyn EngineLauncher>,
    ) -> Self {
        let config = WireGuardConfig::from_profile(&profile, private_key);
        Self {
            profile,
            config,
            interface: interface.to_string(),
            launcher,
            active: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Backend configuration
    pub fn config(&self) -> &WireGuardConfig {
        &self.config
    }

    fn validate_interface(&self) -> Result<(), WireGuardError> {
        if fos_network::valid_interface_name(&self.interface)
            && self.interface.len() <= MAX_INTERFACE_NAME
        {
            Ok(())
        } else {
            Err(WireGuardError::InvalidInterface(self.interface.clone()))
        }
    }

    async fn bring_up(&self) -> Result<Box<dyn EngineDevice>, WireGuardError> {
        // Nothing is created until the block is known to be valid
        let block = uapi::build_config_block(&self.config)?;
        self.validate_interface()?;

        debug!("Creating WireGuard device {} (mtu {})", self.interface, self.config.mtu);
        let mut device = self.launcher.create(&self.interface, self.config.mtu).await?;

        debug!(
            "Configuring WireGuard device (endpoint {}, allowed ips {:?})",
            self.config.endpoint, self.config.allowed_ips
        );
        if let Err(e) = device.configure(&block).await {
            device.close().await;
            return Err(e);
        }

        if let Err(e) = device.up().await {
            device.close().await;
            return Err(e);
        }

        Ok(device)
    }
}

#[async_trait]
impl Tunnel for WireGuardTunnel {
    fn protocol(&self) -> Protocol {
        Protocol::WireGuard
    }

    async fn connect(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(TunnelError::AlreadyConnected);
        }

        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }

        // Not raced against the token: a half-built device must be closed, not dropped
        let mut device = self.bring_up().await?;
        if cancel.is_cancelled() {
            device.close().await;
            return Err(TunnelError::Cancelled);
        }

        *active = Some(ActiveDevice {
            device,
            connected_at: Utc::now(),
        });
        self.running.store(true, Ordering::SeqCst);

        info!(
            "WireGuard tunnel connected to {} ({})",
            self.profile.name, self.profile.endpoint
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TunnelError> {
        let mut active = self.active.lock().await;
        self.running.store(false, Ordering::SeqCst);

        if let Some(mut current) = active.take() {
            current.device.close().await;
            info!("WireGuard tunnel to {} disconnected", self.profile.name);
        }
        Ok(())
    }

    async fn status(&self) -> TunnelStatus {
        let mut status = TunnelStatus::disconnected(
            Protocol::WireGuard,
            &self.profile.name,
            &self.profile.endpoint,
            &self.profile.address,
        );

        let mut active = self.active.lock().await;
        let Some(current) = active.as_mut() else {
            return status;
        };

        status.connected = true;
        status.connected_at = Some(current.connected_at);
        status.interface_name = Some(current.device.name().to_string());

        match current.device.report().await {
            Ok(report) => {
                let stats = uapi::parse_stats(&report);
                status.tx_bytes = stats.tx_bytes;
                status.rx_bytes = stats.rx_bytes;
                status.last_handshake = stats.last_handshake();
            }
            Err(e) => {
                warn!("Failed to read WireGuard stats: {}", e);
                status.stats_error = Some(e.to_string());
            }
        }

        status
    }

    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory engine

    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    /// Observable engine state shared with the test
    #[derive(Debug, Default)]
    pub struct EngineLog {
        pub created: Vec<String>,
        pub blocks: Vec<String>,
        pub up: bool,
        pub closed: bool,
    }

    #[derive(Clone, Default)]
    pub struct MemoryEngine {
        pub log: Arc<StdMutex<EngineLog>>,
        pub reject_config: bool,
        pub fail_report: bool,
        pub report: String,
    }

    struct MemoryDevice {
        name: String,
        engine: MemoryEngine,
    }

    #[async_trait]
    impl EngineLauncher for MemoryEngine {
        async fn create(&self, name: &str, _mtu: u16) -> Result<Box<dyn EngineDevice>, WireGuardError> {
            self.log.lock().unwrap().created.push(name.to_string());
            Ok(Box::new(MemoryDevice {
                name: name.to_string(),
                engine: self.clone(),
            }))
        }
    }

    #[async_trait]
    impl EngineDevice for MemoryDevice {
        fn name(&self) -> &str {
            &self.name
        }

        async fn configure(&mut self, block: &str) -> Result<(), WireGuardError> {
            if self.engine.reject_config {
                return Err(WireGuardError::Configure(-22));
            }
            self.engine.log.lock().unwrap().blocks.push(block.to_string());
            Ok(())
        }

        async fn up(&mut self) -> Result<(), WireGuardError> {
            self.engine.log.lock().unwrap().up = true;
            Ok(())
        }

        async fn report(&mut self) -> Result<String, WireGuardError> {
            if self.engine.fail_report {
                return Err(WireGuardError::Protocol("engine went away".to_string()));
            }
            Ok(self.engine.report.clone())
        }

        async fn close(&mut self) {
            let mut log = self.engine.log.lock().unwrap();
            log.up = false;
            log.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryEngine;
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

    fn profile() -> ServerProfile {
        ServerProfile::wireguard(
            "home",
            "1.2.3.4:51820",
            &BASE64.encode([2u8; 32]),
            "10.0.0.2/32",
        )
    }

    fn tunnel(engine: &MemoryEngine) -> WireGuardTunnel {
        WireGuardTunnel::new(
            profile(),
            &BASE64.encode([1u8; 32]),
            "fosvpn0",
            Box::new(engine.clone()),
        )
    }

    #[tokio::test]
    async fn test_connect_status_disconnect() {
        let engine = MemoryEngine {
            report: "tx_bytes=100\nrx_bytes=200\nlast_handshake_time_sec=1700000000\nerrno=0\n"
                .to_string(),
            ..Default::default()
        };
        let tunnel = tunnel(&engine);

        tunnel.connect(CancellationToken::new()).await.unwrap();
        assert!(tunnel.is_active());

        let status = tunnel.status().await;
        assert!(status.connected);
        assert_eq!(status.interface_name.as_deref(), Some("fosvpn0"));
        assert_eq!(status.tx_bytes, 100);
        assert_eq!(status.rx_bytes, 200);
        assert!(status.last_handshake.is_some());
        assert!(engine.log.lock().unwrap().blocks[0].contains("endpoint=1.2.3.4:51820\n"));

        tunnel.disconnect().await.unwrap();
        assert!(!tunnel.is_active());
        assert!(!tunnel.status().await.connected);
        assert!(engine.log.lock().unwrap().closed);
    }

    #[tokio::test]
    async fn test_status_reports_unreadable_counters() {
        let engine = MemoryEngine {
            fail_report: true,
            ..Default::default()
        };
        let tunnel = tunnel(&engine);
        tunnel.connect(CancellationToken::new()).await.unwrap();

        let status = tunnel.status().await;
        assert!(status.connected);
        assert!(!status.has_counters());
        assert!(status.stats_error.unwrap().contains("engine went away"));
    }

    #[tokio::test]
    async fn test_invalid_key_creates_nothing() {
        let engine = MemoryEngine::default();
        let tunnel = WireGuardTunnel::new(
            profile(),
            &BASE64.encode([1u8; 16]),
            "fosvpn0",
            Box::new(engine.clone()),
        );

        let err = tunnel.connect(CancellationToken::new()).await.unwrap_err();

        assert!(err.to_string().contains("expected 32 bytes, got 16"));
        assert!(engine.log.lock().unwrap().created.is_empty());
        assert!(!tunnel.is_active());
    }

    #[tokio::test]
    async fn test_rejected_config_closes_device() {
        let engine = MemoryEngine {
            reject_config: true,
            ..Default::default()
        };
        let tunnel = tunnel(&engine);

        assert!(tunnel.connect(CancellationToken::new()).await.is_err());

        let log = engine.log.lock().unwrap();
        assert_eq!(log.created, vec!["fosvpn0"]);
        assert!(log.closed);
        assert!(!tunnel.is_active());
    }

    #[tokio::test]
    async fn test_cancelled_before_connect() {
        let engine = MemoryEngine::default();
        let tunnel = tunnel(&engine);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            tunnel.connect(cancel).await,
            Err(TunnelError::Cancelled)
        ));
        assert!(!tunnel.is_active());
    }

    #[tokio::test]
    async fn test_interface_name_validated() {
        let engine = MemoryEngine::default();
        let tunnel = WireGuardTunnel::new(
            profile(),
            &BASE64.encode([1u8; 32]),
            "this-name-is-too-long",
            Box::new(engine.clone()),
        );

        assert!(tunnel.connect(CancellationToken::new()).await.is_err());
        assert!(engine.log.lock().unwrap().created.is_empty());
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let engine = MemoryEngine::default();
        let tunnel = tunnel(&engine);

        tunnel.connect(CancellationToken::new()).await.unwrap();
        assert!(matches!(
            tunnel.connect(CancellationToken::new()).await,
            Err(TunnelError::AlreadyConnected)
        ));
    }
}
