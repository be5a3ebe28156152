//! Control Channel
//!
//! Local request/response channel between the daemon and the front end.
//!
//! # Transports
//!
//! | Transport | Where | Access control |
//! |-----------|-------|----------------|
//! | Unix socket | unix | socket in a 0700 directory, created under umask 0077 |
//! | Loopback TCP | windows (any platform on request) | random token in a 0600 file, sent before the request |
//!
//! Both carry the same line protocol (see [`protocol`]).

pub mod client;
pub mod protocol;
pub mod server;

pub use client::send_request;
pub use protocol::{IpcRequest, IpcResponse, CMD_DISCONNECT, CMD_STATUS};
pub use server::{IpcHandler, IpcServer};

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Loopback port used when unix sockets are unavailable
pub const DEFAULT_PORT: u16 = 41820;

/// Base name for the socket and token files
pub const ENDPOINT_NAME: &str = "fos-vpn";

/// Server-side deadline per connection
pub const SERVER_DEADLINE: Duration = Duration::from_secs(5);

/// Client connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Client deadline for the full exchange
pub const CLIENT_DEADLINE: Duration = Duration::from_secs(5);

/// Response to a bad or missing token
pub const AUTH_FAILED: &str = "authentication failed";

/// Control channel errors
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("VPN is not running (could not connect to IPC)")]
    NotRunning,

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IPC request timed out")]
    Timeout,

    #[error("daemon closed the connection without a response")]
    Closed,

    #[error("invalid IPC message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the control channel listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcEndpoint {
    /// Path-based socket guarded by filesystem permissions
    #[cfg(unix)]
    Socket { path: PathBuf },
    /// Loopback TCP guarded by a token file
    Loopback { addr: SocketAddr, token_path: PathBuf },
}

impl IpcEndpoint {
    /// Unix socket at `<dir>/fos-vpn.sock`
    #[cfg(unix)]
    pub fn socket(dir: &Path) -> Self {
        Self::Socket {
            path: dir.join(format!("{}.sock", ENDPOINT_NAME)),
        }
    }

    /// Loopback listener on `port` with its token at `<dir>/fos-vpn.token`
    pub fn loopback(dir: &Path, port: u16) -> Self {
        Self::Loopback {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            token_path: dir.join(format!("{}.token", ENDPOINT_NAME)),
        }
    }

    /// The transport native to this platform
    pub fn for_platform(dir: &Path, port: u16) -> Self {
        #[cfg(unix)]
        {
            let _ = port;
            Self::socket(dir)
        }
        #[cfg(not(unix))]
        {
            Self::loopback(dir, port)
        }
    }

    /// Files this endpoint owns on disk
    fn artifact(&self) -> &Path {
        match self {
            #[cfg(unix)]
            Self::Socket { path } => path,
            Self::Loopback { token_path, .. } => token_path,
        }
    }
}

impl std::fmt::Display for IpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            Self::Socket { path } => write!(f, "{}", path.display()),
            Self::Loopback { addr, .. } => write!(f, "{}", addr),
        }
    }
}

/// A connected byte stream of either transport
pub(crate) trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}

/// Create `dir` (and parents) restricted to the owner
pub(crate) fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
