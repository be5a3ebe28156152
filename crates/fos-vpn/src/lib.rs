//! fOS VPN - Connection Orchestration
//!
//! Establishes, supervises and tears down a single WireGuard or OpenVPN
//! tunnel, configures the host network around it, and exposes status to a
//! separate front-end process over a local control channel.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                                                        │
//! │                         Daemon                         │
//! │                                                        │
//! │  ┌────────────┐  ┌─────────────────────┐  ┌─────────┐  │
//! │  │ dyn Tunnel │  │ NetworkConfigurator │  │  State  │  │
//! │  │ WireGuard  │  │ address/routes/DNS  │  │  Store  │  │
//! │  │ OpenVPN    │  │    (fos-network)    │  └────▲────┘  │
//! │  └─────┬──────┘  └─────────────────────┘       │       │
//! │        │               ┌───────────┐           │       │
//! │        │               │ IpcServer │───────────┘       │
//! │        │               └─────▲─────┘                   │
//! └────────│─────────────────────│─────────────────────────┘
//!          ▼                     │ status / disconnect
//!   engine / openvpn       front-end process
//! ```
//!
//! # Features
//!
//! - **Uniform tunnel contract**: connect / disconnect / status / is_active
//! - **Split-default routing** with strict reverse-order teardown
//! - **Self-healing state**: records of dead daemons are discarded on read
//! - **Local control channel**: unix socket, or token-guarded loopback

pub mod daemon;
pub mod ipc;
pub mod keys;
pub mod logging;
pub mod openvpn;
pub mod profile;
pub mod settings;
pub mod state;
pub mod tunnel;
pub mod wireguard;

pub use daemon::{Daemon, DaemonError, DaemonPhase, TeardownStep, TEARDOWN_ORDER};
pub use ipc::{send_request, IpcEndpoint, IpcError, IpcRequest, IpcResponse, IpcServer};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use openvpn::{OpenVpnError, OpenVpnOptions, OpenVpnTunnel};
pub use profile::{Protocol, ProfileError, ServerProfile};
pub use settings::{Settings, SettingsError};
pub use state::{ConnectionState, StateError, StateStore};
pub use tunnel::{Tunnel, TunnelError, TunnelStatus};
pub use wireguard::{ExternalEngine, WireGuardError, WireGuardTunnel};
