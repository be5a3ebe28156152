//! Settings
//!
//! Process-wide settings. Resolution order:
//!
//! 1. built-in defaults
//! 2. `settings.toml` in the config directory, if present
//! 3. environment: `FOS_VPN_LOG`, `FOS_VPN_STATE_DIR`, `FOS_VPN_RUNTIME_DIR`

use crate::ipc::{self, IpcEndpoint};
use crate::openvpn::{OpenVpnOptions, DEFAULT_CONNECT_TIMEOUT};
use crate::state::StateStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name under the user's config directory
pub const APP_DIR: &str = "fos-vpn";

/// Settings file name inside [`config_dir`]
pub const SETTINGS_FILE: &str = "settings.toml";

pub const ENV_LOG: &str = "FOS_VPN_LOG";
pub const ENV_STATE_DIR: &str = "FOS_VPN_STATE_DIR";
pub const ENV_RUNTIME_DIR: &str = "FOS_VPN_RUNTIME_DIR";

/// Settings errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// User-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `tracing` filter directive, e.g. `info` or `fos_vpn=debug`
    pub log_level: String,
    /// Where `connection.json` lives
    pub state_dir: PathBuf,
    /// Where the control socket or token file lives
    pub runtime_dir: PathBuf,
    /// Name of the WireGuard interface
    pub interface_name: String,
    pub mtu: u16,
    pub openvpn_binary: Option<PathBuf>,
    pub wireguard_engine: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// Loopback control port where unix sockets are unavailable
    pub ipc_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            state_dir: config_dir().join("state"),
            runtime_dir: runtime_dir(),
            interface_name: "fosvpn0".to_string(),
            mtu: 1420,
            openvpn_binary: None,
            wireguard_engine: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            ipc_port: ipc::DEFAULT_PORT,
        }
    }
}

impl Settings {
    /// Load from the standard location and the process environment
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(&config_dir().join(SETTINGS_FILE), |key| std::env::var(key).ok())
    }

    /// Load from `path` (missing is fine) with overrides from `env`
    pub fn load_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        if let Some(level) = env(ENV_LOG).filter(|v| !v.is_empty()) {
            settings.log_level = level;
        }
        if let Some(dir) = env(ENV_STATE_DIR).filter(|v| !v.is_empty()) {
            settings.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env(ENV_RUNTIME_DIR).filter(|v| !v.is_empty()) {
            settings.runtime_dir = PathBuf::from(dir);
        }

        Ok(settings)
    }

    /// Connection state store
    pub fn state_store(&self) -> StateStore {
        StateStore::new(&self.state_dir)
    }

    /// Control channel endpoint for this platform
    pub fn ipc_endpoint(&self) -> IpcEndpoint {
        IpcEndpoint::for_platform(&self.runtime_dir, self.ipc_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// OpenVPN backend options; temp files and the log go to the runtime dir
    pub fn openvpn_options(&self) -> OpenVpnOptions {
        OpenVpnOptions {
            binary: self.openvpn_binary.clone(),
            work_dir: self.runtime_dir.clone(),
            log_path: self.runtime_dir.join("openvpn.log"),
            connect_timeout: self.connect_timeout(),
        }
    }
}

/// `<config>/fos-vpn`
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

/// `$XDG_RUNTIME_DIR`, else a per-user directory under the temp dir
pub fn runtime_dir() -> PathBuf {
    if let Some(dir) = dirs::runtime_dir() {
        return dir;
    }

    #[cfg(unix)]
    {
        // SAFETY: geteuid cannot fail and has no preconditions.
        let uid = unsafe { libc::geteuid() };
        std::env::temp_dir().join(format!("{}-{}", APP_DIR, uid))
    }
    #[cfg(not(unix))]
    {
        std::env::temp_dir().join(APP_DIR)
    }
}
