//! Connection State Store
//!
//! A single JSON record describing the active connection, shared between
//! the daemon (writer) and any client process (reader). The record carries
//! the daemon's PID; a record whose process is gone is stale and is removed
//! on read.

use crate::profile::Protocol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// File name inside the state directory
pub const STATE_FILE: &str = "connection.json";

/// State store errors
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt state file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Persisted record of the active connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub server: String,
    pub connected_at: DateTime<Utc>,
    pub interface_name: String,
    pub tunnel_ip: String,
    pub endpoint: String,
    pub pid: u32,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub protocol: Protocol,
}

impl ConnectionState {
    /// Human readable uptime, e.g. `1h 2m 3s`
    pub fn uptime(&self) -> String {
        let secs = (Utc::now() - self.connected_at).num_seconds().max(0);
        let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
        if h > 0 {
            format!("{}h {}m {}s", h, m, s)
        } else if m > 0 {
            format!("{}m {}s", m, s)
        } else {
            format!("{}s", s)
        }
    }
}

/// Whether a process with `pid` exists
pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::everything(),
    );
    system.process(pid).is_some()
}

/// File-backed store for [`ConnectionState`]
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store at `<dir>/connection.json`
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(STATE_FILE),
        }
    }

    /// Location of the record
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the record, readable by the owner only
    pub fn save(&self, state: &ConnectionState) -> Result<(), StateError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        write_private(&self.path, &json)?;
        debug!("Saved connection state to {}", self.path.display());
        Ok(())
    }

    /// Read the record as stored; `None` when there is none
    pub fn load(&self) -> Result<Option<ConnectionState>, StateError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the record; a missing record is fine
    pub fn clear(&self) -> Result<(), StateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the record, discarding it if its daemon no longer runs
    pub fn active(&self) -> Result<Option<ConnectionState>, StateError> {
        let Some(state) = self.load()? else {
            return Ok(None);
        };

        if process_alive(state.pid) {
            return Ok(Some(state));
        }

        warn!("Removing stale connection state (pid {} is gone)", state.pid);
        if let Err(e) = self.clear() {
            warn!("Failed to remove stale state: {}", e);
        }
        Ok(None)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pid: u32) -> ConnectionState {
        ConnectionState {
            server: "home".to_string(),
            connected_at: Utc::now(),
            interface_name: "fosvpn0".to_string(),
            tunnel_ip: "10.0.0.2/32".to_string(),
            endpoint: "1.2.3.4:51820".to_string(),
            pid,
            tx_bytes: 0,
            rx_bytes: 0,
            protocol: Protocol::WireGuard,
        }
    }

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));
        assert_eq!(store.load().unwrap(), None);

        let state = sample(std::process::id());
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
        assert!(store.active().unwrap().is_some());

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.clear().unwrap();
    }

    #[test]
    fn test_dead_pid_clears_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        let mut child = std::process::Command::new(std::env::current_exe().unwrap())
            .arg("--list")
            .stdout(std::process::Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();

        store.save(&sample(pid)).unwrap();
        assert_eq!(store.active().unwrap(), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(sample(42)).unwrap();
        for field in [
            "server",
            "connected_at",
            "interface_name",
            "tunnel_ip",
            "endpoint",
            "pid",
            "tx_bytes",
            "rx_bytes",
            "protocol",
        ] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(json["protocol"], "wireguard");
    }

    #[cfg(unix)]
    #[test]
    fn test_state_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&sample(1)).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_uptime_format() {
        let mut state = sample(1);
        state.connected_at = Utc::now() - chrono::Duration::seconds(3723);
        assert_eq!(state.uptime(), "1h 2m 3s");
    }
}
