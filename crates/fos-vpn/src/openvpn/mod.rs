//! OpenVPN Backend
//!
//! Wraps the external `openvpn` executable. OpenVPN configures the tunnel
//! address, routes and DNS itself, so the daemon skips its own network
//! configuration for this protocol.
//!
//! # Connect
//!
//! ```text
//! write temp config ─▶ spawn openvpn ─▶ scan merged output
//!                                         │
//!        ┌────────────────────────────────┼──────────────────┐
//!        ▼                                ▼                  ▼
//!   completion marker               failure / EOF     timeout / cancel
//!     connected               kill + wait + remove temp files
//! ```

pub mod config;
pub mod management;
pub mod output;

pub use config::{build_config, detect_openvpn};
pub use management::{ManagementClient, TrafficStats};

use crate::profile::{Protocol, ServerProfile};
use crate::tunnel::{Tunnel, TunnelError, TunnelStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use output::Outcome;
use std::io::Write as _;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default time allowed for the completion marker to appear
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period after the management `SIGTERM`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Interface reported when the subprocess did not name one
const FALLBACK_INTERFACE: &str = "tun0";

/// OpenVPN backend errors
#[derive(Debug, thiserror::Error)]
pub enum OpenVpnError {
    #[error("openvpn binary not found. Install OpenVPN and ensure it is in your PATH")]
    BinaryNotFound,

    #[error("failed to write temp config: {0}")]
    TempConfig(#[source] std::io::Error),

    #[error("failed to start openvpn: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("openvpn error: {0}")]
    Failed(String),

    #[error("openvpn exited unexpectedly. Last output:\n  {detail}\nFull log: {log}")]
    Exited { detail: String, log: String },

    #[error("openvpn connection timed out after {secs}s (check {log})")]
    Timeout { secs: u64, log: String },

    #[error("management interface: {0}")]
    Management(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Backend options
#[derive(Debug, Clone)]
pub struct OpenVpnOptions {
    /// Executable; detected when `None`
    pub binary: Option<PathBuf>,
    /// Directory for the generated config and credentials files
    pub work_dir: PathBuf,
    /// Mirror of all subprocess output
    pub log_path: PathBuf,
    pub connect_timeout: Duration,
}

impl Default for OpenVpnOptions {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        Self {
            binary: None,
            log_path: tmp.join("fos-vpn-openvpn.log"),
            work_dir: tmp,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Pick a free local port for the management interface
fn pick_management_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or_else(|_| rand::random::<u16>() % 50000 + 10000)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running subprocess and the files it reads
struct Process {
    child: Child,
    files: Vec<NamedTempFile>,
    connected_at: DateTime<Utc>,
}

impl Process {
    async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("openvpn already exited: {}", e);
        }
        if let Err(e) = self.child.wait().await {
            warn!("Failed to reap openvpn: {}", e);
        }
    }

    fn remove_files(&mut self) {
        for file in self.files.drain(..) {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

/// OpenVPN tunnel driven through the external executable
pub struct OpenVpnTunnel {
    profile: ServerProfile,
    options: OpenVpnOptions,
    management: ManagementClient,
    process: Mutex<Option<Process>>,
    interface: Mutex<Option<Arc<Mutex<Option<String>>>>>,
}

impl OpenVpnTunnel {
    /// Create a tunnel; the management port is chosen now
    pub fn new(profile: ServerProfile, options: OpenVpnOptions) -> Self {
        let management = ManagementClient::new(pick_management_port());
        Self {
            profile,
            options,
            management,
            process: Mutex::new(None),
            interface: Mutex::new(None),
        }
    }

    /// Management port written into the config
    pub fn management_port(&self) -> u16 {
        self.management.port()
    }

    fn write_temp(&self, suffix: &str, contents: &str) -> Result<NamedTempFile, OpenVpnError> {
        let mut file = tempfile::Builder::new()
            .prefix("fos-vpn-ovpn-")
            .suffix(suffix)
            .tempfile_in(&self.options.work_dir)
            .map_err(OpenVpnError::TempConfig)?;
        file.write_all(contents.as_bytes())
            .and_then(|_| file.flush())
            .map_err(OpenVpnError::TempConfig)?;
        Ok(file)
    }

    /// Spawn the subprocess and wait for the scanner's verdict
    async fn start(&self, cancel: &CancellationToken) -> Result<Process, TunnelError> {
        let binary = match &self.options.binary {
            Some(path) => path.clone(),
            None => detect_openvpn()?,
        };

        std::fs::create_dir_all(&self.options.work_dir).map_err(OpenVpnError::TempConfig)?;
        let mut files = Vec::new();
        let auth_file = match config::credentials(&self.profile) {
            Some(creds) => {
                let file = self.write_temp(".auth", &creds)?;
                let path = file.path().to_path_buf();
                files.push(file);
                Some(path)
            }
            None => None,
        };
        let contents = build_config(&self.profile, self.management.port(), auth_file.as_deref());
        let config_file = self.write_temp(".conf", &contents)?;
        let config_path = config_file.path().to_path_buf();
        files.push(config_file);

        debug!("Starting {} --config {}", binary.display(), config_path.display());
        let mut child = Command::new(&binary)
            .arg("--config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(OpenVpnError::Spawn)?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            output::forward(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            output::forward(stderr, tx);
        }
        let scanner = output::spawn_scanner(rx, &self.options.log_path);
        *lock(&self.interface) = Some(scanner.interface.clone());

        let mut process = Process {
            child,
            files,
            connected_at: Utc::now(),
        };

        let log = self.options.log_path.display().to_string();
        let result = tokio::select! {
            outcome = scanner.outcome => match outcome.unwrap_or(Outcome::Exited(Vec::new())) {
                Outcome::Connected => Ok(()),
                Outcome::Failed(line) => Err(OpenVpnError::Failed(line).into()),
                Outcome::Exited(lines) => {
                    let detail = if lines.is_empty() {
                        "no output captured".to_string()
                    } else {
                        lines.join("\n  ")
                    };
                    Err(OpenVpnError::Exited { detail, log }.into())
                }
            },
            _ = tokio::time::sleep(self.options.connect_timeout) => Err(OpenVpnError::Timeout {
                secs: self.options.connect_timeout.as_secs(),
                log,
            }
            .into()),
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        };

        match result {
            Ok(()) => {
                process.connected_at = Utc::now();
                Ok(process)
            }
            Err(e) => {
                process.kill().await;
                process.remove_files();
                *lock(&self.interface) = None;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Tunnel for OpenVpnTunnel {
    fn protocol(&self) -> Protocol {
        Protocol::OpenVpn
    }

    async fn connect(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        if lock(&self.process).is_some() {
            return Err(TunnelError::AlreadyConnected);
        }

        match self.start(&cancel).await {
            Ok(process) => {
                *lock(&self.process) = Some(process);
                info!("OpenVPN connected to {} ({})", self.profile.name, self.profile.endpoint);
                Ok(())
            }
            Err(e) => {
                error!("OpenVPN connect failed: {}", e);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), TunnelError> {
        let Some(mut process) = lock(&self.process).take() else {
            return Ok(());
        };

        match self.management.signal("SIGTERM").await {
            Ok(reply) => debug!("Management replied: {}", reply),
            Err(e) => debug!("Graceful shutdown unavailable: {}", e),
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, process.child.wait()).await {
            Ok(_) => debug!("openvpn exited"),
            Err(_) => {
                warn!("openvpn did not exit after SIGTERM, killing");
                process.kill().await;
            }
        }

        process.remove_files();
        *lock(&self.interface) = None;
        info!("OpenVPN disconnected from {}", self.profile.name);
        Ok(())
    }

    async fn status(&self) -> TunnelStatus {
        let mut status = TunnelStatus::disconnected(
            Protocol::OpenVpn,
            &self.profile.name,
            &self.profile.endpoint,
            &self.profile.address,
        );

        let connected_at = {
            let mut process = lock(&self.process);
            match process.as_mut() {
                Some(p) => matches!(p.child.try_wait(), Ok(None)).then_some(p.connected_at),
                None => None,
            }
        };
        let Some(connected_at) = connected_at else {
            return status;
        };

        status.connected = true;
        status.connected_at = Some(connected_at);
        status.interface_name = Some(
            lock(&self.interface)
                .as_ref()
                .and_then(|slot| lock(slot).clone())
                .unwrap_or_else(|| FALLBACK_INTERFACE.to_string()),
        );

        match self.management.stats().await {
            Ok(stats) => {
                status.tx_bytes = stats.tx_bytes;
                status.rx_bytes = stats.rx_bytes;
            }
            Err(e) => {
                debug!("OpenVPN stats unavailable: {}", e);
                status.stats_error = Some(e.to_string());
            }
        }

        status
    }

    fn is_active(&self) -> bool {
        lock(&self.process)
            .as_mut()
            .is_some_and(|p| matches!(p.child.try_wait(), Ok(None)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Write an executable shell script standing in for openvpn
    fn fake_openvpn(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("openvpn");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct Fixture {
        _bin: tempfile::TempDir,
        work: tempfile::TempDir,
        logs: tempfile::TempDir,
        pidfile: PathBuf,
        tunnel: OpenVpnTunnel,
    }

    fn fixture(body: &str, connect_timeout: Duration) -> Fixture {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let pidfile = logs.path().join("openvpn.pid");
        let script = body.replace("$PIDFILE", &pidfile.display().to_string());

        let options = OpenVpnOptions {
            binary: Some(fake_openvpn(bin.path(), &script)),
            work_dir: work.path().to_path_buf(),
            log_path: logs.path().join("openvpn.log"),
            connect_timeout,
        };
        let tunnel = OpenVpnTunnel::new(ServerProfile::openvpn("office", "vpn.example.com:443"), options);

        Fixture {
            _bin: bin,
            work,
            logs,
            pidfile,
            tunnel,
        }
    }

    fn is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    fn pid_alive(pidfile: &Path) -> bool {
        let pid: i32 = std::fs::read_to_string(pidfile).unwrap().trim().parse().unwrap();
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[tokio::test]
    async fn test_auth_failed_cleans_up() {
        let f = fixture(
            "echo $$ > $PIDFILE\necho 'AUTH: Received control message: AUTH_FAILED'\nexec sleep 30",
            Duration::from_secs(10),
        );

        let err = f.tunnel.connect(CancellationToken::new()).await.unwrap_err();

        assert!(err.to_string().contains("AUTH_FAILED"));
        assert!(!f.tunnel.is_active());
        assert!(is_empty(f.work.path()));
        assert!(!pid_alive(&f.pidfile));
    }

    #[tokio::test]
    async fn test_early_exit_reports_trailing_output() {
        let f = fixture("echo 'Options error: bad config' >&2\nexit 1", Duration::from_secs(10));

        let err = f.tunnel.connect(CancellationToken::new()).await.unwrap_err();
        let message = err.to_string();

        assert!(message.contains("exited unexpectedly"));
        assert!(message.contains("Options error: bad config"));
        assert!(message.contains(&f.logs.path().join("openvpn.log").display().to_string()));
        assert!(is_empty(f.work.path()));
    }

    #[tokio::test]
    async fn test_timeout_kills_subprocess() {
        let f = fixture("echo $$ > $PIDFILE\nexec sleep 30", Duration::from_millis(500));

        let err = f.tunnel.connect(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, TunnelError::OpenVpn(OpenVpnError::Timeout { .. })));
        assert!(is_empty(f.work.path()));
        assert!(!pid_alive(&f.pidfile));
    }

    #[tokio::test]
    async fn test_cancel_kills_subprocess() {
        let f = fixture("echo $$ > $PIDFILE\nexec sleep 30", Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let err = f.tunnel.connect(cancel).await.unwrap_err();

        assert!(matches!(err, TunnelError::Cancelled));
        assert!(is_empty(f.work.path()));
        assert!(!pid_alive(&f.pidfile));
    }

    #[tokio::test]
    async fn test_connected_then_disconnect() {
        let f = fixture(
            "echo 'TUN/TAP device tun5 opened'\necho 'Initialization Sequence Completed'\nexec sleep 30",
            Duration::from_secs(10),
        );

        f.tunnel.connect(CancellationToken::new()).await.unwrap();
        assert!(f.tunnel.is_active());
        assert!(!is_empty(f.work.path()));

        let status = f.tunnel.status().await;
        assert!(status.connected);
        assert_eq!(status.interface_name.as_deref(), Some("tun5"));
        // Nothing listens on the management port
        assert!(!status.has_counters());

        f.tunnel.disconnect().await.unwrap();
        assert!(!f.tunnel.is_active());
        assert!(is_empty(f.work.path()));
        assert!(!f.tunnel.status().await.connected);
    }

    #[test]
    fn test_management_port_is_local_and_nonzero() {
        let tunnel = OpenVpnTunnel::new(
            ServerProfile::openvpn("office", "vpn.example.com"),
            OpenVpnOptions::default(),
        );
        assert_ne!(tunnel.management_port(), 0);
    }
}
