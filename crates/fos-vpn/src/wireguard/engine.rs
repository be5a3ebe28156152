//! External Userspace Engine
//!
//! Runs `wireguard-go` or `boringtun-cli` in the foreground for one
//! interface and drives it over its UAPI control socket.

use super::uapi::parse_errno;
use super::{EngineDevice, EngineLauncher, WireGuardError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

/// Engine executables, in order of preference
pub const ENGINE_CANDIDATES: [&str; 2] = ["wireguard-go", "boringtun-cli"];

/// Default UAPI socket directory on unix
pub const UAPI_SOCKET_DIR: &str = "/var/run/wireguard";

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Launches an external engine process per interface
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    program: PathBuf,
    socket_dir: PathBuf,
}

impl ExternalEngine {
    /// Use a specific engine executable
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            socket_dir: PathBuf::from(UAPI_SOCKET_DIR),
        }
    }

    /// Find an engine: the configured path if given, else the first
    /// candidate on `PATH`
    pub fn detect(preferred: Option<&Path>) -> Result<Self, WireGuardError> {
        if let Some(path) = preferred {
            return which::which(path)
                .map(Self::new)
                .map_err(|_| WireGuardError::EngineNotFound(path.display().to_string()));
        }

        ENGINE_CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .map(Self::new)
            .ok_or_else(|| WireGuardError::EngineNotFound(ENGINE_CANDIDATES.join(", ")))
    }

    /// Override the UAPI socket directory
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// Executable in use
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn socket_path(&self, name: &str) -> PathBuf {
        if cfg!(windows) {
            PathBuf::from(format!(r"\\.\pipe\ProtectedPrefix\Administrators\WireGuard\{}", name))
        } else {
            self.socket_dir.join(format!("{}.sock", name))
        }
    }
}

#[async_trait]
impl EngineLauncher for ExternalEngine {
    async fn create(&self, name: &str, mtu: u16) -> Result<Box<dyn EngineDevice>, WireGuardError> {
        let socket = self.socket_path(name);
        info!("Starting {} for {}", self.program.display(), name);

        let child = Command::new(&self.program)
            .arg("-f")
            .arg(name)
            .env("WG_PROCESS_FOREGROUND", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WireGuardError::CreateDevice(format!("{}: {}", self.program.display(), e)))?;

        let mut device = ExternalDevice {
            name: name.to_string(),
            mtu,
            child,
            socket,
        };

        if let Err(e) = device.wait_ready().await {
            device.close().await;
            return Err(e);
        }
        Ok(Box::new(device))
    }
}

/// One running engine process
struct ExternalDevice {
    name: String,
    mtu: u16,
    child: Child,
    socket: PathBuf,
}

impl ExternalDevice {
    /// Wait until the control socket accepts connections
    async fn wait_ready(&mut self) -> Result<(), WireGuardError> {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(WireGuardError::CreateDevice(format!(
                    "engine exited during startup ({})",
                    status
                )));
            }
            if connect(&self.socket).await.is_ok() {
                debug!("Engine socket {} ready", self.socket.display());
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(WireGuardError::CreateDevice(format!(
                    "engine socket {} did not appear",
                    self.socket.display()
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn request(&self, request: &str) -> Result<String, WireGuardError> {
        let stream = connect(&self.socket).await?;
        exchange(stream, request).await
    }
}

#[cfg(unix)]
async fn connect(path: &Path) -> std::io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
async fn connect(path: &Path) -> std::io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path)
}

/// Send one request and read the response up to the terminating blank line
pub(crate) async fn exchange<S>(stream: S, request: &str) -> Result<String, WireGuardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);

    let io = async {
        reader.get_mut().write_all(request.as_bytes()).await?;
        reader.get_mut().flush().await?;

        let mut response = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 || line.trim_end().is_empty() {
                break;
            }
            response.push_str(&line);
        }
        Ok::<_, std::io::Error>(response)
    };

    timeout(EXCHANGE_TIMEOUT, io)
        .await
        .map_err(|_| WireGuardError::Protocol("engine did not answer".to_string()))?
        .map_err(WireGuardError::from)
}

#[async_trait]
impl EngineDevice for ExternalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure(&mut self, block: &str) -> Result<(), WireGuardError> {
        let response = self.request(&format!("set=1\n{}\n", block)).await?;
        match parse_errno(&response) {
            Some(0) => Ok(()),
            Some(errno) => Err(WireGuardError::Configure(errno)),
            None => Err(WireGuardError::Protocol("missing errno in set response".to_string())),
        }
    }

    async fn up(&mut self) -> Result<(), WireGuardError> {
        #[cfg(unix)]
        {
            use fos_network::{CommandRunner, SystemRunner};
            let mtu = self.mtu.to_string();
            SystemRunner
                .run("ip", &["link", "set", "dev", self.name.as_str(), "mtu", mtu.as_str(), "up"])
                .await
                .map_err(|e| WireGuardError::Up(e.to_string()))?;
        }
        #[cfg(windows)]
        debug!("Engine {} manages link state (mtu {})", self.name, self.mtu);
        Ok(())
    }

    async fn report(&mut self) -> Result<String, WireGuardError> {
        let response = self.request("get=1\n\n").await?;
        match parse_errno(&response) {
            Some(0) => Ok(response),
            Some(errno) => Err(WireGuardError::Protocol(format!("get failed with errno {}", errno))),
            None => Err(WireGuardError::Protocol("missing errno in get response".to_string())),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("Engine for {} already gone: {}", self.name, e);
        }
        if let Err(e) = self.child.wait().await {
            warn!("Failed to reap engine for {}: {}", self.name, e);
        }
        if cfg!(unix) {
            let _ = tokio::fs::remove_file(&self.socket).await;
        }
    }
}
