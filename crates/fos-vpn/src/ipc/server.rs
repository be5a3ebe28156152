//! Control Channel Server
//!
//! One accept task; every connection is served on its own task under
//! [`SERVER_DEADLINE`] so a stalled client cannot hold up others or the
//! daemon's shutdown.

use super::protocol::{decode_request, encode_line, IpcRequest, IpcResponse};
use super::{create_private_dir, Connection, IpcEndpoint, IpcError, AUTH_FAILED, SERVER_DEADLINE};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Answers control requests
#[async_trait]
pub trait IpcHandler: Send + Sync {
    async fn handle(&self, request: IpcRequest) -> IpcResponse;
}

enum Listener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<Box<dyn Connection>> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Running control channel
pub struct IpcServer {
    endpoint: IpcEndpoint,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl IpcServer {
    /// Bind `endpoint` and start serving
    pub async fn start(endpoint: IpcEndpoint, handler: Arc<dyn IpcHandler>) -> Result<Self, IpcError> {
        let bind_error = |source| IpcError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };

        let (listener, token, endpoint) = match &endpoint {
            #[cfg(unix)]
            IpcEndpoint::Socket { path } => {
                let listener = bind_socket(path).map_err(bind_error)?;
                (Listener::Unix(listener), None, endpoint.clone())
            }
            IpcEndpoint::Loopback { addr, token_path } => {
                let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
                let token = generate_token();
                write_token(token_path, &token).map_err(bind_error)?;
                let bound = IpcEndpoint::Loopback {
                    addr: listener.local_addr()?,
                    token_path: token_path.clone(),
                };
                (Listener::Tcp(listener), Some(Arc::<str>::from(token)), bound)
            }
        };

        info!("IPC server listening on {}", endpoint);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => {
                            let handler = Arc::clone(&handler);
                            let token = token.clone();
                            tokio::spawn(async move {
                                match tokio::time::timeout(SERVER_DEADLINE, serve(conn, handler, token)).await {
                                    Ok(Ok(())) => {}
                                    Ok(Err(e)) => debug!("IPC connection error: {}", e),
                                    Err(_) => debug!("IPC connection timed out"),
                                }
                            });
                        }
                        Err(e) => error!("IPC accept error: {}", e),
                    },
                }
            }
            debug!("IPC accept loop stopped");
        });

        Ok(Self {
            endpoint,
            shutdown,
            task: Some(task),
        })
    }

    /// Endpoint actually bound (resolved port for loopback)
    pub fn endpoint(&self) -> &IpcEndpoint {
        &self.endpoint
    }

    /// Stop accepting and remove the socket or token file
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        match std::fs::remove_file(self.endpoint.artifact()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.endpoint.artifact().display(), e),
        }
        info!("IPC server closed");
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serve a single request on `conn`
async fn serve(
    conn: Box<dyn Connection>,
    handler: Arc<dyn IpcHandler>,
    token: Option<Arc<str>>,
) -> Result<(), IpcError> {
    let mut reader = BufReader::new(conn);
    let mut line = String::new();

    if let Some(expected) = token {
        reader.read_line(&mut line).await?;
        if line.trim() != &*expected {
            warn!("IPC client failed authentication");
            return respond(&mut reader, &IpcResponse::failure(AUTH_FAILED)).await;
        }
        line.clear();
    }

    if reader.read_line(&mut line).await? == 0 {
        return Err(IpcError::Closed);
    }

    let response = match decode_request(&line) {
        Ok(request) => {
            debug!("IPC request: {}", request.command);
            handler.handle(request).await
        }
        Err(e) => {
            warn!("Invalid IPC request: {}", e);
            IpcResponse::failure(format!("invalid request: {}", e))
        }
    };

    respond(&mut reader, &response).await
}

async fn respond(reader: &mut BufReader<Box<dyn Connection>>, response: &IpcResponse) -> Result<(), IpcError> {
    let line = encode_line(response)?;
    let conn = reader.get_mut();
    conn.write_all(line.as_bytes()).await?;
    conn.flush().await?;
    Ok(())
}

/// 32 random bytes, hex encoded
fn generate_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

fn write_token(path: &Path, token: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        create_private_dir(dir)?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(token.as_bytes())
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, token)
    }
}

#[cfg(unix)]
fn bind_socket(path: &Path) -> std::io::Result<tokio::net::UnixListener> {
    if let Some(dir) = path.parent() {
        create_private_dir(dir)?;
    }

    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    // SAFETY: umask has no memory-safety preconditions.
    let previous = unsafe { libc::umask(0o077) };
    let listener = tokio::net::UnixListener::bind(path);
    // SAFETY: as above.
    unsafe { libc::umask(previous) };
    listener
}
