//! Control Channel Client
//!
//! Used by the front end. Any failure to reach the daemon is reported as
//! [`IpcError::NotRunning`]; by far the most common cause is that no
//! daemon is running.

use super::protocol::{decode_response, encode_line, IpcRequest, IpcResponse};
use super::{Connection, IpcEndpoint, IpcError, CLIENT_DEADLINE, CONNECT_TIMEOUT};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::debug;

async fn open(endpoint: &IpcEndpoint) -> Result<(Box<dyn Connection>, Option<String>), IpcError> {
    let connect = async {
        match endpoint {
            #[cfg(unix)]
            IpcEndpoint::Socket { path } => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok::<_, std::io::Error>((Box::new(stream) as Box<dyn Connection>, None))
            }
            IpcEndpoint::Loopback { addr, token_path } => {
                let token = tokio::fs::read_to_string(token_path).await?;
                let stream = tokio::net::TcpStream::connect(addr).await?;
                Ok((Box::new(stream) as Box<dyn Connection>, Some(token.trim().to_string())))
            }
        }
    };

    match timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(opened)) => Ok(opened),
        Ok(Err(e)) => {
            debug!("IPC connect to {} failed: {}", endpoint, e);
            Err(IpcError::NotRunning)
        }
        Err(_) => {
            debug!("IPC connect to {} timed out", endpoint);
            Err(IpcError::NotRunning)
        }
    }
}

/// Send `command` to the daemon and wait for its reply
pub async fn send_request(endpoint: &IpcEndpoint, command: &str) -> Result<IpcResponse, IpcError> {
    let (conn, token) = open(endpoint).await?;

    let exchange = async {
        let mut reader = BufReader::new(conn);
        let mut request = String::new();
        if let Some(token) = token {
            request.push_str(&token);
            request.push('\n');
        }
        request.push_str(&encode_line(&IpcRequest::new(command))?);

        reader.get_mut().write_all(request.as_bytes()).await?;
        reader.get_mut().flush().await?;

        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(IpcError::Closed);
        }
        Ok(decode_response(&line)?)
    };

    timeout(CLIENT_DEADLINE, exchange)
        .await
        .map_err(|_| IpcError::Timeout)?
}
