//! OpenVPN Management Interface Client
//!
//! One short-lived TCP connection per request:
//!
//! ```text
//! <greeting line>
//! status          ──▶  ... TUN/TAP read bytes,<n> ... END
//! signal SIGTERM  ──▶  SUCCESS: signal SIGTERM thrown
//! ```

use super::OpenVpnError;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_DEADLINE: Duration = Duration::from_secs(3);

/// Traffic counters from a `status` response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

/// Management interface client bound to a local port
#[derive(Debug, Clone, Copy)]
pub struct ManagementClient {
    addr: SocketAddr,
}

impl ManagementClient {
    /// Client for `127.0.0.1:<port>`
    pub fn new(port: u16) -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        }
    }

    /// Port the subprocess is told to listen on
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    async fn open(&self) -> Result<BufReader<TcpStream>, OpenVpnError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| OpenVpnError::Management("connect timed out".to_string()))?
            .map_err(|e| OpenVpnError::Management(format!("failed to connect: {}", e)))?;

        let mut reader = BufReader::new(stream);
        let mut greeting = String::new();
        reader.read_line(&mut greeting).await?;
        Ok(reader)
    }

    /// Query traffic counters
    pub async fn stats(&self) -> Result<TrafficStats, OpenVpnError> {
        let request = async {
            let mut conn = self.open().await?;
            conn.get_mut().write_all(b"status\n").await?;

            let mut stats = TrafficStats::default();
            let mut line = String::new();
            loop {
                line.clear();
                if conn.read_line(&mut line).await? == 0 {
                    break;
                }
                let line = line.trim();
                if line == "END" {
                    break;
                }
                if let Some(n) = line.strip_prefix("TUN/TAP read bytes,") {
                    stats.rx_bytes = n.parse().unwrap_or(stats.rx_bytes);
                } else if let Some(n) = line.strip_prefix("TUN/TAP write bytes,") {
                    stats.tx_bytes = n.parse().unwrap_or(stats.tx_bytes);
                }
            }
            Ok::<_, OpenVpnError>(stats)
        };

        timeout(REQUEST_DEADLINE, request)
            .await
            .map_err(|_| OpenVpnError::Management("status timed out".to_string()))?
    }

    /// Send `signal <name>` and read the acknowledgement line
    pub async fn signal(&self, name: &str) -> Result<String, OpenVpnError> {
        let request = async {
            let mut conn = self.open().await?;
            conn.get_mut()
                .write_all(format!("signal {}\n", name).as_bytes())
                .await?;

            let mut reply = String::new();
            conn.read_line(&mut reply).await?;
            Ok::<_, OpenVpnError>(reply.trim().to_string())
        };

        timeout(REQUEST_DEADLINE, request)
            .await
            .map_err(|_| OpenVpnError::Management("signal timed out".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serve a single management connection with canned replies
    async fn fake_management(replies: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = BufReader::new(stream);
            conn.get_mut()
                .write_all(b">INFO:OpenVPN Management Interface Version 5\n")
                .await
                .unwrap();

            let mut command = String::new();
            conn.read_line(&mut command).await.unwrap();
            conn.get_mut().write_all(replies.as_bytes()).await.unwrap();
            command
        });

        (port, handle)
    }

    #[tokio::test]
    async fn test_status_counters() {
        let (port, server) = fake_management(
            "OpenVPN STATISTICS\n\
             Updated,2024-01-01 00:00:00\n\
             TUN/TAP read bytes,1500\n\
             TUN/TAP write bytes,3000\n\
             TCP/UDP read bytes,4000\n\
             END\n",
        )
        .await;

        let stats = ManagementClient::new(port).stats().await.unwrap();

        assert_eq!(server.await.unwrap(), "status\n");
        assert_eq!(stats.rx_bytes, 1500);
        assert_eq!(stats.tx_bytes, 3000);
    }

    #[tokio::test]
    async fn test_signal() {
        let (port, server) = fake_management("SUCCESS: signal SIGTERM thrown\n").await;

        let reply = ManagementClient::new(port).signal("SIGTERM").await.unwrap();

        assert_eq!(server.await.unwrap(), "signal SIGTERM\n");
        assert_eq!(reply, "SUCCESS: signal SIGTERM thrown");
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(ManagementClient::new(port).stats().await.is_err());
    }
}
