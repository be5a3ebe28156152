//! DNS Override
//!
//! Points the host resolver at the profile's DNS servers while the tunnel
//! is up and puts the previous configuration back afterwards.
//!
//! - Unix: rewrites `resolv.conf`, keeping the original contents in memory
//! - Windows: `netsh` static servers on the tunnel interface, DHCP on restore
//!
//! An empty server list is a no-op. Every server is validated before
//! anything is changed.

use crate::command::CommandRunner;
use crate::error::NetworkError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Default resolver configuration on unix hosts
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Per-OS DNS override
#[async_trait]
pub trait DnsManager: Send + Sync {
    /// Use `servers` for name resolution; the first one is primary
    async fn set(&mut self, interface: &str, servers: &[String]) -> Result<(), NetworkError>;

    /// Undo [`DnsManager::set`]. Does nothing if `set` never applied anything.
    async fn restore(&mut self) -> Result<(), NetworkError>;
}

/// Parse every server, failing on the first one that is not an IP address
pub fn validate_servers(servers: &[String]) -> Result<Vec<IpAddr>, NetworkError> {
    servers
        .iter()
        .map(|s| {
            s.trim()
                .parse::<IpAddr>()
                .map_err(|_| NetworkError::InvalidDnsServer(s.clone()))
        })
        .collect()
}

/// What the resolver file looked like before the first override
#[derive(Debug, Clone, PartialEq, Eq)]
enum Backup {
    Contents(String),
    Absent,
}

/// `resolv.conf` rewriting backend
#[derive(Debug)]
pub struct ResolvConfDns {
    path: PathBuf,
    backup: Option<Backup>,
}

impl ResolvConfDns {
    /// Manage the system resolver file
    pub fn new() -> Self {
        Self::with_path(RESOLV_CONF)
    }

    /// Manage a resolver file at a custom location
    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            backup: None,
        }
    }

    /// Path of the managed file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn render(interface: &str, servers: &[IpAddr]) -> String {
        let mut contents = format!("# Generated by fos-vpn for {}\n", interface);
        for server in servers {
            contents.push_str(&format!("nameserver {}\n", server));
        }
        contents
    }
}

impl Default for ResolvConfDns {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsManager for ResolvConfDns {
    async fn set(&mut self, interface: &str, servers: &[String]) -> Result<(), NetworkError> {
        if servers.is_empty() {
            return Ok(());
        }
        let parsed = validate_servers(servers)?;

        // Only the first override captures the original file
        if self.backup.is_none() {
            let backup = match tokio::fs::read_to_string(&self.path).await {
                Ok(contents) => Backup::Contents(contents),
                Err(e) if e.kind() == ErrorKind::NotFound => Backup::Absent,
                Err(e) => return Err(e.into()),
            };
            self.backup = Some(backup);
        }

        tokio::fs::write(&self.path, Self::render(interface, &parsed)).await?;
        info!("DNS set to {:?} via {}", parsed, self.path.display());
        Ok(())
    }

    async fn restore(&mut self) -> Result<(), NetworkError> {
        match self.backup.take() {
            None => Ok(()),
            Some(Backup::Contents(contents)) => {
                tokio::fs::write(&self.path, contents).await?;
                info!("DNS restored from backup");
                Ok(())
            }
            Some(Backup::Absent) => match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

/// `netsh` backend
pub struct NetshDns {
    runner: Arc<dyn CommandRunner>,
    /// Interface and address families that were overridden
    applied: Option<(String, Vec<&'static str>)>,
}

impl NetshDns {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            applied: None,
        }
    }
}

fn netsh_family(addr: &IpAddr) -> &'static str {
    if addr.is_ipv4() { "ip" } else { "ipv6" }
}

#[async_trait]
impl DnsManager for NetshDns {
    async fn set(&mut self, interface: &str, servers: &[String]) -> Result<(), NetworkError> {
        if servers.is_empty() {
            return Ok(());
        }
        let parsed = validate_servers(servers)?;
        let name = format!("name={}", interface);

        // Recorded up front so a partial failure is still reset on restore
        let mut families: Vec<&'static str> = Vec::new();
        for server in &parsed {
            let family = netsh_family(server);
            if !families.contains(&family) {
                families.push(family);
            }
        }
        self.applied = Some((interface.to_string(), families));

        for (i, server) in parsed.iter().enumerate() {
            let family = netsh_family(server);
            let addr = server.to_string();
            if i == 0 {
                self.runner
                    .run(
                        "netsh",
                        &["interface", family, "set", "dns", name.as_str(), "static", addr.as_str()],
                    )
                    .await?;
            } else {
                let index = format!("index={}", i + 1);
                self.runner
                    .run(
                        "netsh",
                        &["interface", family, "add", "dns", name.as_str(), addr.as_str(), index.as_str()],
                    )
                    .await?;
            }
            debug!("DNS server {} applied to {}", server, interface);
        }

        Ok(())
    }

    async fn restore(&mut self) -> Result<(), NetworkError> {
        let Some((interface, families)) = self.applied.take() else {
            return Ok(());
        };
        let name = format!("name={}", interface);

        let mut last_error = None;
        for family in families {
            if let Err(e) = self
                .runner
                .run("netsh", &["interface", family, "set", "dns", name.as_str(), "dhcp"])
                .await
            {
                last_error = Some(e);
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::RecordingRunner;

    fn servers(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_validate_servers() {
        assert_eq!(validate_servers(&servers(&["1.1.1.1", "2606:4700::1111"])).unwrap().len(), 2);
        let err = validate_servers(&servers(&["1.1.1.1", "dns.example"])).unwrap_err();
        assert!(err.to_string().contains("invalid DNS"));
    }

    #[tokio::test]
    async fn test_resolv_conf_set_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.168.1.1\n").unwrap();

        let mut dns = ResolvConfDns::with_path(&path);
        dns.set("fosvpn0", &servers(&["1.1.1.1", "1.0.0.1"])).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("nameserver 1.1.1.1\nnameserver 1.0.0.1\n"));
        assert!(!contents.contains("192.168.1.1"));

        // A second set keeps the first backup
        dns.set("fosvpn0", &servers(&["9.9.9.9"])).await.unwrap();

        dns.restore().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nameserver 192.168.1.1\n");
    }

    #[tokio::test]
    async fn test_resolv_conf_empty_and_unset_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.168.1.1\n").unwrap();

        let mut dns = ResolvConfDns::with_path(&path);
        dns.restore().await.unwrap();
        dns.set("fosvpn0", &[]).await.unwrap();
        dns.restore().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nameserver 192.168.1.1\n");
    }

    #[tokio::test]
    async fn test_resolv_conf_invalid_server_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.168.1.1\n").unwrap();

        let mut dns = ResolvConfDns::with_path(&path);
        let result = dns.set("fosvpn0", &servers(&["1.1.1.1", "not-an-ip"])).await;

        assert!(matches!(result, Err(NetworkError::InvalidDnsServer(_))));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nameserver 192.168.1.1\n");
    }

    #[tokio::test]
    async fn test_resolv_conf_absent_file_removed_on_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");

        let mut dns = ResolvConfDns::with_path(&path);
        dns.set("fosvpn0", &servers(&["1.1.1.1"])).await.unwrap();
        assert!(path.exists());

        dns.restore().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_netsh_primary_then_secondary() {
        let runner = Arc::new(RecordingRunner::new());
        let mut dns = NetshDns::new(runner.clone());

        dns.set("fosvpn0", &servers(&["1.1.1.1", "1.0.0.1"])).await.unwrap();
        dns.restore().await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "netsh interface ip set dns name=fosvpn0 static 1.1.1.1",
                "netsh interface ip add dns name=fosvpn0 1.0.0.1 index=2",
                "netsh interface ip set dns name=fosvpn0 dhcp",
            ]
        );
    }

    #[tokio::test]
    async fn test_netsh_partial_failure_still_restored() {
        let runner = Arc::new(
            RecordingRunner::new().fail("netsh interface ip add dns", "The object already exists."),
        );
        let mut dns = NetshDns::new(runner.clone());

        assert!(dns.set("fosvpn0", &servers(&["1.1.1.1", "1.0.0.1"])).await.is_err());
        dns.restore().await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "netsh interface ip set dns name=fosvpn0 static 1.1.1.1",
                "netsh interface ip add dns name=fosvpn0 1.0.0.1 index=2",
                "netsh interface ip set dns name=fosvpn0 dhcp",
            ]
        );
    }

    #[tokio::test]
    async fn test_netsh_rejects_before_applying() {
        let runner = Arc::new(RecordingRunner::new());
        let mut dns = NetshDns::new(runner.clone());

        assert!(dns.set("fosvpn0", &servers(&["1.1.1.1", "bogus"])).await.is_err());
        dns.restore().await.unwrap();
        assert!(runner.calls().is_empty());
    }
}
