//! Tunnel address assignment

use crate::command::CommandRunner;
use crate::error::NetworkError;
use crate::platform::{Platform, valid_interface_name};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Parse a tunnel address given as CIDR or bare IP.
///
/// A bare IPv4 address becomes a /32 and a bare IPv6 address a /128.
pub fn parse_tunnel_address(address: &str) -> Result<IpNet, NetworkError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(NetworkError::EmptyAddress);
    }

    if let Ok(net) = address.parse::<IpNet>() {
        return Ok(net);
    }

    let addr: IpAddr = address
        .parse()
        .map_err(|_| NetworkError::InvalidAddress(address.to_string()))?;
    let bits = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, bits).map_err(|_| NetworkError::InvalidAddress(address.to_string()))
}

/// Assigns the tunnel address to an interface and brings it up
pub struct AddressAssigner {
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
}

impl AddressAssigner {
    /// Create an assigner for a platform
    pub fn new(platform: Platform, runner: Arc<dyn CommandRunner>) -> Self {
        Self { platform, runner }
    }

    /// Assign `address` to `interface` and set the link up
    pub async fn assign(&self, interface: &str, address: &str) -> Result<(), NetworkError> {
        let net = parse_tunnel_address(address)?;
        if !valid_interface_name(interface) {
            return Err(NetworkError::InvalidInterface(interface.to_string()));
        }

        debug!("Assigning {} to {}", net, interface);
        match self.platform {
            Platform::Unix => self.assign_unix(interface, net).await,
            Platform::Windows => self.assign_windows(interface, net).await,
        }
    }

    async fn assign_unix(&self, interface: &str, net: IpNet) -> Result<(), NetworkError> {
        let cidr = net.to_string();
        self.runner
            .run("ip", &["addr", "add", &cidr, "dev", interface])
            .await?;
        self.runner
            .run("ip", &["link", "set", interface, "up"])
            .await?;
        Ok(())
    }

    async fn assign_windows(&self, interface: &str, net: IpNet) -> Result<(), NetworkError> {
        let name = format!("name={}", interface);
        match net {
            IpNet::V4(v4) => {
                let addr = v4.addr().to_string();
                let mask = v4.netmask().to_string();
                self.runner
                    .run(
                        "netsh",
                        &["interface", "ip", "set", "address", &name, "static", &addr, &mask],
                    )
                    .await?;
            }
            IpNet::V6(v6) => {
                let cidr = v6.to_string();
                self.runner
                    .run("netsh", &["interface", "ipv6", "add", "address", interface, &cidr])
                    .await?;
            }
        }
        Ok(())
    }
}
