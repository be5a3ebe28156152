//! fOS Network Configurator
//!
//! Host network changes needed to send traffic through a VPN tunnel:
//!
//! 1. Tunnel address assignment (and link up)
//! 2. Split-default routes plus a host route to the endpoint
//! 3. DNS override
//!
//! Each capability has a unix and a Windows backend chosen once when the
//! [`NetworkConfigurator`] is built. Everything that was changed is
//! remembered so teardown can undo it in reverse.

mod address;
mod command;
mod dns;
mod error;
mod platform;
mod resolver;
mod routes;

pub use address::{AddressAssigner, parse_tunnel_address};
pub use command::{CommandRunner, SystemRunner, render};
pub use dns::{DnsManager, NetshDns, RESOLV_CONF, ResolvConfDns, validate_servers};
pub use error::NetworkError;
pub use platform::{Platform, is_elevated, valid_interface_name};
pub use resolver::{endpoint_host, resolve_host};
pub use routes::{Route, RouteBackend, RouteManager, UnixRoutes, WindowsRoutes};

use std::sync::Arc;

/// Address, route and DNS managers for one tunnel
pub struct NetworkConfigurator {
    address: AddressAssigner,
    routes: RouteManager,
    dns: Box<dyn DnsManager>,
}

impl NetworkConfigurator {
    /// Assemble a configurator from parts
    pub fn new(address: AddressAssigner, routes: RouteManager, dns: Box<dyn DnsManager>) -> Self {
        Self {
            address,
            routes,
            dns,
        }
    }

    /// Build the backends for a platform around a command runner
    pub fn for_platform(platform: Platform, runner: Arc<dyn CommandRunner>) -> Self {
        let dns: Box<dyn DnsManager> = match platform {
            Platform::Unix => Box::new(ResolvConfDns::new()),
            Platform::Windows => Box::new(NetshDns::new(runner.clone())),
        };
        Self::new(
            AddressAssigner::new(platform, runner.clone()),
            RouteManager::for_platform(platform, runner),
            dns,
        )
    }

    /// Configurator for the running host
    pub fn system() -> Self {
        Self::for_platform(Platform::current(), Arc::new(SystemRunner))
    }

    /// Assign the tunnel address to `interface` and bring it up
    pub async fn assign_address(&self, interface: &str, address: &str) -> Result<(), NetworkError> {
        self.address.assign(interface, address).await
    }

    /// Route all traffic through `interface`, keeping `endpoint` reachable
    pub async fn add_vpn_routes(
        &mut self,
        interface: &str,
        endpoint: &str,
        ipv6: bool,
    ) -> Result<(), NetworkError> {
        self.routes.add_vpn_routes(interface, endpoint, ipv6).await
    }

    /// Remove every route added by [`Self::add_vpn_routes`], newest first
    pub async fn remove_vpn_routes(&mut self) -> Result<(), NetworkError> {
        self.routes.remove_vpn_routes().await
    }

    /// Override DNS with `servers`
    pub async fn set_dns(&mut self, interface: &str, servers: &[String]) -> Result<(), NetworkError> {
        self.dns.set(interface, servers).await
    }

    /// Put the previous DNS configuration back
    pub async fn restore_dns(&mut self) -> Result<(), NetworkError> {
        self.dns.restore().await
    }

    /// Routes currently installed
    pub fn routes(&self) -> &[Route] {
        self.routes.added_routes()
    }
}
