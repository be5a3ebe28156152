//! Split-Tunnel Route Management
//!
//! Full-tunnel routing without touching the existing default route:
//!
//! ```text
//! <endpoint>/32  via <physical gateway>   keeps the tunnel's own UDP/TCP flowing
//! 0.0.0.0/1      dev <tunnel>             \
//! 128.0.0.0/1    dev <tunnel>              } more specific than 0.0.0.0/0
//! ::/1           dev <tunnel>             } only when the peer carries IPv6
//! 8000::/1       dev <tunnel>             /
//! ```
//!
//! Every route that was actually added is recorded in order. Removal walks
//! the record backwards and keeps going past failures.

use crate::command::CommandRunner;
use crate::error::NetworkError;
use crate::platform::{Platform, valid_interface_name};
use crate::resolver::resolve_host;
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const IPV4_SPLIT: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];
const IPV6_SPLIT: [&str; 2] = ["::/1", "8000::/1"];

/// A route added by the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Host route to the tunnel endpoint through the physical gateway
    Endpoint { destination: IpNet, gateway: IpAddr },
    /// Half-range default bound to the tunnel interface
    Interface { destination: IpNet, interface: String },
}

impl Route {
    /// Destination prefix
    pub fn destination(&self) -> IpNet {
        match self {
            Route::Endpoint { destination, .. } | Route::Interface { destination, .. } => *destination,
        }
    }
}

/// Per-OS route table mutation
#[async_trait]
pub trait RouteBackend: Send + Sync {
    /// Current default gateway for the address family of `target`
    async fn default_gateway(&self, target: IpAddr) -> Result<Option<IpAddr>, NetworkError>;

    /// Add a single route
    async fn add(&self, route: &Route) -> Result<(), NetworkError>;

    /// Delete a single route
    async fn delete(&self, route: &Route) -> Result<(), NetworkError>;
}

/// Adds and removes the VPN routes, remembering what it changed
pub struct RouteManager {
    backend: Box<dyn RouteBackend>,
    added: Vec<Route>,
}

impl RouteManager {
    /// Create a manager over a backend
    pub fn new(backend: Box<dyn RouteBackend>) -> Self {
        Self {
            backend,
            added: Vec::new(),
        }
    }

    /// Create a manager for a platform
    pub fn for_platform(platform: Platform, runner: Arc<dyn CommandRunner>) -> Self {
        match platform {
            Platform::Unix => Self::new(Box::new(UnixRoutes::new(runner))),
            Platform::Windows => Self::new(Box::new(WindowsRoutes::new(runner))),
        }
    }

    /// Routes added so far, in the order they were added
    pub fn added_routes(&self) -> &[Route] {
        &self.added
    }

    /// Install the endpoint host route and the split-default routes.
    ///
    /// `endpoint` is a host (name or literal) without port. On error,
    /// routes added before the failure stay recorded for removal.
    pub async fn add_vpn_routes(
        &mut self,
        interface: &str,
        endpoint: &str,
        ipv6: bool,
    ) -> Result<(), NetworkError> {
        if !valid_interface_name(interface) {
            return Err(NetworkError::InvalidInterface(interface.to_string()));
        }

        let endpoint_addr = resolve_host(endpoint).await?;

        match self.backend.default_gateway(endpoint_addr).await? {
            Some(gateway) => {
                let bits = if endpoint_addr.is_ipv4() { 32 } else { 128 };
                let destination = IpNet::new(endpoint_addr, bits)
                    .map_err(|_| NetworkError::InvalidAddress(endpoint_addr.to_string()))?;
                let route = Route::Endpoint {
                    destination,
                    gateway,
                };
                self.push(route).await?;
            }
            None => warn!(
                "No default gateway for {}, skipping endpoint route",
                endpoint_addr
            ),
        }

        let mut prefixes: Vec<&str> = IPV4_SPLIT.to_vec();
        if ipv6 {
            prefixes.extend_from_slice(&IPV6_SPLIT);
        }

        for prefix in prefixes {
            let destination: IpNet = prefix
                .parse()
                .map_err(|_| NetworkError::InvalidAddress(prefix.to_string()))?;
            self.push(Route::Interface {
                destination,
                interface: interface.to_string(),
            })
            .await?;
        }

        info!("Added {} VPN routes via {}", self.added.len(), interface);
        Ok(())
    }

    /// Delete recorded routes in reverse order.
    ///
    /// Every deletion is attempted; the last error seen is returned.
    pub async fn remove_vpn_routes(&mut self) -> Result<(), NetworkError> {
        let mut last_error = None;

        while let Some(route) = self.added.pop() {
            match self.backend.delete(&route).await {
                Ok(()) => debug!("Removed route {}", route.destination()),
                Err(e) => {
                    warn!("Failed to remove route {}: {}", route.destination(), e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn push(&mut self, route: Route) -> Result<(), NetworkError> {
        self.backend.add(&route).await?;
        debug!("Added route {}", route.destination());
        self.added.push(route);
        Ok(())
    }
}

/// iproute2 backend
pub struct UnixRoutes {
    runner: Arc<dyn CommandRunner>,
}

impl UnixRoutes {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

/// Pick the gateway out of `ip route show default` output
fn parse_ip_route_gateway(output: &str) -> Option<IpAddr> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        while let Some(field) = fields.next() {
            if field == "via" {
                return fields.next().and_then(|gw| gw.parse().ok());
            }
        }
        None
    })
}

#[async_trait]
impl RouteBackend for UnixRoutes {
    async fn default_gateway(&self, target: IpAddr) -> Result<Option<IpAddr>, NetworkError> {
        let output = if target.is_ipv4() {
            self.runner.run("ip", &["route", "show", "default"]).await?
        } else {
            self.runner.run("ip", &["-6", "route", "show", "default"]).await?
        };
        Ok(parse_ip_route_gateway(&output))
    }

    async fn add(&self, route: &Route) -> Result<(), NetworkError> {
        let destination = route.destination();
        let dest = destination.to_string();
        let family = family_flag(destination);

        match route {
            Route::Endpoint { gateway, .. } => {
                let gw = gateway.to_string();
                self.runner
                    .run("ip", &with_family(family, &["route", "add", dest.as_str(), "via", gw.as_str()]))
                    .await?;
            }
            Route::Interface { interface, .. } => {
                self.runner
                    .run("ip", &with_family(family, &["route", "add", dest.as_str(), "dev", interface.as_str()]))
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, route: &Route) -> Result<(), NetworkError> {
        let destination = route.destination();
        let dest = destination.to_string();
        self.runner
            .run("ip", &with_family(family_flag(destination), &["route", "delete", dest.as_str()]))
            .await?;
        Ok(())
    }
}

fn family_flag(net: IpNet) -> Option<&'static str> {
    match net {
        IpNet::V4(_) => None,
        IpNet::V6(_) => Some("-6"),
    }
}

fn with_family<'a>(family: Option<&'a str>, args: &[&'a str]) -> Vec<&'a str> {
    family.into_iter().chain(args.iter().copied()).collect()
}

/// `route` + `netsh` backend
pub struct WindowsRoutes {
    runner: Arc<dyn CommandRunner>,
}

impl WindowsRoutes {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

/// Pick the gateway out of `route print 0.0.0.0` output
fn parse_route_print_gateway(output: &str) -> Option<IpAddr> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 3 && fields[0] == "0.0.0.0" && fields[1] == "0.0.0.0" {
            fields[2].parse().ok()
        } else {
            None
        }
    })
}

#[async_trait]
impl RouteBackend for WindowsRoutes {
    async fn default_gateway(&self, target: IpAddr) -> Result<Option<IpAddr>, NetworkError> {
        if target.is_ipv6() {
            return Ok(None);
        }
        let output = self.runner.run("route", &["print", "0.0.0.0"]).await?;
        parse_route_print_gateway(&output)
            .map(Some)
            .ok_or(NetworkError::NoDefaultGateway)
    }

    async fn add(&self, route: &Route) -> Result<(), NetworkError> {
        match route {
            Route::Endpoint { destination, gateway } => {
                let network = destination.addr().to_string();
                let mask = destination.netmask().to_string();
                let gw = gateway.to_string();
                self.runner
                    .run("route", &["add", &network, "mask", &mask, &gw, "metric", "5"])
                    .await?;
            }
            Route::Interface { destination, interface } => {
                let prefix = destination.to_string();
                let family = netsh_family(*destination);
                self.runner
                    .run(
                        "netsh",
                        &["interface", family, "add", "route", prefix.as_str(), interface.as_str(), "metric=5"],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, route: &Route) -> Result<(), NetworkError> {
        match route {
            Route::Endpoint { destination, gateway } => {
                let network = destination.addr().to_string();
                let mask = destination.netmask().to_string();
                let gw = gateway.to_string();
                self.runner
                    .run("route", &["delete", &network, "mask", &mask, &gw])
                    .await?;
            }
            Route::Interface { destination, interface } => {
                let prefix = destination.to_string();
                let family = netsh_family(*destination);
                self.runner
                    .run(
                        "netsh",
                        &["interface", family, "delete", "route", prefix.as_str(), interface.as_str()],
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

fn netsh_family(net: IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "ip",
        IpNet::V6(_) => "ipv6",
    }
}
