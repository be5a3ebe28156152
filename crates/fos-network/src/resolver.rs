//! Endpoint Resolution
//!
//! The endpoint host route must point at a concrete address, so hostnames
//! are resolved through the system resolver configuration before any
//! route is added. Literal addresses never touch the network.

use crate::error::NetworkError;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use tracing::debug;

/// Extract the host part of `host:port`, `[v6]:port`, or a bare host
pub fn endpoint_host(endpoint: &str) -> &str {
    if let Some(rest) = endpoint.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }

    // A bare IPv6 literal has several colons and no port
    if endpoint.parse::<IpAddr>().is_ok() {
        return endpoint;
    }

    match endpoint.rfind(':') {
        Some(idx) if idx > 0 => &endpoint[..idx],
        _ => endpoint,
    }
}

/// Resolve a host to a single address; literals are returned as-is
pub async fn resolve_host(host: &str) -> Result<IpAddr, NetworkError> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }

    debug!("Resolving endpoint host {}", host);
    let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
        NetworkError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        }
    })?;

    let lookup = resolver
        .lookup_ip(host)
        .await
        .map_err(|e| NetworkError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    // Prefer IPv4 so the host route matches the common default gateway
    let addresses: Vec<IpAddr> = lookup.iter().collect();
    addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
        .ok_or_else(|| NetworkError::Resolve {
            host: host.to_string(),
            reason: "no addresses found".to_string(),
        })
}
