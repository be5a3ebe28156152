//! Server Profiles
//!
//! A [`ServerProfile`] describes one remote endpoint and everything either
//! backend needs to reach it. Profiles are read-only once loaded.

use crate::keys::{KeyError, validate_key};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Profile errors
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("name cannot be empty")]
    EmptyName,

    #[error(
        "invalid name {0:?}: must be alphanumeric with hyphens, underscores, or spaces (max 63 chars)"
    )]
    InvalidName(String),

    #[error("endpoint is empty")]
    EmptyEndpoint,

    #[error("wireguard profile {0:?} has no peer public key")]
    MissingPublicKey(String),

    #[error("invalid {field}: {source}")]
    InvalidKey {
        field: &'static str,
        #[source]
        source: KeyError,
    },

    #[error("failed to read profile: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse profile: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Tunnel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    WireGuard,
    OpenVpn,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::WireGuard
    }
}

impl Protocol {
    /// Lowercase tag used in profiles and persisted state
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::WireGuard => "wireguard",
            Protocol::OpenVpn => "openvpn",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_allowed_ips() -> Vec<String> {
    vec!["0.0.0.0/0".to_string(), "::/0".to_string()]
}

fn default_dns() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "1.0.0.1".to_string()]
}

fn default_keepalive() -> u16 {
    25
}

fn default_mtu() -> u16 {
    1420
}

/// Remote endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerProfile {
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    /// `host:port`
    pub endpoint: String,
    /// Tunnel-local address, CIDR or bare IP
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,

    // WireGuard
    #[serde(default)]
    pub public_key: String,
    #[serde(default = "default_allowed_ips")]
    pub allowed_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    /// Seconds; 0 disables keepalive
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    // OpenVPN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default)]
    pub comp_lzo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ServerProfile {
    /// Create a WireGuard profile with default allowed IPs, DNS and keepalive
    pub fn wireguard(name: &str, endpoint: &str, public_key: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            protocol: Protocol::WireGuard,
            endpoint: endpoint.to_string(),
            address: address.to_string(),
            dns: default_dns(),
            public_key: public_key.to_string(),
            allowed_ips: default_allowed_ips(),
            preshared_key: None,
            persistent_keepalive: default_keepalive(),
            mtu: default_mtu(),
            proto: None,
            remote_port: None,
            cipher: None,
            auth: None,
            comp_lzo: false,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            tls_auth: None,
            username: None,
            password: None,
        }
    }

    /// Create an OpenVPN profile
    pub fn openvpn(name: &str, endpoint: &str) -> Self {
        Self {
            protocol: Protocol::OpenVpn,
            public_key: String::new(),
            dns: Vec::new(),
            allowed_ips: Vec::new(),
            ..Self::wireguard(name, endpoint, "", "")
        }
    }

    /// Parse a profile from TOML
    pub fn from_toml(s: &str) -> Result<Self, ProfileError> {
        let profile: Self = toml::from_str(s)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Load and validate a profile file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Check the fields the selected protocol depends on
    pub fn validate(&self) -> Result<(), ProfileError> {
        validate_name(&self.name)?;
        if self.endpoint.trim().is_empty() {
            return Err(ProfileError::EmptyEndpoint);
        }

        if self.protocol == Protocol::WireGuard {
            if self.public_key.is_empty() {
                return Err(ProfileError::MissingPublicKey(self.name.clone()));
            }
            validate_key(&self.public_key).map_err(|source| ProfileError::InvalidKey {
                field: "public_key",
                source,
            })?;
            if let Some(psk) = &self.preshared_key {
                validate_key(psk).map_err(|source| ProfileError::InvalidKey {
                    field: "preshared_key",
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Host part of the endpoint
    pub fn endpoint_host(&self) -> &str {
        fos_network::endpoint_host(&self.endpoint)
    }

    /// Whether any allowed IP is an IPv6 prefix
    pub fn needs_ipv6(&self) -> bool {
        self.allowed_ips.iter().any(|ip| ip.contains(':'))
    }
}

/// Check that a server name is usable as a file name
pub fn validate_name(name: &str) -> Result<(), ProfileError> {
    if name.is_empty() {
        return Err(ProfileError::EmptyName);
    }

    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-'));

    if first_ok && rest_ok && name.len() <= 63 {
        Ok(())
    } else {
        Err(ProfileError::InvalidName(name.to_string()))
    }
}
