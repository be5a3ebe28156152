//! OpenVPN Client Configuration
//!
//! Renders a complete client config from a [`ServerProfile`]. PEM material
//! is embedded inline so the subprocess needs exactly one file (plus an
//! optional credentials file).

use super::OpenVpnError;
use crate::profile::ServerProfile;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Port used when the endpoint does not name one
pub const DEFAULT_PORT: u16 = 1194;

#[cfg(windows)]
const INSTALL_PATHS: &[&str] = &[
    r"C:\Program Files\OpenVPN\bin\openvpn.exe",
    r"C:\Program Files (x86)\OpenVPN\bin\openvpn.exe",
];

#[cfg(not(windows))]
const INSTALL_PATHS: &[&str] = &[
    "/usr/sbin/openvpn",
    "/usr/local/sbin/openvpn",
    "/usr/bin/openvpn",
    "/usr/local/bin/openvpn",
];

/// Locate the openvpn executable: `PATH` first, then install locations
pub fn detect_openvpn() -> Result<PathBuf, OpenVpnError> {
    if let Ok(path) = which::which("openvpn") {
        return Ok(path);
    }

    INSTALL_PATHS
        .iter()
        .map(Path::new)
        .find(|path| path.is_file())
        .map(Path::to_path_buf)
        .ok_or(OpenVpnError::BinaryNotFound)
}

/// Split `host:port`; the port defaults to `fallback`
pub fn split_endpoint(endpoint: &str, fallback: u16) -> (String, String) {
    let host = fos_network::endpoint_host(endpoint);
    let port = endpoint
        .rsplit_once(':')
        .filter(|(h, _)| !h.is_empty() && host != endpoint)
        .map(|(_, p)| p.to_string())
        .unwrap_or_else(|| fallback.to_string());
    (host.to_string(), port)
}

/// Render the client configuration
pub fn build_config(profile: &ServerProfile, management_port: u16, auth_file: Option<&Path>) -> String {
    let mut out = String::new();

    out.push_str("client\n");
    out.push_str("dev tun\n");
    out.push_str("nobind\n");
    out.push_str("persist-key\n");
    out.push_str("persist-tun\n");

    let proto = profile.proto.as_deref().filter(|p| !p.is_empty()).unwrap_or("udp");
    let _ = writeln!(out, "proto {}", proto);

    let (host, port) = split_endpoint(&profile.endpoint, profile.remote_port.unwrap_or(DEFAULT_PORT));
    let _ = writeln!(out, "remote {} {}", host, port);
    out.push_str("resolv-retry infinite\n");

    if let Some(cipher) = profile.cipher.as_deref().filter(|c| !c.is_empty()) {
        let _ = writeln!(out, "cipher {}", cipher);
    }
    if let Some(auth) = profile.auth.as_deref().filter(|a| !a.is_empty()) {
        let _ = writeln!(out, "auth {}", auth);
    }
    if profile.comp_lzo {
        out.push_str("comp-lzo\n");
    }
    if let Some(path) = auth_file {
        let _ = writeln!(out, "auth-user-pass {}", path.display());
    }

    out.push_str("verb 3\n");
    let _ = writeln!(out, "management 127.0.0.1 {}", management_port);

    inline_block(&mut out, "ca", profile.ca_cert.as_deref());
    inline_block(&mut out, "cert", profile.client_cert.as_deref());
    inline_block(&mut out, "key", profile.client_key.as_deref());
    if profile.tls_auth.as_deref().is_some_and(|t| !t.is_empty()) {
        out.push_str("key-direction 1\n");
        inline_block(&mut out, "tls-auth", profile.tls_auth.as_deref());
    }

    out
}

/// Contents of the `auth-user-pass` file, when the profile has credentials
pub fn credentials(profile: &ServerProfile) -> Option<String> {
    let username = profile.username.as_deref().filter(|u| !u.is_empty())?;
    let password = profile.password.as_deref().unwrap_or("");
    Some(format!("{}\n{}\n", username, password))
}

fn inline_block(out: &mut String, tag: &str, contents: Option<&str>) {
    if let Some(contents) = contents.filter(|c| !c.is_empty()) {
        let _ = write!(out, "<{tag}>\n{}\n</{tag}>\n", contents.trim_end());
    }
}
