//! Engine Configuration Protocol
//!
//! Newline-delimited `key=value` pairs, as spoken by userspace WireGuard
//! engines over their control socket:
//!
//! ```text
//! set=1                 get=1
//! private_key=<hex>     <blank>
//! public_key=<hex>
//! endpoint=<host:port>  ──▶ key=value report ... errno=0
//! allowed_ip=<cidr>
//! <blank>
//! ```
//!
//! Values are written verbatim, so anything that could smuggle a line
//! break into the block is rejected.

use super::{WireGuardConfig, WireGuardError};
use crate::keys::key_to_hex;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;

/// Build the configuration block for `set=1`
pub fn build_config_block(config: &WireGuardConfig) -> Result<String, WireGuardError> {
    let mut block = String::new();

    let private = hex_key("private key", &config.private_key)?;
    let _ = writeln!(block, "private_key={}", private);

    let public = hex_key("peer public key", &config.peer_public_key)?;
    let _ = writeln!(block, "public_key={}", public);

    if let Some(psk) = config.preshared_key.as_deref().filter(|k| !k.is_empty()) {
        let psk = hex_key("preshared key", psk)?;
        let _ = writeln!(block, "preshared_key={}", psk);
    }

    if config.endpoint.is_empty() {
        return Err(WireGuardError::MissingEndpoint);
    }
    if has_line_break(&config.endpoint) {
        return Err(WireGuardError::EndpointNewline);
    }
    let _ = writeln!(block, "endpoint={}", config.endpoint);

    if config.allowed_ips.is_empty() {
        return Err(WireGuardError::NoAllowedIps);
    }
    for allowed_ip in &config.allowed_ips {
        if has_line_break(allowed_ip) {
            return Err(WireGuardError::AllowedIpNewline);
        }
        let _ = writeln!(block, "allowed_ip={}", allowed_ip);
    }

    if config.persistent_keepalive > 0 {
        let _ = writeln!(
            block,
            "persistent_keepalive_interval={}",
            config.persistent_keepalive
        );
    }

    Ok(block)
}

fn hex_key(field: &'static str, key: &str) -> Result<String, WireGuardError> {
    key_to_hex(key).map_err(|source| WireGuardError::InvalidKey { field, source })
}

fn has_line_break(value: &str) -> bool {
    value.contains(['\n', '\r'])
}

/// Counters recovered from a `get=1` report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    /// Seconds since the epoch; 0 means no handshake yet
    pub last_handshake_sec: i64,
}

impl DeviceStats {
    /// Last handshake time, if one happened
    pub fn last_handshake(&self) -> Option<DateTime<Utc>> {
        if self.last_handshake_sec > 0 {
            DateTime::from_timestamp(self.last_handshake_sec, 0)
        } else {
            None
        }
    }
}

/// Parse a `get=1` report.
///
/// Counters are summed over all peers. Unknown keys and malformed lines
/// are skipped.
pub fn parse_stats(report: &str) -> DeviceStats {
    let mut stats = DeviceStats::default();

    for line in report.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "tx_bytes" => stats.tx_bytes += value.parse::<u64>().unwrap_or(0),
            "rx_bytes" => stats.rx_bytes += value.parse::<u64>().unwrap_or(0),
            "last_handshake_time_sec" => {
                let sec = value.parse::<i64>().unwrap_or(0);
                stats.last_handshake_sec = stats.last_handshake_sec.max(sec);
            }
            _ => {}
        }
    }

    stats
}

/// Extract the `errno=` value terminating an engine response
pub fn parse_errno(response: &str) -> Option<i64> {
    response
        .lines()
        .filter_map(|line| line.strip_prefix("errno="))
        .last()
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

    fn key(byte: u8) -> String {
        BASE64.encode([byte; 32])
    }

    fn config() -> WireGuardConfig {
        WireGuardConfig {
            private_key: key(1),
            peer_public_key: key(2),
            preshared_key: None,
            endpoint: "1.2.3.4:51820".to_string(),
            allowed_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            persistent_keepalive: 25,
            mtu: 1420,
        }
    }

    #[test]
    fn test_block_contents() {
        let block = build_config_block(&config()).unwrap();

        assert_eq!(
            block,
            format!(
                "private_key={}\npublic_key={}\nendpoint=1.2.3.4:51820\n\
                 allowed_ip=0.0.0.0/0\nallowed_ip=::/0\npersistent_keepalive_interval=25\n",
                "01".repeat(32),
                "02".repeat(32),
            )
        );
    }

    #[test]
    fn test_optional_fields() {
        let mut cfg = config();
        cfg.preshared_key = Some(key(3));
        cfg.persistent_keepalive = 0;

        let block = build_config_block(&cfg).unwrap();

        assert!(block.contains(&format!("preshared_key={}\n", "03".repeat(32))));
        assert!(!block.contains("persistent_keepalive_interval"));
    }

    #[test]
    fn test_rejects_line_breaks() {
        let mut cfg = config();
        cfg.endpoint = "1.2.3.4:51820\nallowed_ip=10.0.0.0/8".to_string();
        let err = build_config_block(&cfg).unwrap_err();
        assert!(matches!(err, WireGuardError::EndpointNewline));
        assert_eq!(err.to_string(), "invalid peer endpoint: contains newline characters");

        let mut cfg = config();
        cfg.allowed_ips.push("10.0.0.0/8\r".to_string());
        assert!(matches!(
            build_config_block(&cfg),
            Err(WireGuardError::AllowedIpNewline)
        ));
    }

    #[test]
    fn test_rejects_bad_keys() {
        let mut cfg = config();
        cfg.private_key = BASE64.encode([1u8; 31]);
        let err = build_config_block(&cfg).unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes, got 31"));

        let mut cfg = config();
        cfg.peer_public_key = "???".to_string();
        assert!(matches!(
            build_config_block(&cfg),
            Err(WireGuardError::InvalidKey { field: "peer public key", .. })
        ));
    }

    #[test]
    fn test_requires_endpoint_and_allowed_ips() {
        let mut cfg = config();
        cfg.endpoint.clear();
        assert!(matches!(build_config_block(&cfg), Err(WireGuardError::MissingEndpoint)));

        let mut cfg = config();
        cfg.allowed_ips.clear();
        assert!(matches!(build_config_block(&cfg), Err(WireGuardError::NoAllowedIps)));
    }

    #[test]
    fn test_parse_stats() {
        let report = "private_key=abcd\n\
                      public_key=ef01\n\
                      endpoint=1.2.3.4:51820\n\
                      last_handshake_time_sec=1700000000\n\
                      last_handshake_time_nsec=0\n\
                      tx_bytes=1234\n\
                      rx_bytes=5678\n\
                      garbage line\n\
                      errno=0\n";

        let stats = parse_stats(report);

        assert_eq!(stats.tx_bytes, 1234);
        assert_eq!(stats.rx_bytes, 5678);
        assert_eq!(stats.last_handshake().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_no_handshake_yet() {
        let stats = parse_stats("last_handshake_time_sec=0\ntx_bytes=0\n");
        assert!(stats.last_handshake().is_none());
    }

    #[test]
    fn test_parse_errno() {
        assert_eq!(parse_errno("errno=0\n"), Some(0));
        assert_eq!(parse_errno("tx_bytes=1\nerrno=-22\n"), Some(-22));
        assert_eq!(parse_errno("tx_bytes=1\n"), None);
    }
}
