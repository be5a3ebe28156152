//! Network configuration errors

use std::io;
use thiserror::Error;

/// Errors raised while mutating the host network stack
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("tunnel address is empty, check the server profile")]
    EmptyAddress,

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("invalid interface name: {0:?}")]
    InvalidInterface(String),

    #[error("invalid DNS server address: {0:?}")]
    InvalidDnsServer(String),

    #[error("failed to resolve endpoint {host:?}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("default gateway not found")]
    NoDefaultGateway,

    #[error("{command} failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
