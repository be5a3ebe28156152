//! Control Channel Wire Format
//!
//! One newline-terminated JSON object each way:
//!
//! ```text
//! [token]\n                          (loopback transport only)
//! {"command":"status"}\n       ──▶
//!                              ◀──  {"success":true,"state":{...}}\n
//! ```

use crate::state::ConnectionState;
use serde::{Deserialize, Serialize};

/// Query the active connection
pub const CMD_STATUS: &str = "status";

/// Ask the daemon to tear down
pub const CMD_DISCONNECT: &str = "disconnect";

/// Request sent by the front end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcRequest {
    pub command: String,
}

impl IpcRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

/// Daemon reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ConnectionState>,
}

impl IpcResponse {
    /// Successful reply without payload
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            state: None,
        }
    }

    /// Successful reply carrying the connection state
    pub fn with_state(state: ConnectionState) -> Self {
        Self {
            success: true,
            error: None,
            state: Some(state),
        }
    }

    /// Failed reply
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            state: None,
        }
    }
}

/// Serialize a message as one line
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one request line
pub fn decode_request(line: &str) -> Result<IpcRequest, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Parse one response line
pub fn decode_response(line: &str) -> Result<IpcResponse, serde_json::Error> {
    serde_json::from_str(line.trim())
}
