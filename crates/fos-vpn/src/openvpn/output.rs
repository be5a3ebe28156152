//! Subprocess Output Scanning
//!
//! stdout and stderr are forwarded line by line into one channel so that
//! lifecycle messages are seen whichever stream they arrive on. A single
//! scanner task consumes the merged stream:
//!
//! - mirrors every line to the debug log
//! - keeps the last [`TRAILING_LINES`] lines for error reports
//! - resolves the connect outcome once
//! - keeps draining afterwards so the subprocess never blocks on a pipe

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Lines kept for diagnostics
pub const TRAILING_LINES: usize = 10;

/// Printed once the tunnel is fully up
pub const CONNECTED_MARKER: &str = "Initialization Sequence Completed";

/// Lines that end a connect attempt
pub const FAILURE_MARKERS: [&str; 2] = ["AUTH_FAILED", "Connection refused"];

/// Meaning of a single output line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Connected,
    Failed,
}

/// Classify a line of subprocess output.
///
/// This is the only place that knows the marker strings.
pub fn classify(line: &str) -> Option<Marker> {
    if line.contains(CONNECTED_MARKER) {
        Some(Marker::Connected)
    } else if FAILURE_MARKERS.iter().any(|m| line.contains(m)) {
        Some(Marker::Failed)
    } else {
        None
    }
}

/// Interface name from a `TUN/TAP device <name> opened` line
pub fn opened_device(line: &str) -> Option<&str> {
    let rest = &line[line.find("TUN/TAP device ")? + "TUN/TAP device ".len()..];
    let (name, tail) = rest.split_once(' ')?;
    tail.starts_with("opened").then_some(name)
}

/// How a connect attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Connected,
    /// A failure marker line
    Failed(String),
    /// Output ended without a marker; trailing lines attached
    Exited(Vec<String>),
}

/// Forward lines from one stream into the merged channel
pub fn forward<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Handle to a running scanner
pub struct Scanner {
    pub outcome: oneshot::Receiver<Outcome>,
    pub interface: Arc<Mutex<Option<String>>>,
}

/// Start scanning the merged stream, mirroring it to `log_path`
pub fn spawn_scanner(mut rx: mpsc::UnboundedReceiver<String>, log_path: &Path) -> Scanner {
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let interface = Arc::new(Mutex::new(None));
    let interface_slot = interface.clone();
    let log_path = log_path.to_path_buf();

    tokio::spawn(async move {
        let mut log = match File::create(&log_path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Cannot write OpenVPN log {}: {}", log_path.display(), e);
                None
            }
        };

        let mut outcome_tx = Some(outcome_tx);
        let mut trailing: VecDeque<String> = VecDeque::with_capacity(TRAILING_LINES);

        while let Some(line) = rx.recv().await {
            if let Some(file) = log.as_mut() {
                let _ = file.write_all(format!("{}\n", line).as_bytes()).await;
            }

            if let Some(name) = opened_device(&line) {
                debug!("OpenVPN opened device {}", name);
                *interface_slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(name.to_string());
            }

            if trailing.len() == TRAILING_LINES {
                trailing.pop_front();
            }
            trailing.push_back(line.clone());

            if outcome_tx.is_none() {
                continue;
            }
            let resolved = match classify(&line) {
                Some(Marker::Connected) => Outcome::Connected,
                Some(Marker::Failed) => Outcome::Failed(line),
                None => continue,
            };
            if let Some(tx) = outcome_tx.take() {
                let _ = tx.send(resolved);
            }
        }

        if let Some(tx) = outcome_tx {
            let _ = tx.send(Outcome::Exited(trailing.into_iter().collect()));
        }
        if let Some(mut file) = log {
            let _ = file.flush().await;
        }
    });

    Scanner {
        outcome: outcome_rx,
        interface,
    }
}
