//! Logging
//!
//! Compact `tracing` output on stderr. The front end can pause output while
//! it owns the terminal (e.g. a connect spinner); events emitted while
//! paused are dropped, not buffered.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

static PAUSED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
///
/// Calling this twice is harmless; the second call does nothing.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(filter_fn(|_| !is_paused()));

    let _ = tracing_subscriber::registry().with(filter).with(fmt).try_init();
}

/// Stop writing log events
pub fn pause() {
    PAUSED.store(true, Ordering::SeqCst);
}

/// Resume writing log events
pub fn resume() {
    PAUSED.store(false, Ordering::SeqCst);
}

pub fn is_paused() -> bool {
    PAUSED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_resume() {
        init("debug");
        assert!(!is_paused());
        pause();
        assert!(is_paused());
        tracing::info!("dropped while paused");
        resume();
        assert!(!is_paused());
    }
}
