//! Platform selection
//!
//! The configurator picks one backend per capability when it is built.
//! This is the only place that looks at the target OS.

/// Host network tooling family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Linux and other unix-likes with iproute2 and `/etc/resolv.conf`
    Unix,
    /// Windows with `route` and `netsh`
    Windows,
}

impl Platform {
    /// Platform of the running process
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// Check whether the process may reconfigure network interfaces
#[cfg(unix)]
pub fn is_elevated() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Check whether the process may reconfigure network interfaces
///
/// `net session` only succeeds from an elevated shell.
#[cfg(windows)]
pub fn is_elevated() -> bool {
    std::process::Command::new("net")
        .arg("session")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Validate an interface name before it reaches a command line
pub fn valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
