//! OS Command Execution
//!
//! Every mutation of routing tables, interface addresses and DNS settings
//! goes through a [`CommandRunner`]. The system runner shells out to the
//! platform tooling (`ip`, `route`, `netsh`); tests substitute a recorder.

use crate::error::NetworkError;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// Runs an external program and returns its standard output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`. A non-zero exit status is an error
    /// carrying the combined output.
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, NetworkError>;
}

/// Runner backed by real subprocesses
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, NetworkError> {
        let command = render(program, args);
        debug!("exec: {}", command);

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| NetworkError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}{}", stdout, stderr).trim().to_string();
        Err(NetworkError::CommandFailed {
            command,
            output: if combined.is_empty() {
                output.status.to_string()
            } else {
                combined
            },
        })
    }
}

/// Render a command line for logs and error messages
pub fn render(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every command and answers from a table of canned outputs.
    #[derive(Default)]
    pub struct RecordingRunner {
        pub calls: Mutex<Vec<String>>,
        responses: Vec<(String, Result<String, String>)>,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer commands starting with `prefix` with `stdout`
        pub fn respond(mut self, prefix: &str, stdout: &str) -> Self {
            self.responses.push((prefix.to_string(), Ok(stdout.to_string())));
            self
        }

        /// Fail commands starting with `prefix`
        pub fn fail(mut self, prefix: &str, output: &str) -> Self {
            self.responses.push((prefix.to_string(), Err(output.to_string())));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<String, NetworkError> {
            let command = render(program, args);
            self.calls.lock().unwrap().push(command.clone());

            for (prefix, response) in &self.responses {
                if command.starts_with(prefix.as_str()) {
                    return response.clone().map_err(|output| NetworkError::CommandFailed {
                        command: command.clone(),
                        output,
                    });
                }
            }
            Ok(String::new())
        }
    }
}
