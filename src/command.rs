// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External command execution.
//!
//! A handful of settings have no kernel file behind them, e.g., the desktop
//! compositor or vendor GPU drivers. Tunables for those settings shell out to
//! a vendor tool instead. Vendor tools can hang, so every invocation is
//! bounded by a timeout, and a command that runs past it is killed and
//! reported as a failure.

use std::{
    ffi::OsString,
    io::Read,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, instrument};

/// Run external commands on behalf of tunables.
pub trait CommandRunner: Send + Sync + 'static {
    /// Run command to completion, returning its trimmed standard output.
    ///
    /// # Errors
    ///
    /// - Return [`CommandError`] if the command cannot be spawned, exits
    ///   unsuccessfully, or runs longer than the runner allows.
    fn run(&self, program: &str, args: &[String]) -> Result<String>;

    /// Check if program can be found on the search path.
    fn available(&self, program: &str) -> bool;
}

/// Command runner backed by real processes.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    /// Construct new runner that kills commands after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl CommandRunner for SystemRunner {
    #[instrument(skip(self), level = "debug")]
    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| CommandError::Spawn {
                source: err,
                program: program.into(),
            })?;

        // INVARIANT: Pipes drain while the command runs, a full pipe must
        //   never stall a command into its timeout.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().map_err(|err| CommandError::Spawn {
                source: err,
                program: program.into(),
            })? {
                break status;
            }

            if started.elapsed() >= self.timeout {
                // INVARIANT: Never leave a hung vendor tool behind.
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandError::Timeout {
                    program: program.into(),
                    timeout: self.timeout,
                });
            }

            thread::sleep(Duration::from_millis(10));
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        debug!("{program} exited with {status}");

        if !status.success() {
            return Err(CommandError::Failed {
                program: program.into(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(stdout.trim().to_string())
    }

    fn available(&self, program: &str) -> bool {
        let Some(search_path) = std::env::var_os("PATH") else {
            return false;
        };

        std::env::split_paths(&search_path).any(|dir| dir.join(program).is_file())
    }
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buffer);
        }
        buffer
    })
}

/// External command error types.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Command cannot be spawned or waited on.
    #[error("failed to run {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: OsString,
    },

    /// Command exited unsuccessfully.
    #[error("command {program:?} failed: {message}")]
    Failed { program: OsString, message: String },

    /// Command did not finish in time and was killed.
    #[error("command {program:?} timed out after {timeout:?}")]
    Timeout { program: OsString, timeout: Duration },
}

/// Friendly result alias :3
pub type Result<T, E = CommandError> = std::result::Result<T, E>;
