//! Starting and stopping the board-side servers over a remote shell.
//!
//! The board runs its fast-control, data-sink and slow-control servers as
//! ordinary processes. [`ServerControl`] issues the configured start/stop
//! command lines through any [`RemoteShell`]; [`SshShell`] is the production
//! implementation and shells out to the system `ssh` client.

use crate::config::RemoteConfig;
use crate::error::{AppResult, DaqError};
use std::process::{Command, Stdio};
use tracing::{debug, info, instrument};

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Exit status; `None` when the process was killed by a signal
    pub status: Option<i32>,
}

impl ShellOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Executes a command line on the board host.
pub trait RemoteShell: Send + Sync {
    /// Run `command` to completion and capture its output.
    fn run(&self, command: &str) -> AppResult<ShellOutput>;
}

/// [`RemoteShell`] backed by the system `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshShell {
    host: String,
    user: Option<String>,
    program: String,
}

impl SshShell {
    /// Shell on `host`, logging in as `user` when given.
    pub fn new(host: impl Into<String>, user: Option<String>) -> Self {
        Self {
            host: host.into(),
            user,
            program: "ssh".to_string(),
        }
    }

    /// Use a different client binary (e.g. a wrapper script).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// `user@host`, or just `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl RemoteShell for SshShell {
    fn run(&self, command: &str) -> AppResult<ShellOutput> {
        debug!(destination = %self.destination(), command, "running remote command");
        let output = Command::new(&self.program)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(self.destination())
            .arg(command)
            .stdin(Stdio::null())
            .output()?;
        Ok(ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code(),
        })
    }
}

/// Issues the configured start/stop commands for the board servers.
pub struct ServerControl {
    shell: Box<dyn RemoteShell>,
    start_command: String,
    stop_command: String,
}

impl std::fmt::Debug for ServerControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerControl")
            .field("start_command", &self.start_command)
            .field("stop_command", &self.stop_command)
            .finish_non_exhaustive()
    }
}

impl ServerControl {
    /// Control through an arbitrary shell.
    pub fn new(
        shell: Box<dyn RemoteShell>,
        start_command: impl Into<String>,
        stop_command: impl Into<String>,
    ) -> Self {
        Self {
            shell,
            start_command: start_command.into(),
            stop_command: stop_command.into(),
        }
    }

    /// Control over ssh as described by the `[remote]` section.
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(
            Box::new(SshShell::new(config.host.clone(), config.user.clone())),
            config.start_command.clone(),
            config.stop_command.clone(),
        )
    }

    /// Start the board servers.
    #[instrument(skip(self), err)]
    pub fn start(&self) -> AppResult<String> {
        self.execute(&self.start_command)
    }

    /// Stop the board servers.
    #[instrument(skip(self), err)]
    pub fn stop(&self) -> AppResult<String> {
        self.execute(&self.stop_command)
    }

    fn execute(&self, command: &str) -> AppResult<String> {
        let output = self.shell.run(command)?;
        if !output.success() {
            return Err(DaqError::Remote {
                command: command.to_string(),
                stderr: match output.status {
                    Some(code) => format!("exit status {}: {}", code, output.stderr.trim()),
                    None => format!("terminated by signal: {}", output.stderr.trim()),
                },
            });
        }
        info!(command, "remote command completed");
        Ok(output.stdout)
    }
}
