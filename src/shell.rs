//! External command execution for the credential cache.
//!
//! The credential store never touches secrets storage itself: reading and
//! storing the access token, the device id and the password are all delegated
//! to user-configured shell commands (`pass show matrix`, `secret-tool ...`,
//! `cat ~/.cache/mpmc/token`, ...). This module runs them.

use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, trace};
use mockall::automock;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

/// Errors raised while running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The shell could not be started or its pipes could not be used.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// The command ran but exited with a non-zero status.
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    /// The command output is not valid UTF-8.
    #[error("`{command}` produced output that is not valid UTF-8")]
    InvalidOutput { command: String },
}

/// Runs external commands on behalf of the credential store.
///
/// Abstracted behind a trait so the session resolution can be tested without
/// spawning processes.
#[automock]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` and returns its standard output without the trailing newline.
    async fn read(&self, command: &str) -> Result<String, CommandError>;

    /// Runs `command` with `input` written to its standard input.
    async fn store(&self, command: &str, input: &str) -> Result<(), CommandError>;
}

/// [`CommandRunner`] backed by `sh -c`.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

impl ShellRunner {
    fn command(command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn read(&self, command: &str) -> Result<String, CommandError> {
        debug!("running read command");
        let output = Self::command(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                command: command.to_owned(),
                source,
            })?;

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: command.to_owned(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let stdout = String::from_utf8(output.stdout).map_err(|_| CommandError::InvalidOutput {
            command: command.to_owned(),
        })?;
        Ok(trim_newline(&stdout).to_owned())
    }

    async fn store(&self, command: &str, input: &str) -> Result<(), CommandError> {
        debug!("running store command");
        let spawn_error = |source| CommandError::Spawn {
            command: command.to_owned(),
            source,
        };

        let mut child = Self::command(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await.map_err(spawn_error)?;
            // Dropping stdin closes the pipe so the command sees end of input
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        if !output.status.success() {
            return Err(CommandError::Failed {
                command: command.to_owned(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        trace!("store command succeeded");
        Ok(())
    }
}

/// Removes every trailing line terminator, the way `rstrip("\n")` would.
pub fn trim_newline(value: &str) -> &str {
    value.trim_end_matches(['\n', '\r'])
}
