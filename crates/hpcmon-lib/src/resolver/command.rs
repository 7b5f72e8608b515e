//! External command execution with a deadline

use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::trace;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("{command} timed out after {}s", timeout.as_secs_f64())]
    Timeout { command: String, timeout: Duration },
    #[error("{command} exited with status {status:?}: {stderr}")]
    Failed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("failed to run {command}: {message}")]
    Io { command: String, message: String },
}

/// Runs a program and returns its stdout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String, CommandError>;
}

/// Production runner over `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessCommandRunner;

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String, CommandError> {
        trace!(program, ?args, "Running command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Err(_) => {
                return Err(CommandError::Timeout {
                    command: program.to_string(),
                    timeout,
                })
            }
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(CommandError::NotFound(program.to_string()))
            }
            Ok(Err(e)) => {
                return Err(CommandError::Io {
                    command: program.to_string(),
                    message: e.to_string(),
                })
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            return Err(CommandError::Failed {
                command: program.to_string(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
