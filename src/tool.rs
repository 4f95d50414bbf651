// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External command execution.
//!
//! PKI and archive work is delegated to external tools (`easyrsa`, `openssl`,
//! `tar`). They are reached only through the [`CommandRunner`] trait so tests
//! can script their behavior.
//!
//! Commands are spawned directly with an argument vector, never through a
//! shell, so identities and paths are not subject to shell interpretation.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> vpn_control_plane::Result<()> {
//! use std::time::Duration;
//! use vpn_control_plane::tool::{run_checked, CommandSpec, ProcessRunner};
//!
//! let runner = ProcessRunner::new(Duration::from_secs(60));
//! let spec = CommandSpec::new("easyrsa")
//!     .args(["--batch", "gen-crl"])
//!     .current_dir("/mnt/easyrsa");
//! let output = run_checked(&runner, &spec).await?;
//! println!("{}", output.stdout);
//! # Ok(())
//! # }
//! ```

use crate::error::{ControlPlaneError, Result};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Type alias for boxed async futures (keeps collaborator traits object safe).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A command to run: program, arguments, working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// `program arg1 arg2 ...`, for logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a finished command produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Command-execution collaborator.
///
/// `run` fails only when the command could not be run to completion (spawn
/// error, timeout). A non-zero exit is reported through
/// [`CommandOutput::status`]; use [`run_checked`] to turn it into an error.
pub trait CommandRunner: Send + Sync + 'static {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> BoxFuture<'a, CommandOutput>;
}

/// Run `spec` and fail with [`ControlPlaneError::ToolFailed`] on a non-zero exit.
pub async fn run_checked<R>(runner: &R, spec: &CommandSpec) -> Result<CommandOutput>
where
    R: CommandRunner + ?Sized,
{
    let output = runner.run(spec).await?;
    if output.success() {
        debug!(command = %spec.display(), "Command succeeded");
        Ok(output)
    } else {
        warn!(
            command = %spec.display(),
            status = ?output.status,
            stderr = %output.stderr.trim(),
            "Command failed"
        );
        Err(ControlPlaneError::ToolFailed {
            tool: spec.program.clone(),
            status: output.status,
            message: output.stderr.trim().to_string(),
        })
    }
}

/// Runs commands as child processes with a per-command timeout.
///
/// A timed-out child is killed.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for ProcessRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> BoxFuture<'a, CommandOutput> {
        Box::pin(async move {
            let mut command = Command::new(&spec.program);
            command.args(&spec.args);
            if let Some(dir) = &spec.cwd {
                command.current_dir(dir);
            }
            command.stdin(Stdio::null());
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
            command.kill_on_drop(true);

            let child = command.spawn().map_err(|e| ControlPlaneError::ToolFailed {
                tool: spec.program.clone(),
                status: None,
                message: format!("failed to spawn: {}", e),
            })?;

            match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => Ok(CommandOutput {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                }),
                Ok(Err(e)) => Err(ControlPlaneError::ToolFailed {
                    tool: spec.program.clone(),
                    status: None,
                    message: format!("failed to wait: {}", e),
                }),
                Err(_) => Err(ControlPlaneError::Timeout {
                    operation: spec.display(),
                    elapsed: self.timeout,
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("easyrsa")
            .arg("--batch")
            .args(["build-client-full", "alice", "nopass"])
            .current_dir("/mnt/easyrsa");
        assert_eq!(spec.display(), "easyrsa --batch build-client-full alice nopass");
        assert_eq!(spec.cwd, Some(PathBuf::from("/mnt/easyrsa")));
    }

    #[test]
    fn test_output_success() {
        let ok = CommandOutput {
            status: Some(0),
            ..Default::default()
        };
        assert!(ok.success());
        assert!(!CommandOutput::default().success());
        let failed = CommandOutput {
            status: Some(2),
            ..Default::default()
        };
        assert!(!failed.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let output = runner
            .run(&CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2"]))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_checked_reports_exit_status() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let err = run_checked(&runner, &CommandSpec::new("sh").args(["-c", "echo bad >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            ControlPlaneError::ToolFailed { tool, status, message } => {
                assert_eq!(tool, "sh");
                assert_eq!(status, Some(3));
                assert_eq!(message, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = ProcessRunner::new(Duration::from_secs(5));
        let err = runner
            .run(&CommandSpec::new("definitely-not-a-real-binary-xyz"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::ToolFailed { status: None, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_command() {
        let runner = ProcessRunner::new(Duration::from_millis(100));
        let err = runner
            .run(&CommandSpec::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Timeout { .. }));
    }
}
