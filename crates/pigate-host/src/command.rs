//! Child-process execution for collaborator tools.

use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::HostError;
use crate::traits::HostResult;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Full command line, for error messages.
    pub command: String,

    /// Exit code (-1 when terminated by a signal).
    pub status: i32,

    pub stdout: String,

    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Convert a non-zero exit into `HostError::CommandFailed`.
    pub fn check(self) -> HostResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(HostError::CommandFailed {
                command: self.command,
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run `program` with `args` and capture its output.
///
/// A non-zero exit is *not* an error here; callers that need one use
/// [`run_checked`]. Spawn failures are always errors.
pub async fn run(program: &str, args: &[&str]) -> HostResult<CommandOutput> {
    run_with_env(program, args, &[]).await
}

/// Like [`run`] with extra environment variables.
pub async fn run_with_env(
    program: &str,
    args: &[&str],
    envs: &[(&str, &str)],
) -> HostResult<CommandOutput> {
    let command = display_command(program, args);
    debug!(command = %command, "Running host command");

    let output = Command::new(program)
        .args(args)
        .envs(envs.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| HostError::Spawn {
            program: program.to_string(),
            source,
        })?;

    Ok(CommandOutput {
        command,
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run and require a zero exit status.
pub async fn run_checked(program: &str, args: &[&str]) -> HostResult<CommandOutput> {
    run(program, args).await?.check()
}

fn display_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
