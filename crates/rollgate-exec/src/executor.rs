//! The command-execution boundary.
//!
//! Everything rollgate does on a host goes through [`CommandExecutor::run`]:
//! a command string in, exit code and captured output back. How the
//! command reaches the host is up to the implementation.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rollgate_core::Host;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ExecError, ExecResult};

/// Captured result of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn from_process(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Runs commands on hosts.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` on `host`. A non-zero exit is not an error here.
    async fn run(&self, host: &Host, command: &str) -> ExecResult<CommandOutput>;

    /// Run `command` on `host` and fail unless it exits 0.
    async fn run_checked(&self, host: &Host, command: &str) -> ExecResult<CommandOutput> {
        let output = self.run(host, command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ExecError::Command {
                host: host.to_string(),
                command: command.to_string(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs commands through the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: String,
    options: Vec<String>,
    timeout: Option<Duration>,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "ConnectTimeout=10".to_string(),
            ],
            timeout: None,
        }
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands still running after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn with_option(mut self, option: &str) -> Self {
        self.options.push("-o".to_string());
        self.options.push(option.to_string());
        self
    }

    fn command(&self, host: &Host, command: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.options)
            .arg(host.as_str())
            .arg("--")
            .arg(command)
            .stdin(Stdio::null());
        cmd
    }
}

/// Wait for `cmd` to finish, killing it past `limit`.
async fn output_within(
    mut cmd: Command,
    limit: Option<Duration>,
    host: &Host,
    command: &str,
) -> ExecResult<CommandOutput> {
    cmd.kill_on_drop(true);
    let child = cmd.output();
    let output = match limit {
        Some(limit) => tokio::time::timeout(limit, child).await.map_err(|_| ExecError::Timeout {
            host: host.to_string(),
            command: command.to_string(),
        })?,
        None => child.await,
    }
    .map_err(|source| ExecError::Spawn {
        host: host.to_string(),
        command: command.to_string(),
        source,
    })?;
    Ok(CommandOutput::from_process(output))
}

#[async_trait]
impl CommandExecutor for SshExecutor {
    async fn run(&self, host: &Host, command: &str) -> ExecResult<CommandOutput> {
        debug!(%host, %command, "ssh");
        output_within(self.command(host, command), self.timeout, host, command).await
    }
}

/// Runs commands on the local machine through `sh -c`, whatever the host.
///
/// Used for load-balancer scripts and single-box setups.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    timeout: Option<Duration>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands still running after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn run(&self, host: &Host, command: &str) -> ExecResult<CommandOutput> {
        debug!(%host, %command, "local");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).stdin(Stdio::null());
        output_within(cmd, self.timeout, host, command).await
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_leaves_plain_words() {
        assert_eq!(shell_quote("kraken_fr-idf"), "kraken_fr-idf");
        assert_eq!(shell_quote("/srv/ed/data"), "/srv/ed/data");
    }

    #[test]
    fn quote_wraps_and_escapes() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn ssh_command_line() {
        let exec = SshExecutor::new().with_option("StrictHostKeyChecking=no");
        let cmd = exec.command(&Host::from("root@e1"), "service kraken_a status");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args.last().map(String::as_str), Some("service kraken_a status"));
        assert!(args.contains(&"root@e1".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
    }

    #[tokio::test]
    async fn local_executor_captures_output() {
        let out = LocalExecutor::new()
            .run(&Host::from("localhost"), "echo hello; echo oops >&2; exit 3")
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn run_checked_rejects_non_zero() {
        let err = LocalExecutor::new()
            .run_checked(&Host::from("localhost"), "exit 2")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Command { code: 2, .. }));
    }

    #[tokio::test]
    async fn slow_command_is_killed_at_the_timeout() {
        let exec = LocalExecutor::new().with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = exec.run(&Host::from("localhost"), "sleep 5").await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
