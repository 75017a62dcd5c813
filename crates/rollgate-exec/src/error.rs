//! Error types for command execution and service control.

use thiserror::Error;

/// Result type alias for execution operations.
pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The command ran and exited non-zero.
    #[error("`{command}` on {host} exited with {code}: {stderr}")]
    Command {
        host: String,
        command: String,
        code: i32,
        stderr: String,
    },

    /// The command could not be started at all.
    #[error("cannot run `{command}` on {host}: {source}")]
    Spawn {
        host: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` on {host} timed out")]
    Timeout { host: String, command: String },

    /// A service never reached the requested state.
    #[error("service {service} {action} on {host} failed: {reason}")]
    ServiceState {
        service: String,
        host: String,
        action: String,
        reason: String,
    },

    #[error("rendering {template} to {destination} on {host} failed: {reason}")]
    Template {
        host: String,
        template: String,
        destination: String,
        reason: String,
    },

    #[error("task {task} failed on {host}: {reason}")]
    Task {
        task: String,
        host: String,
        reason: String,
    },

    #[error(transparent)]
    Core(#[from] rollgate_core::CoreError),
}
