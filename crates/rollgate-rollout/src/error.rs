//! Error types for rollouts and the procedures around them.

use thiserror::Error;

/// Result type alias for rollout operations.
pub type RolloutResult<T> = Result<T, RolloutError>;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("load balancer failed to {action} {node}: {reason}")]
    Balancer {
        action: String,
        node: String,
        reason: String,
    },

    #[error("operator did not confirm: {0}")]
    NotConfirmed(String),

    #[error("verification failed on {host} for {instance}: {reason}")]
    Verification {
        host: String,
        instance: String,
        reason: String,
    },

    #[error("checksum mismatch between {original} and {copy} on {host}")]
    Checksum {
        host: String,
        original: String,
        copy: String,
    },

    #[error("{path} does not exist on {host}")]
    MissingFile { host: String, path: String },

    #[error(transparent)]
    Core(#[from] rollgate_core::CoreError),

    #[error(transparent)]
    Exec(#[from] rollgate_exec::ExecError),

    #[error(transparent)]
    Health(#[from] rollgate_health::HealthError),

    #[error(transparent)]
    Batch(#[from] rollgate_batch::BatchError),
}

impl RolloutError {
    /// Whether the failure comes from configuration rather than the fleet.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RolloutError::Core(rollgate_core::CoreError::Configuration(_))
                | RolloutError::Exec(rollgate_exec::ExecError::Core(
                    rollgate_core::CoreError::Configuration(_)
                ))
        )
    }
}
