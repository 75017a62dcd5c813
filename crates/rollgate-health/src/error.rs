//! Error types for polling, probing, and fleet health evaluation.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for health operations.
pub type HealthResult<T> = Result<T, HealthError>;

/// Errors raised while probing an endpoint or judging fleet health.
#[derive(Debug, Error)]
pub enum HealthError {
    /// The endpoint could not be reached or did not answer in time.
    #[error("probe of {uri} failed: {reason}")]
    Unreachable { uri: String, reason: String },

    /// The endpoint answered with a non-2xx status.
    #[error("probe of {uri} returned HTTP {status}")]
    Status { uri: String, status: u16 },

    /// The body was not the expected JSON document.
    #[error("cannot decode response of {uri}: {reason}")]
    Decode { uri: String, reason: String },

    /// An instance did not reach the expected state.
    #[error("instance {instance} is unhealthy: {reason}")]
    Unhealthy { instance: String, reason: String },

    /// Too many instances are dead after a rollout.
    #[error("{dead}/{total} instances dead, above threshold {threshold}")]
    ThresholdExceeded {
        dead: usize,
        total: usize,
        threshold: f64,
    },

    #[error(transparent)]
    Core(#[from] rollgate_core::CoreError),
}

/// Failure of a bounded-retry poll.
///
/// `RetryExhausted` carries the last successful observation, which is
/// absent when every probe itself failed.
#[derive(Debug, Error)]
pub enum PollError<T: std::fmt::Debug> {
    #[error("not ready after {attempts} attempts in {elapsed:?} (last observation: {last:?})")]
    RetryExhausted {
        last: Option<T>,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("probe failed on attempt {attempt}: {reason}")]
    ProbeFailed { attempt: u32, reason: String },
}

impl<T: std::fmt::Debug> PollError<T> {
    /// The last observation, if any probe succeeded.
    pub fn last(&self) -> Option<&T> {
        match self {
            PollError::RetryExhausted { last, .. } => last.as_ref(),
            PollError::ProbeFailed { .. } => None,
        }
    }
}
