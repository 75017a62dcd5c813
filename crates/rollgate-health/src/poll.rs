//! Bounded-retry polling.
//!
//! [`poll_until_ready`] calls a probe immediately and then once per poll
//! interval until the readiness predicate holds or the next probe would
//! start past the deadline. Probe errors count as "not ready" unless the
//! policy is fail-fast.

use std::fmt;
use std::future::Future;

use rollgate_core::RetryPolicy;
use tokio::time::Instant;
use tracing::debug;

use crate::error::PollError;

/// Poll `probe` until `is_ready` accepts its result.
///
/// Returns the first ready observation. On timeout the error carries the
/// last successful observation.
pub async fn poll_until_ready<T, E, P, Fut, R>(
    policy: &RetryPolicy,
    mut probe: P,
    is_ready: R,
) -> Result<T, PollError<T>>
where
    T: fmt::Debug,
    E: fmt::Display,
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = policy.poll_interval();
    let mut attempts = 0u32;
    let mut last = None;

    loop {
        attempts += 1;
        match probe().await {
            Ok(observed) if is_ready(&observed) => {
                debug!(attempts, elapsed_ms = start.elapsed().as_millis() as u64, "ready");
                return Ok(observed);
            }
            Ok(observed) => {
                debug!(attempts, ?observed, "not ready yet");
                last = Some(observed);
            }
            Err(e) if policy.fail_fast => {
                return Err(PollError::ProbeFailed {
                    attempt: attempts,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                debug!(attempts, error = %e, "probe failed, retrying");
            }
        }

        let elapsed = start.elapsed();
        if elapsed + interval > policy.max_wait() {
            return Err(PollError::RetryExhausted {
                last,
                attempts,
                elapsed,
            });
        }
        tokio::time::sleep(interval).await;
    }
}
