//! Instance health checks against the engine monitors.

use rollgate_core::{Host, Instance, RetryPolicy};
use tracing::{info, warn};

use crate::error::{HealthError, HealthResult, PollError};
use crate::poll::poll_until_ready;
use crate::source::StatusSource;
use crate::status::{InstanceHealth, Readiness, StatusReport};

/// Result of checking one instance on one engine host.
#[derive(Debug, Clone)]
pub struct HostHealth {
    pub host: Host,
    pub health: InstanceHealth,
    pub report: Option<StatusReport>,
}

/// Query every engine replica of `instance` once and classify the answers.
pub async fn check_instance(
    source: &dyn StatusSource,
    instance: &Instance,
    expect_loaded: bool,
) -> Vec<HostHealth> {
    let mut results = Vec::with_capacity(instance.engine_hosts.len());
    for host in &instance.engine_hosts {
        let entry = match source.engine_status(host, &instance.name).await {
            Ok(report) => HostHealth {
                host: host.clone(),
                health: InstanceHealth::classify(&report, expect_loaded),
                report: Some(report),
            },
            Err(e) => HostHealth {
                host: host.clone(),
                health: InstanceHealth::Unreachable(e.to_string()),
                report: None,
            },
        };
        results.push(entry);
    }
    results
}

/// Check `instance` and turn any problem into an error or a warning.
///
/// Returns `Ok(true)` when every replica is healthy. With `fail_on_error`
/// unset, problems are logged and `Ok(false)` is returned.
pub async fn verify_instance(
    source: &dyn StatusSource,
    instance: &Instance,
    expect_loaded: bool,
    fail_on_error: bool,
) -> HealthResult<bool> {
    let results = check_instance(source, instance, expect_loaded).await;
    let mut problems = Vec::new();
    for r in &results {
        if r.health.is_ok() {
            info!(instance = %instance.name, host = %r.host, "instance ok");
        } else {
            warn!(instance = %instance.name, host = %r.host, health = %r.health, "instance check failed");
            problems.push(format!("{}: {}", r.host, r.health));
        }
    }
    if problems.is_empty() {
        return Ok(true);
    }
    if fail_on_error {
        return Err(HealthError::Unhealthy {
            instance: instance.name.clone(),
            reason: problems.join("; "),
        });
    }
    Ok(false)
}

/// Poll the engine monitor on `host` until `instance` reports its data loaded.
pub async fn wait_until_loaded(
    source: &dyn StatusSource,
    host: &Host,
    instance: &str,
    policy: &RetryPolicy,
) -> Result<StatusReport, PollError<StatusReport>> {
    poll_until_ready(
        policy,
        || source.engine_status(host, instance),
        |r| Readiness::Loaded.accepts(r),
    )
    .await
}
