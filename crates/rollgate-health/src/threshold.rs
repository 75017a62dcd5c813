//! Dead-instance threshold.
//!
//! An instance is dead when any of its engine replicas is unreachable,
//! answers `timeout`, or has no data loaded. The fleet fails when
//! `dead / total` is strictly greater than the configured threshold.

use std::fmt;

use rollgate_core::Instance;
use tracing::{info, warn};

use crate::error::{HealthError, HealthResult};
use crate::source::StatusSource;
use crate::status::is_dead;

/// Overall fleet health after a rollout.
#[derive(Debug, Clone, PartialEq)]
pub enum FleetOutcome {
    FullyHealthy { total: usize },
    /// Some instances are dead but no more than the threshold allows.
    Degraded { dead: Vec<String>, total: usize },
    ThresholdExceeded { dead: Vec<String>, total: usize, threshold: f64 },
}

impl FleetOutcome {
    /// Judge `dead` out of `total` against `threshold`.
    pub fn evaluate(dead: Vec<String>, total: usize, threshold: f64) -> Self {
        if dead.is_empty() || total == 0 {
            return FleetOutcome::FullyHealthy { total };
        }
        let ratio = dead.len() as f64 / total as f64;
        if ratio > threshold {
            FleetOutcome::ThresholdExceeded {
                dead,
                total,
                threshold,
            }
        } else {
            FleetOutcome::Degraded { dead, total }
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, FleetOutcome::ThresholdExceeded { .. })
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_failure() { 1 } else { 0 }
    }

    /// `Err(ThresholdExceeded)` for a failed fleet, `Ok` otherwise.
    pub fn into_result(self) -> HealthResult<Self> {
        match self {
            FleetOutcome::ThresholdExceeded {
                dead,
                total,
                threshold,
            } => Err(HealthError::ThresholdExceeded {
                dead: dead.len(),
                total,
                threshold,
            }),
            other => Ok(other),
        }
    }
}

impl fmt::Display for FleetOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetOutcome::FullyHealthy { total } => write!(f, "fully healthy ({total} instances)"),
            FleetOutcome::Degraded { dead, total } => write!(
                f,
                "degraded but under threshold ({}/{total} dead: {})",
                dead.len(),
                dead.join(", ")
            ),
            FleetOutcome::ThresholdExceeded {
                dead,
                total,
                threshold,
            } => write!(
                f,
                "threshold exceeded ({}/{total} dead, threshold {threshold}: {})",
                dead.len(),
                dead.join(", ")
            ),
        }
    }
}

/// Query every replica of every instance and evaluate the fleet.
pub async fn evaluate_fleet<'a>(
    source: &dyn StatusSource,
    instances: impl IntoIterator<Item = &'a Instance>,
    threshold: f64,
) -> FleetOutcome {
    let mut dead = Vec::new();
    let mut total = 0;
    for instance in instances {
        total += 1;
        for host in &instance.engine_hosts {
            let report = source.engine_status(host, &instance.name).await.ok();
            if is_dead(report.as_ref()) {
                warn!(instance = %instance.name, %host, "dead instance replica");
                dead.push(instance.name.clone());
                break;
            }
        }
    }
    let outcome = FleetOutcome::evaluate(dead, total, threshold);
    info!(%outcome, "fleet health evaluated");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ScriptedStatusSource;
    use crate::status::StatusReport;
    use rollgate_core::{DeploymentContext, Host, InstanceDecl, Role, RoleTable};

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("i{i}")).collect()
    }

    #[test]
    fn four_of_twenty_exceeds_fifteen_percent() {
        let outcome = FleetOutcome::evaluate(names(4), 20, 0.15);
        assert!(outcome.is_failure());
        assert_eq!(outcome.exit_code(), 1);
        assert!(matches!(
            outcome.into_result(),
            Err(HealthError::ThresholdExceeded { dead: 4, total: 20, .. })
        ));
    }

    #[test]
    fn three_of_twenty_sits_on_the_boundary_and_passes() {
        let outcome = FleetOutcome::evaluate(names(3), 20, 0.15);
        assert!(matches!(outcome, FleetOutcome::Degraded { .. }));
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn no_dead_is_fully_healthy() {
        let outcome = FleetOutcome::evaluate(Vec::new(), 20, 0.0);
        assert_eq!(outcome, FleetOutcome::FullyHealthy { total: 20 });
    }

    #[test]
    fn zero_threshold_fails_on_any_dead() {
        assert!(FleetOutcome::evaluate(names(1), 20, 0.0).is_failure());
    }

    #[tokio::test]
    async fn instance_counts_once_even_with_several_dead_replicas() {
        let mut roles = RoleTable::new();
        roles.set(Role::Eng, vec![Host::from("root@e1"), Host::from("root@e2")]);
        let ctx = DeploymentContext::for_roles("test", roles);
        let instances: Vec<Instance> = ["a", "b"]
            .iter()
            .map(|n| Instance::resolve(&InstanceDecl::new(n, "pw"), &ctx).unwrap())
            .collect();

        let source = ScriptedStatusSource::new(Some(StatusReport::running(true)));
        source.script_engine(&Host::from("root@e1"), "a", vec![None]);
        source.script_engine(&Host::from("root@e2"), "a", vec![Some(StatusReport::with_status("timeout"))]);

        let outcome = evaluate_fleet(&source, &instances, 0.15).await;
        match outcome {
            FleetOutcome::ThresholdExceeded { dead, total, .. } => {
                assert_eq!(dead, vec!["a".to_string()]);
                assert_eq!(total, 2);
            }
            other => panic!("unexpected {other}"),
        }
    }
}
