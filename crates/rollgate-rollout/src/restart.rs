//! Engine restart pass.

use std::sync::Arc;
use std::time::Duration;

use rollgate_core::{Host, Instance, ServiceSettings};
use rollgate_exec::{EnsureOptions, ServiceController, ServiceState};
use rollgate_health::{StatusSource, wait_until_loaded};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::RolloutResult;

/// What a restart pass did.
#[derive(Debug, Clone, Default)]
pub struct RestartSummary {
    /// `(instance, host)` pairs restarted.
    pub restarted: Vec<(String, Host)>,
    /// `(instance, host)` pairs that did not report loaded data in time.
    pub not_loaded: Vec<(String, Host)>,
    pub elapsed: Duration,
}

impl RestartSummary {
    pub fn all_loaded(&self) -> bool {
        self.not_loaded.is_empty()
    }
}

/// Restarts the engines of every included instance on a set of hosts.
pub struct EngineRestarter {
    controller: Arc<ServiceController>,
    status: Arc<dyn StatusSource>,
    services: ServiceSettings,
}

impl EngineRestarter {
    pub fn new(
        controller: Arc<ServiceController>,
        status: Arc<dyn StatusSource>,
        services: ServiceSettings,
    ) -> Self {
        Self {
            controller,
            status,
            services,
        }
    }

    /// Ensure the monitor web server runs on each of `hosts`, then stop and
    /// start every included instance served there. With `wait`, poll each
    /// restarted engine until it reports its data loaded.
    pub async fn restart_all(
        &self,
        instances: &[Instance],
        hosts: &[Host],
        wait: bool,
    ) -> RolloutResult<RestartSummary> {
        let start = Instant::now();
        let mut summary = RestartSummary::default();

        let web = EnsureOptions::new(self.services.web_server_start)
            .only_once(self.services.web_server_start_only_once)
            .raising(true);
        for host in hosts {
            self.controller
                .ensure_state(host, &self.services.web_server, ServiceState::Started, web)
                .await?;
        }

        let stop = EnsureOptions::new(self.services.stop_start).only_once(true);
        let start_opts = EnsureOptions::new(self.services.stop_start)
            .only_once(self.services.engine_start_only_once);
        for instance in instances.iter().filter(|i| !i.excluded) {
            let service = instance.service_name();
            for host in instance.engine_hosts.iter().filter(|h| hosts.contains(h)) {
                let ok = self.controller.restart(host, &service, stop, start_opts).await?;
                if !ok {
                    warn!(instance = %instance.name, %host, "engine did not confirm restart");
                }
                summary.restarted.push((instance.name.clone(), host.clone()));
            }
        }

        if wait {
            for (name, host) in &summary.restarted {
                match wait_until_loaded(self.status.as_ref(), host, name, &self.services.engine_load).await {
                    Ok(_) => info!(instance = %name, %host, "engine loaded"),
                    Err(e) => {
                        warn!(instance = %name, %host, error = %e, "engine not loaded in time");
                        summary.not_loaded.push((name.clone(), host.clone()));
                    }
                }
            }
        }

        summary.elapsed = start.elapsed();
        info!(
            restarted = summary.restarted.len(),
            not_loaded = summary.not_loaded.len(),
            secs = summary.elapsed.as_secs(),
            "engine restart pass finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_core::{DeploymentContext, InstanceDecl, RetryPolicy, Role, RoleTable};
    use rollgate_exec::{RecordingExecutor, ServiceManager};
    use rollgate_health::{ScriptedStatusSource, StatusReport};

    fn setup() -> (Vec<Instance>, Vec<Host>) {
        let hosts = vec![Host::from("root@e1"), Host::from("root@e2")];
        let mut roles = RoleTable::new();
        roles.set(Role::Eng, hosts.clone());
        let ctx = DeploymentContext::for_roles("t", roles);
        let a = Instance::resolve(&InstanceDecl::new("a", "pw"), &ctx).unwrap();
        let b = Instance::resolve(&InstanceDecl::new("b", "pw"), &ctx).unwrap();
        (vec![a, b], hosts)
    }

    fn services() -> ServiceSettings {
        let quick = RetryPolicy::new(2_000, 500);
        ServiceSettings {
            stop_start: quick,
            web_server_start: quick,
            engine_load: RetryPolicy::new(3_000, 1_000),
            ..ServiceSettings::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_included_instances_on_selected_hosts() {
        let (mut instances, hosts) = setup();
        instances[1].excluded = true;
        let exec = Arc::new(RecordingExecutor::simulating_services());
        let controller = Arc::new(ServiceController::new(exec.clone(), ServiceManager::SysV));
        let status = Arc::new(ScriptedStatusSource::new(Some(StatusReport::running(true))));
        let restarter = EngineRestarter::new(controller, status, services());

        let summary = restarter.restart_all(&instances, &hosts[..1], false).await.unwrap();
        assert_eq!(summary.restarted, vec![("a".to_string(), hosts[0].clone())]);
        assert_eq!(exec.count("service apache2 start"), 1);
        assert_eq!(exec.count("service kraken_a start"), 1);
        assert_eq!(exec.count("kraken_b"), 0);
        assert!(exec.is_running(&hosts[0], "kraken_a"));
    }

    #[tokio::test(start_paused = true)]
    async fn web_server_started_once_per_host_per_run() {
        let (instances, hosts) = setup();
        let exec = Arc::new(RecordingExecutor::simulating_services());
        let controller = Arc::new(ServiceController::new(exec.clone(), ServiceManager::SysV));
        let status = Arc::new(ScriptedStatusSource::new(Some(StatusReport::running(true))));
        let restarter = EngineRestarter::new(controller, status, services());

        restarter.restart_all(&instances, &hosts, false).await.unwrap();
        restarter.restart_all(&instances, &hosts, false).await.unwrap();
        assert_eq!(exec.count("service apache2 start"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_engines_are_reported_not_loaded() {
        let (instances, hosts) = setup();
        let exec = Arc::new(RecordingExecutor::simulating_services());
        let controller = Arc::new(ServiceController::new(exec, ServiceManager::SysV));
        let status = Arc::new(ScriptedStatusSource::new(Some(StatusReport::running(true))));
        status.script_engine(&hosts[1], "b", vec![Some(StatusReport::running(false))]);
        let restarter = EngineRestarter::new(controller, status, services());

        let summary = restarter.restart_all(&instances, &hosts, true).await.unwrap();
        assert_eq!(summary.restarted.len(), 4);
        assert_eq!(summary.not_loaded, vec![("b".to_string(), hosts[1].clone())]);
        assert!(!summary.all_loaded());
    }
}
