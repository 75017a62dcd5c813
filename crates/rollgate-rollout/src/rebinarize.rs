//! Data-preparation tier: package upgrade and data rebuild pass.
//!
//! An upgrade stops the periodic scheduler, installs the data-preparation
//! packages on every data-preparation host and restarts the workers.
//!
//! Before the batch, instances are inspected: one whose engines have no
//! data and no data file is excluded, one whose engines are down although
//! its data file exists is reported as critical and kept. The batch then
//! runs one binarization job per instance on the data-preparation master,
//! with the periodic scheduler paused and the stall watchdog on.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rollgate_batch::{
    BatchOutcome, ConfirmationPort, ExecutorProcessSampler, JobPool, JobStatus, Watchdog, port_for,
};
use rollgate_core::{DeploymentContext, Host, InstanceRegistry, Role};
use rollgate_exec::{
    CommandExecutor, EnsureOptions, ServiceController, ServiceState, install_command, shell_quote,
};
use rollgate_health::{StatusSource, check_instance};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::RolloutResult;

/// What instance inspection found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    /// No data anywhere; skipped by the batch.
    pub excluded: Vec<String>,
    /// Engines down although a data file exists.
    pub critical: Vec<String>,
    /// No data-preparation directory yet.
    pub first_deploy: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RebinarizeReport {
    pub outcome: BatchOutcome,
    pub batch_elapsed: Duration,
    pub elapsed: Duration,
}

pub struct Rebinarizer {
    ctx: Arc<DeploymentContext>,
    controller: Arc<ServiceController>,
    status: Arc<dyn StatusSource>,
    confirmation: Arc<dyn ConfirmationPort>,
}

impl Rebinarizer {
    /// A rebinarizer asking for stall aborts the way the platform's
    /// watchdog settings say.
    pub fn new(
        ctx: Arc<DeploymentContext>,
        controller: Arc<ServiceController>,
        status: Arc<dyn StatusSource>,
    ) -> Self {
        let confirmation = port_for(ctx.batch.watchdog.on_stall);
        Self {
            ctx,
            controller,
            status,
            confirmation,
        }
    }

    pub fn with_confirmation(mut self, confirmation: Arc<dyn ConfirmationPort>) -> Self {
        self.confirmation = confirmation;
        self
    }

    fn executor(&self) -> Arc<dyn CommandExecutor> {
        self.controller.executor().clone()
    }

    fn master(&self) -> RolloutResult<Host> {
        Ok(self
            .ctx
            .first_host(Role::TyrMaster)
            .or_else(|_| self.ctx.first_host(Role::Tyr))?)
    }

    async fn exists(&self, host: &Host, test: &str, path: &str) -> RolloutResult<bool> {
        let output = self
            .executor()
            .run(host, &format!("test {test} {}", shell_quote(path)))
            .await?;
        Ok(output.success())
    }

    /// Upgrade the data-preparation packages and restart the workers. The
    /// scheduler is stopped first and only started again with
    /// `resume_scheduler`, so a following batch finds it paused.
    pub async fn upgrade_packages(&self, resume_scheduler: bool) -> RolloutResult<()> {
        let hosts = self.ctx.roles.hosts_for(&[Role::TyrMaster, Role::Tyr]);
        if hosts.is_empty() {
            warn!("no data-preparation host declared, package upgrade skipped");
            return Ok(());
        }
        let master = self.master()?;
        let services = &self.ctx.services;
        let stop_start = EnsureOptions::new(services.stop_start).raising(true);

        self.controller
            .ensure_state(&master, &services.scheduler_service, ServiceState::Stopped, stop_start)
            .await?;

        let command = install_command(&self.ctx.packages.tyr, &self.ctx.packages);
        for host in &hosts {
            self.executor().run_checked(host, &command).await?;
            info!(%host, packages = ?self.ctx.packages.tyr, "data-preparation packages installed");
        }
        for host in &hosts {
            self.controller
                .restart(host, &services.worker_service, stop_start, stop_start)
                .await?;
        }

        if resume_scheduler {
            let opts = stop_start.only_once(services.scheduler_start_only_once);
            self.controller
                .ensure_state(&master, &services.scheduler_service, ServiceState::Started, opts)
                .await?;
        }
        info!(hosts = hosts.len(), "data-preparation tier upgraded");
        Ok(())
    }

    /// Inspect every instance and flip its `excluded` and `first_deploy`
    /// flags. Runs before any job is handed to the pool.
    pub async fn discover(&self, registry: &mut InstanceRegistry) -> RolloutResult<Discovery> {
        let master = self.master()?;
        let mut found = Discovery::default();

        for name in registry.names() {
            let instance = registry.get(&name)?.clone();

            let down = check_instance(self.status.as_ref(), &instance, false)
                .await
                .into_iter()
                .find(|h| !h.health.is_ok());
            let mut excluded = false;
            if let Some(host_health) = down {
                let data_file = instance.data_file(&self.ctx.paths);
                if self.exists(&host_health.host, "-f", &data_file).await? {
                    error!(
                        instance = %name,
                        host = %host_health.host,
                        health = %host_health.health,
                        file = %data_file,
                        "instance not available but has a data file, inspect manually"
                    );
                    found.critical.push(name.clone());
                } else {
                    info!(instance = %name, "no data, excluded from the batch");
                    found.excluded.push(name.clone());
                    excluded = true;
                }
            }
            registry.set_excluded(&name, excluded)?;

            let first = !self.exists(&master, "-d", &instance.ed_dir(&self.ctx.paths)).await?;
            if first {
                info!(instance = %name, "first deployment");
                found.first_deploy.push(name.clone());
            }
            registry.set_first_deploy(&name, first)?;
        }
        Ok(found)
    }

    /// Binarize `jobs` with `parallelism` workers. The scheduler, when
    /// piloted, is stopped first and started again however the batch ends.
    pub async fn run(
        &self,
        registry: &InstanceRegistry,
        jobs: Vec<String>,
        parallelism: usize,
    ) -> RolloutResult<RebinarizeReport> {
        let start = Instant::now();
        let master = self.master()?;
        let scheduler = self.ctx.services.scheduler_service.clone();
        let policy = self.ctx.services.stop_start;

        if self.ctx.batch.pilot_scheduler {
            self.controller
                .ensure_state(&master, &scheduler, ServiceState::Stopped, EnsureOptions::new(policy))
                .await?;
        }

        let excluded: Arc<BTreeSet<String>> = Arc::new(
            registry
                .iter()
                .filter(|i| i.excluded)
                .map(|i| i.name.clone())
                .collect(),
        );
        let executor = self.executor();
        let template = self.ctx.batch.binarize_command.clone();
        let host = master.clone();
        let worker = move |name: String| {
            let executor = executor.clone();
            let excluded = excluded.clone();
            let command = template.replace("{instance}", &name);
            let host = host.clone();
            async move {
                if excluded.contains(&name) {
                    info!(instance = %name, "excluded, skipping");
                    return JobStatus::Excluded;
                }
                info!(instance = %name, "binarization started");
                let job_start = Instant::now();
                match executor.run(&host, &command).await {
                    Ok(output) if output.success() => {
                        info!(instance = %name, secs = job_start.elapsed().as_secs(), "data loaded");
                        JobStatus::Done
                    }
                    Ok(output) => {
                        warn!(instance = %name, code = output.exit_code, stderr = %output.stderr.trim(), "binarization failed");
                        JobStatus::Failed
                    }
                    Err(e) => {
                        warn!(instance = %name, error = %e, "binarization failed");
                        JobStatus::Failed
                    }
                }
            }
        };

        let sampler = Arc::new(ExecutorProcessSampler::new(
            self.executor(),
            self.ctx.roles.hosts_for(&[Role::TyrMaster, Role::Tyr]),
            self.ctx.batch.watchdog.process_names.clone(),
        ));
        let watchdog = Watchdog::from_settings(&self.ctx.batch.watchdog, sampler, self.confirmation.clone());

        let batch_start = Instant::now();
        let result = JobPool::new(parallelism)
            .run_batch_watched(jobs, worker, &watchdog)
            .await;
        let batch_elapsed = batch_start.elapsed();

        if self.ctx.batch.pilot_scheduler {
            let opts = EnsureOptions::new(policy).only_once(self.ctx.services.scheduler_start_only_once);
            if let Err(e) = self
                .controller
                .ensure_state(&master, &scheduler, ServiceState::Started, opts)
                .await
            {
                warn!(error = %e, "could not restart the scheduler");
            }
        }

        let outcome = result?;
        let elapsed = start.elapsed();
        info!(
            batch_secs = batch_elapsed.as_secs(),
            total_secs = elapsed.as_secs(),
            left = outcome.residual.len(),
            "rebinarization finished"
        );
        if !outcome.residual.is_empty() {
            warn!("rerun with --instances {}", outcome.residual.join(","));
        }
        Ok(RebinarizeReport {
            outcome,
            batch_elapsed,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rollgate_batch::{AlwaysConfirm, BatchError};
    use rollgate_core::{InstanceDecl, RetryPolicy, RoleTable};
    use rollgate_exec::{CommandOutput, ExecResult, RecordingExecutor, ServiceManager};
    use rollgate_health::{ScriptedStatusSource, StatusReport};

    use crate::error::RolloutError;

    fn context() -> Arc<DeploymentContext> {
        let mut roles = RoleTable::new();
        roles.set(Role::Eng, vec![Host::from("e1")]);
        roles.set(Role::TyrMaster, vec![Host::from("t1")]);
        let mut ctx = DeploymentContext::for_roles("t", roles);
        ctx.instances = ["a", "b", "c"].iter().map(|n| InstanceDecl::new(n, "pw")).collect();
        ctx.services.stop_start = RetryPolicy::new(2_000, 500);
        ctx.batch.binarize_command = "bina {instance}".to_string();
        Arc::new(ctx)
    }

    fn rebinarizer(exec: Arc<dyn CommandExecutor>, status: Arc<ScriptedStatusSource>) -> Rebinarizer {
        let controller = Arc::new(ServiceController::new(exec, ServiceManager::SysV));
        Rebinarizer::new(context(), controller, status).with_confirmation(Arc::new(AlwaysConfirm))
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_flags_instances() {
        let exec = Arc::new(RecordingExecutor::new());
        exec.on("test -f /srv/ed/data/b/data.nav.lz4", CommandOutput::failed(1, ""));
        exec.on("test -d /srv/ed/c", CommandOutput::failed(1, ""));
        let status = Arc::new(ScriptedStatusSource::new(Some(StatusReport::running(true))));
        status.script_engine(&Host::from("e1"), "b", vec![Some(StatusReport::with_status("no_data"))]);
        status.script_engine(&Host::from("e1"), "c", vec![None]);

        let ctx = context();
        let mut registry = InstanceRegistry::from_context(&ctx).unwrap();
        let found = rebinarizer(exec, status).discover(&mut registry).await.unwrap();

        assert_eq!(found.excluded, vec!["b"]);
        assert_eq!(found.critical, vec!["c"]);
        assert_eq!(found.first_deploy, vec!["c"]);
        assert!(registry.get("b").unwrap().excluded);
        assert!(!registry.get("c").unwrap().excluded);
        assert!(registry.get("c").unwrap().first_deploy);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_returns_failed_instances_and_restarts_scheduler() {
        let exec = Arc::new(RecordingExecutor::simulating_services());
        exec.set_running(&Host::from("t1"), "tyr_beat", true);
        exec.on("bina c", CommandOutput::failed(1, "no dataset"));
        let status = Arc::new(ScriptedStatusSource::new(Some(StatusReport::running(true))));

        let ctx = context();
        let mut registry = InstanceRegistry::from_context(&ctx).unwrap();
        registry.set_excluded("b", true).unwrap();
        let report = rebinarizer(exec.clone(), status)
            .run(&registry, registry.names(), 2)
            .await
            .unwrap();

        assert_eq!(report.outcome.residual, vec!["c"]);
        assert_eq!(report.outcome.with_status(JobStatus::Excluded), vec!["b"]);
        assert_eq!(exec.count("bina b"), 0);
        assert_eq!(exec.count("service tyr_beat stop"), 1);
        assert_eq!(exec.count("service tyr_beat start"), 1);
        assert!(exec.is_running(&Host::from("t1"), "tyr_beat"));
    }

    /// Binarization never returns; everything else goes to the recorder.
    struct FrozenBina(Arc<RecordingExecutor>);

    #[async_trait]
    impl CommandExecutor for FrozenBina {
        async fn run(&self, host: &Host, command: &str) -> ExecResult<CommandOutput> {
            if command.starts_with("bina ") {
                std::future::pending::<()>().await;
            }
            self.0.run(host, command).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn frozen_batch_aborts_and_still_restarts_scheduler() {
        let recorder = Arc::new(RecordingExecutor::simulating_services());
        recorder.set_running(&Host::from("t1"), "tyr_beat", true);
        let status = Arc::new(ScriptedStatusSource::new(Some(StatusReport::running(true))));
        let registry = InstanceRegistry::from_context(&context()).unwrap();

        let err = rebinarizer(Arc::new(FrozenBina(recorder.clone())), status)
            .run(&registry, vec!["a".into(), "b".into()], 1)
            .await
            .unwrap_err();

        match err {
            RolloutError::Batch(BatchError::Aborted { residual, .. }) => assert_eq!(residual, vec!["a", "b"]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(recorder.count("ps -eo args=") >= 3);
        assert!(recorder.is_running(&Host::from("t1"), "tyr_beat"));
    }

    #[tokio::test(start_paused = true)]
    async fn package_upgrade_restarts_workers_and_resumes_scheduler() {
        let exec = Arc::new(RecordingExecutor::simulating_services());
        let status = Arc::new(ScriptedStatusSource::new(Some(StatusReport::running(true))));
        let t1 = Host::from("t1");
        exec.set_running(&t1, "tyr_beat", true);
        rebinarizer(exec.clone(), status).upgrade_packages(true).await.unwrap();

        let commands: Vec<String> = exec
            .calls()
            .into_iter()
            .map(|(_, c)| c)
            .filter(|c| !c.ends_with("status"))
            .collect();
        assert_eq!(commands[0], "service tyr_beat stop");
        assert!(commands[1].contains("navitia-tyr navitia-ed"));
        assert_eq!(
            commands[2..],
            ["service tyr_worker stop", "service tyr_worker start", "service tyr_beat start"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_package_install_keeps_scheduler_stopped() {
        let exec = Arc::new(RecordingExecutor::simulating_services());
        exec.on("apt-get", CommandOutput::failed(100, "unmet dependencies"));
        let status = Arc::new(ScriptedStatusSource::new(Some(StatusReport::running(true))));
        let err = rebinarizer(exec.clone(), status).upgrade_packages(true).await.unwrap_err();
        assert!(err.to_string().contains("unmet dependencies"));
        assert_eq!(exec.count("tyr_worker"), 0);
        assert_eq!(exec.count("service tyr_beat start"), 0);
    }
}
