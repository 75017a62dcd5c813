pub mod data;
pub mod health;
pub mod rebinarize;
pub mod rollout;
pub mod version;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rollgate_core::{CoreError, DeploymentContext, Instance, InstanceRegistry, SshSettings};
use rollgate_exec::{
    CommandExecutor, ExecError, LocalExecutor, ServiceController, ServiceManager, SshExecutor,
    TemplateRenderer, renderer_for,
};
use rollgate_health::{HealthError, HttpStatusSource, StatusSource};
use rollgate_rollout::RolloutError;

/// Everything a command needs, built once from the platform file.
pub struct Runtime {
    pub ctx: Arc<DeploymentContext>,
    /// Reaches the fleet hosts.
    pub executor: Arc<dyn CommandExecutor>,
    /// Runs load-balancer scripts, always on this machine.
    pub local: Arc<dyn CommandExecutor>,
    pub controller: Arc<ServiceController>,
    pub status: Arc<dyn StatusSource>,
    pub registry: InstanceRegistry,
}

impl Runtime {
    pub fn load(config: &Path, overrides: &[String], local: bool) -> Result<Self> {
        let ctx = DeploymentContext::load(config, overrides)
            .with_context(|| format!("loading platform file {}", config.display()))?;
        let executor: Arc<dyn CommandExecutor> = if local {
            Arc::new(LocalExecutor::new())
        } else {
            Arc::new(ssh_executor(&ctx.ssh))
        };
        let status = Arc::new(HttpStatusSource::from_context(&ctx));
        Self::new(ctx, executor, Arc::new(LocalExecutor::new()), status)
    }

    pub fn new(
        ctx: DeploymentContext,
        executor: Arc<dyn CommandExecutor>,
        local: Arc<dyn CommandExecutor>,
        status: Arc<dyn StatusSource>,
    ) -> Result<Self> {
        let registry = InstanceRegistry::from_context(&ctx)?;
        let manager = ServiceManager::from_systemd_flag(ctx.services.use_systemd);
        let controller = Arc::new(ServiceController::new(executor.clone(), manager));
        Ok(Self {
            ctx: Arc::new(ctx),
            executor,
            local,
            controller,
            status,
            registry,
        })
    }

    pub fn renderer(&self) -> Arc<dyn TemplateRenderer> {
        renderer_for(self.executor.clone(), self.ctx.templates.render_command.as_deref())
    }

    /// Resolve an `all` or comma-separated selection into instances.
    pub fn select(&self, selection: &str) -> Result<Vec<Instance>> {
        let mut selected = Vec::new();
        for name in self.registry.select(selection)? {
            selected.push(self.registry.get(&name)?.clone());
        }
        Ok(selected)
    }
}

fn ssh_executor(settings: &SshSettings) -> SshExecutor {
    let mut ssh = settings
        .options
        .iter()
        .fold(SshExecutor::new(), |ssh, option| ssh.with_option(option));
    if let Some(limit) = settings.command_timeout() {
        ssh = ssh.with_timeout(limit);
    }
    ssh
}

/// Whether `err` comes from a bad platform file or bad arguments.
pub fn is_configuration(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<CoreError>().is_some() {
        return true;
    }
    if let Some(e) = err.downcast_ref::<RolloutError>() {
        return e.is_configuration() || matches!(e, RolloutError::Core(_));
    }
    if let Some(ExecError::Core(_)) = err.downcast_ref::<ExecError>() {
        return true;
    }
    matches!(err.downcast_ref::<HealthError>(), Some(HealthError::Core(_)))
}

/// 2 for configuration problems, 1 for everything else.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    if is_configuration(err) { 2 } else { 1 }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use rollgate_core::DeploymentContext;
    use rollgate_exec::RecordingExecutor;
    use rollgate_health::{ScriptedStatusSource, StatusReport};

    use super::Runtime;

    pub const PLATFORM: &str = r#"
name = "cli"

[roles]
tyr_master = ["root@t1"]
eng = ["root@e1", "root@e2"]
ws = ["root@w1", "root@w2"]

[[partitions]]
engines = ["root@e1"]
frontends = ["root@w1"]

[[partitions]]
engines = ["root@e2"]
frontends = ["root@w2"]

[[instances]]
name = "fr-idf"
db_password = "pw"

[[instances]]
name = "fr-nw"
db_password = "pw"

[load_balancer]
enabled = true

[services]
stop_start = { max_wait_ms = 2000, poll_interval_ms = 500 }
web_server_start = { max_wait_ms = 2000, poll_interval_ms = 500 }
engine_load = { max_wait_ms = 3000, poll_interval_ms = 1000 }

[frontend.verify]
max_wait_ms = 3000
poll_interval_ms = 1000
"#;

    pub struct Harness {
        pub rt: Runtime,
        pub exec: Arc<RecordingExecutor>,
        pub status: Arc<ScriptedStatusSource>,
    }

    pub fn harness(overrides: &[&str]) -> Harness {
        let overrides: Vec<String> = overrides.iter().map(|s| s.to_string()).collect();
        let ctx = DeploymentContext::from_toml_str(PLATFORM, &overrides).unwrap();
        let exec = Arc::new(RecordingExecutor::simulating_services());
        let status = Arc::new(ScriptedStatusSource::new(Some(StatusReport::running(true))));
        let rt = Runtime::new(ctx, exec.clone(), exec.clone(), status.clone()).unwrap();
        Harness { rt, exec, status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_platform_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(testing::PLATFORM.as_bytes()).unwrap();
        let rt = Runtime::load(file.path(), &["dry_run=true".to_string()], true).unwrap();
        assert!(rt.ctx.dry_run);
        assert_eq!(rt.registry.names(), vec!["fr-idf", "fr-nw"]);
    }

    #[test]
    fn ssh_timeout_comes_from_the_platform_file() {
        let h = testing::harness(&[]);
        assert_eq!(
            ssh_executor(&h.rt.ctx.ssh).timeout(),
            Some(std::time::Duration::from_secs(3_600))
        );
        let h = testing::harness(&["ssh.command_timeout_secs=0"]);
        assert_eq!(ssh_executor(&h.rt.ctx.ssh).timeout(), None);
    }

    #[test]
    fn missing_platform_file_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Runtime::load(&dir.path().join("absent.toml"), &[], true)
            .err()
            .unwrap();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn selection_of_unknown_instance_is_a_configuration_error() {
        let h = testing::harness(&[]);
        let err = h.rt.select("fr-idf,nowhere").unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
        assert_eq!(h.rt.select("all").unwrap().len(), 2);
    }

    #[test]
    fn fleet_failures_exit_with_one() {
        let err = anyhow::Error::new(RolloutError::NotConfirmed("switch".to_string()));
        assert_eq!(exit_code_for(&err), 1);
        let err = anyhow::Error::new(RolloutError::Core(CoreError::Configuration("x".to_string())));
        assert_eq!(exit_code_for(&err), 2);
        let err = anyhow::Error::new(CoreError::Configuration("x".to_string())).context("while loading");
        assert_eq!(exit_code_for(&err), 2);
    }
}
