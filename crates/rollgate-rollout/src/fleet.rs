//! Upgrade and verification of one partition of the fleet.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use rollgate_core::{DeploymentContext, Host, HostPartition, Instance, Role};
use rollgate_exec::{Dispatcher, ServiceController, Task, TemplateRenderer, install_command};
use rollgate_health::{Readiness, StatusSource, poll_until_ready};
use tracing::{info, warn};

use crate::error::{RolloutError, RolloutResult};
use crate::restart::EngineRestarter;
use crate::sequencer::PartitionWork;

const ENGINE_TEMPLATE: &str = "kraken.ini";
const FRONTEND_TEMPLATE: &str = "jormungandr_instance.json";

#[derive(Debug, Clone, Copy)]
pub struct FleetOptions {
    /// Render configuration files before restarting.
    pub update_configs: bool,
    /// Wait for every restarted engine to report its data loaded.
    pub wait_loaded: bool,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            update_configs: true,
            wait_loaded: true,
        }
    }
}

/// [`PartitionWork`] over real hosts: packages, configuration, engine
/// restarts, front-end reloads, and front-end status probes.
pub struct FleetWork {
    ctx: Arc<DeploymentContext>,
    controller: Arc<ServiceController>,
    renderer: Arc<dyn TemplateRenderer>,
    status: Arc<dyn StatusSource>,
    instances: Arc<Vec<Instance>>,
    restarter: EngineRestarter,
    options: FleetOptions,
}

impl FleetWork {
    pub fn new(
        ctx: Arc<DeploymentContext>,
        controller: Arc<ServiceController>,
        renderer: Arc<dyn TemplateRenderer>,
        status: Arc<dyn StatusSource>,
        instances: Vec<Instance>,
        options: FleetOptions,
    ) -> Self {
        let restarter = EngineRestarter::new(controller.clone(), status.clone(), ctx.services.clone());
        Self {
            ctx,
            controller,
            renderer,
            status,
            instances: Arc::new(instances),
            restarter,
            options,
        }
    }

    fn dispatcher(&self, partition: &HostPartition) -> Dispatcher {
        let roles = self
            .ctx
            .roles
            .restricted(Role::Eng, &partition.engines)
            .restricted(Role::Ws, &partition.frontends);
        Dispatcher::with_roles(self.ctx.clone(), roles)
    }

    fn install_task(&self, role: Role, packages: &[String]) -> Task {
        let command = install_command(packages, &self.ctx.packages);
        let executor = self.controller.executor().clone();
        Task::new("install packages", &[role], move |tc| {
            let executor = executor.clone();
            let command = command.clone();
            async move {
                executor.run_checked(&tc.host, &command).await?;
                Ok(())
            }
        })
    }

    fn engine_config_task(&self) -> Task {
        let renderer = self.renderer.clone();
        let instances = self.instances.clone();
        Task::new("engine configuration", &[Role::Eng], move |tc| {
            let renderer = renderer.clone();
            let instances = instances.clone();
            async move {
                for instance in instances.iter().filter(|i| i.serves_on(&tc.host)) {
                    let destination = format!("{}/{ENGINE_TEMPLATE}", instance.kraken_dir(&tc.ctx.paths));
                    let context = instance.template_context(&tc.ctx.paths);
                    renderer.render(&tc.host, ENGINE_TEMPLATE, &destination, &context).await?;
                }
                Ok(())
            }
        })
    }

    fn frontend_config_task(&self) -> Task {
        let renderer = self.renderer.clone();
        let instances = self.instances.clone();
        Task::new("front-end configuration", &[Role::Ws], move |tc| {
            let renderer = renderer.clone();
            let instances = instances.clone();
            async move {
                for instance in instances.iter() {
                    let destination = format!(
                        "{}/{}.json",
                        tc.ctx.paths.frontend_instances_dir, instance.name
                    );
                    let context = instance.template_context(&tc.ctx.paths);
                    renderer.render(&tc.host, FRONTEND_TEMPLATE, &destination, &context).await?;
                }
                Ok(())
            }
        })
    }

    /// A random included instance to probe through a front-end.
    fn sample_instance(&self) -> Option<String> {
        let included: Vec<&Instance> = self.instances.iter().filter(|i| !i.excluded).collect();
        let mut rng = rand::rng();
        included.choose(&mut rng).map(|i| i.name.clone())
    }
}

#[async_trait]
impl PartitionWork for FleetWork {
    async fn upgrade(&self, partition: &HostPartition) -> RolloutResult<()> {
        let dispatcher = self.dispatcher(partition);
        info!(engines = partition.engines.len(), frontends = partition.frontends.len(), "upgrading partition");

        dispatcher
            .broadcast(&self.install_task(Role::Eng, &self.ctx.packages.engine))
            .await?;
        if self.options.update_configs {
            dispatcher.broadcast(&self.engine_config_task()).await?;
        }
        let summary = self
            .restarter
            .restart_all(&self.instances, &partition.engines, self.options.wait_loaded)
            .await?;
        if !summary.all_loaded() {
            warn!(not_loaded = ?summary.not_loaded, "some engines have not loaded their data");
        }

        dispatcher
            .broadcast(&self.install_task(Role::Ws, &self.ctx.packages.frontend))
            .await?;
        if self.options.update_configs {
            dispatcher.broadcast(&self.frontend_config_task()).await?;
        }
        self.reload_frontends(&partition.frontends).await
    }

    async fn verify(&self, partition: &HostPartition) -> RolloutResult<()> {
        let policy = self.ctx.frontend.verify;
        for host in &partition.frontends {
            let Some(instance) = self.sample_instance() else {
                for host in &partition.frontends {
                    warn!(%host, "front-end verification skipped: every instance is excluded");
                }
                return Ok(());
            };
            let verified = poll_until_ready(
                &policy,
                || self.status.frontend_status(host, &instance),
                |r| Readiness::Running.accepts(r),
            )
            .await;
            match verified {
                Ok(_) => info!(%host, instance = %instance, "front-end verified"),
                Err(e) => {
                    return Err(RolloutError::Verification {
                        host: host.to_string(),
                        instance,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn reload_frontends(&self, hosts: &[Host]) -> RolloutResult<()> {
        let command = self
            .controller
            .manager()
            .reload_command(&self.ctx.services.web_server);
        for host in hosts {
            self.controller.executor().run_checked(host, &command).await?;
            info!(%host, "front-end reloaded");
        }
        Ok(())
    }
}
