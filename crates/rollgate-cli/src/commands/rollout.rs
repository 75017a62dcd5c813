use std::sync::Arc;

use anyhow::{Context, Result};
use rollgate_core::{CoreError, InstanceRegistry, Role};
use rollgate_exec::check_versions;
use rollgate_rollout::{
    FleetOptions, FleetWork, LoadBalancer, OperatorPort, Rebinarizer, RolloutSequencer,
    TerminalOperator, balancer_for,
};
use tracing::{error, info};

use super::Runtime;

pub struct RolloutArgs {
    pub partitions: Option<usize>,
    pub manual_lb: bool,
    pub check_version: bool,
    pub update_configs: bool,
    pub wait_loaded: bool,
    /// Upgrade the data-preparation tier before the first phase.
    pub upgrade_data_prep: bool,
    /// Rebuild every instance's data before the first phase.
    pub rebinarize: bool,
}

pub async fn rollout(rt: &Runtime, args: RolloutArgs) -> Result<u8> {
    let rebinarizer = Rebinarizer::new(rt.ctx.clone(), rt.controller.clone(), rt.status.clone());
    rollout_with(rt, args, Arc::new(TerminalOperator), rebinarizer).await
}

/// Upgrade the data-preparation tier and rebuild the data ahead of the
/// phases. Returns the registry with the discovered exclusions, or `None`
/// when some instance could not be rebuilt.
async fn prepare_data(
    rt: &Runtime,
    args: &RolloutArgs,
    rebinarizer: &Rebinarizer,
) -> Result<Option<InstanceRegistry>> {
    let mut registry = rt.registry.clone();
    if args.upgrade_data_prep {
        let batch_follows = args.rebinarize && rt.ctx.batch.pilot_scheduler;
        rebinarizer
            .upgrade_packages(!batch_follows)
            .await
            .context("upgrading the data-preparation tier")?;
    }
    if !args.rebinarize {
        return Ok(Some(registry));
    }

    let jobs = registry.select("all")?;
    let found = rebinarizer.discover(&mut registry).await?;
    if !found.critical.is_empty() {
        error!(instances = ?found.critical, "engines down with data present");
    }
    let report = rebinarizer
        .run(&registry, jobs, rt.ctx.batch.parallelism)
        .await
        .context("rebuilding instance data")?;
    if !report.outcome.is_complete() {
        error!(residual = ?report.outcome.residual, "data rebuild incomplete, rollout not started");
        return Ok(None);
    }
    Ok(Some(registry))
}

pub(crate) async fn rollout_with(
    rt: &Runtime,
    args: RolloutArgs,
    operator: Arc<dyn OperatorPort>,
    rebinarizer: Rebinarizer,
) -> Result<u8> {
    if let Some(expected) = args.partitions {
        let configured = rt.ctx.partitions.len();
        if rt.ctx.uses_load_balancer() && expected != configured {
            return Err(CoreError::Configuration(format!(
                "--partitions={expected} but the platform declares {configured} partitions"
            ))
            .into());
        }
    }

    if args.check_version {
        let package = Role::Eng.package().unwrap_or("navitia-kraken");
        let report = check_versions(rt.executor.as_ref(), rt.ctx.roles.hosts(Role::Eng), package)
            .await
            .context("checking the engine package version")?;
        if report.up_to_date() {
            info!(package, installed = ?report.installed(), "engines already up to date, nothing to roll out");
            return Ok(0);
        }
    }

    rt.controller.reset_run();
    let Some(registry) = prepare_data(rt, &args, &rebinarizer).await? else {
        return Ok(1);
    };
    let balancer: Arc<dyn LoadBalancer> =
        balancer_for(&rt.ctx, rt.local.clone(), operator, args.manual_lb);
    let work = FleetWork::new(
        rt.ctx.clone(),
        rt.controller.clone(),
        rt.renderer(),
        rt.status.clone(),
        registry.iter().cloned().collect(),
        FleetOptions {
            update_configs: args.update_configs,
            wait_loaded: args.wait_loaded,
        },
    );
    let mut sequencer = RolloutSequencer::from_context(&rt.ctx, balancer, Arc::new(work))?;
    let report = sequencer.run().await;
    Ok(report.exit_code())
}
