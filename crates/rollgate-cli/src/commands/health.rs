use anyhow::{Context, Result};
use rollgate_core::Role;
use rollgate_exec::check_versions;
use rollgate_health::{evaluate_fleet, verify_instance};
use rollgate_rollout::EngineRestarter;
use tracing::{info, warn};

use super::Runtime;

/// Check every engine replica of one instance. Problems fail the command
/// only with `fail_on_error`; otherwise they are logged.
pub async fn health_check(rt: &Runtime, instance: &str, fail_on_error: bool) -> Result<u8> {
    let instance = rt.registry.get(instance)?;
    let healthy = verify_instance(rt.status.as_ref(), instance, true, fail_on_error).await?;
    if healthy {
        info!(instance = %instance.name, "instance healthy on every engine");
    }
    Ok(0)
}

/// Dead-instance threshold check over the whole fleet.
pub async fn check_dead(rt: &Runtime, check_version: bool) -> Result<u8> {
    let outcome = evaluate_fleet(rt.status.as_ref(), rt.registry.iter(), rt.ctx.dead_instance_threshold).await;
    let mut code = outcome.exit_code();

    if check_version {
        let package = Role::Eng.package().unwrap_or("navitia-kraken");
        let report = check_versions(rt.executor.as_ref(), rt.ctx.roles.hosts(Role::Eng), package)
            .await
            .context("checking the engine package version")?;
        if !report.up_to_date() {
            warn!(package, installed = ?report.installed(), "engine package is not the candidate version");
            code = 1;
        }
    }
    Ok(code)
}

/// Restart the engines of the selected instances on every engine host.
pub async fn restart_engines(rt: &Runtime, instances: &str, wait: bool) -> Result<u8> {
    let selected = rt.select(instances)?;
    rt.controller.reset_run();
    let restarter = EngineRestarter::new(rt.controller.clone(), rt.status.clone(), rt.ctx.services.clone());
    let summary = restarter
        .restart_all(&selected, rt.ctx.roles.hosts(Role::Eng), wait)
        .await?;
    Ok(if summary.all_loaded() { 0 } else { 1 })
}
