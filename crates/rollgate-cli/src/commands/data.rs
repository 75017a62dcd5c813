use anyhow::Result;
use rollgate_core::Role;
use rollgate_rollout::{BackupOutcome, backup_data, repoint_binary, rollback_data};
use tracing::{info, warn};

use super::Runtime;

/// Back up the data file of each selected instance on its engine hosts.
pub async fn backup(rt: &Runtime, instances: &str) -> Result<u8> {
    let mut skipped = Vec::new();
    for instance in rt.select(instances)? {
        for host in &instance.engine_hosts {
            let outcome = backup_data(rt.executor.as_ref(), host, &instance, &rt.ctx.paths).await?;
            if outcome == BackupOutcome::NoDataFile && !skipped.contains(&instance.name) {
                skipped.push(instance.name.clone());
            }
        }
    }
    if !skipped.is_empty() {
        warn!(instances = ?skipped, "some instances had no data to back up");
    }
    Ok(0)
}

/// Restore backed-up data, then point the engine link at `binary` if given.
pub async fn rollback(rt: &Runtime, instances: &str, binary: Option<&str>) -> Result<u8> {
    for instance in rt.select(instances)? {
        for host in &instance.engine_hosts {
            rollback_data(rt.executor.as_ref(), host, &instance, &rt.ctx.paths).await?;
        }
    }
    if let Some(target) = binary {
        repoint_binary(
            rt.executor.as_ref(),
            rt.ctx.roles.hosts(Role::Eng),
            &rt.ctx.paths.kraken_binary,
            target,
        )
        .await?;
    }
    info!("rollback done, restart the engines to serve the restored data");
    Ok(0)
}
