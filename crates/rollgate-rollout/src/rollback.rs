//! Data backup and rollback.
//!
//! Outside the phase sequencer: before an upgrade the current data file of
//! an instance is copied aside, and a rollback copies it back and points
//! the engine binary link at the previous build. Both copies are checked
//! with `md5sum`.

use rollgate_core::{Host, Instance, PathSettings};
use rollgate_exec::{CommandExecutor, shell_quote};
use tracing::{info, warn};

use crate::error::{RolloutError, RolloutResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Copied { backup: String },
    /// Nothing to back up; the instance should be left out of the batch.
    NoDataFile,
}

async fn file_exists(executor: &dyn CommandExecutor, host: &Host, path: &str) -> RolloutResult<bool> {
    Ok(executor
        .run(host, &format!("test -f {}", shell_quote(path)))
        .await?
        .success())
}

async fn md5(executor: &dyn CommandExecutor, host: &Host, path: &str) -> RolloutResult<String> {
    let output = executor
        .run_checked(host, &format!("md5sum {} | awk '{{print $1}}'", shell_quote(path)))
        .await?;
    Ok(output.stdout.trim().to_string())
}

/// Copy `from` to `to` on `host` and check both sides match.
async fn verified_copy(
    executor: &dyn CommandExecutor,
    host: &Host,
    from: &str,
    to: &str,
) -> RolloutResult<()> {
    executor
        .run_checked(host, &format!("cp {} {}", shell_quote(from), shell_quote(to)))
        .await?;
    let (a, b) = (md5(executor, host, from).await?, md5(executor, host, to).await?);
    if a != b {
        return Err(RolloutError::Checksum {
            host: host.to_string(),
            original: from.to_string(),
            copy: to.to_string(),
        });
    }
    Ok(())
}

/// Keep a copy of the instance data file next to it.
pub async fn backup_data(
    executor: &dyn CommandExecutor,
    host: &Host,
    instance: &Instance,
    paths: &PathSettings,
) -> RolloutResult<BackupOutcome> {
    let data = instance.data_file(paths);
    if !file_exists(executor, host, &data).await? {
        warn!(instance = %instance.name, file = %data, "no data file to back up");
        return Ok(BackupOutcome::NoDataFile);
    }
    let backup = instance.backup_file(paths);
    verified_copy(executor, host, &data, &backup).await?;
    info!(instance = %instance.name, %backup, "data backed up");
    Ok(BackupOutcome::Copied { backup })
}

/// Put the backed-up data file back in place.
pub async fn rollback_data(
    executor: &dyn CommandExecutor,
    host: &Host,
    instance: &Instance,
    paths: &PathSettings,
) -> RolloutResult<()> {
    let backup = instance.backup_file(paths);
    if !file_exists(executor, host, &backup).await? {
        return Err(RolloutError::MissingFile {
            host: host.to_string(),
            path: backup,
        });
    }
    let data = instance.data_file(paths);
    verified_copy(executor, host, &backup, &data).await?;
    info!(instance = %instance.name, file = %data, "data rolled back");
    Ok(())
}

/// Point the engine binary link at `target` on every host.
pub async fn repoint_binary(
    executor: &dyn CommandExecutor,
    hosts: &[Host],
    link: &str,
    target: &str,
) -> RolloutResult<()> {
    for host in hosts {
        if !file_exists(executor, host, target).await? {
            return Err(RolloutError::MissingFile {
                host: host.to_string(),
                path: target.to_string(),
            });
        }
        executor
            .run_checked(host, &format!("ln -sfn {} {}", shell_quote(target), shell_quote(link)))
            .await?;
        info!(%host, link, target, "engine binary re-pointed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_core::{DeploymentContext, InstanceDecl, Role, RoleTable};
    use rollgate_exec::{CommandOutput, RecordingExecutor};

    fn instance() -> Instance {
        let mut roles = RoleTable::new();
        roles.set(Role::Eng, vec![Host::from("e1")]);
        let ctx = DeploymentContext::for_roles("t", roles);
        Instance::resolve(&InstanceDecl::new("fr-idf", "pw"), &ctx).unwrap()
    }

    const DATA: &str = "/srv/ed/data/fr-idf/data.nav.lz4";
    const BACKUP: &str = "/srv/ed/data/fr-idf/data.nav.lz4_fr-idf";

    #[tokio::test]
    async fn backup_copies_and_verifies() {
        let exec = RecordingExecutor::new();
        exec.on("md5sum", CommandOutput::ok("d41d8cd98f00b204e9800998ecf8427e\n"));
        let h = Host::from("t1");
        let out = backup_data(&exec, &h, &instance(), &PathSettings::default()).await.unwrap();
        assert_eq!(out, BackupOutcome::Copied { backup: BACKUP.to_string() });
        assert_eq!(exec.count(&format!("cp {DATA} {BACKUP}")), 1);
        assert_eq!(exec.count("md5sum"), 2);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_an_error() {
        let exec = RecordingExecutor::new();
        exec.on_seq("md5sum", vec![CommandOutput::ok("aaa"), CommandOutput::ok("bbb")]);
        let err = backup_data(&exec, &Host::from("t1"), &instance(), &PathSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::Checksum { .. }));
    }

    #[tokio::test]
    async fn missing_data_file_is_not_backed_up() {
        let exec = RecordingExecutor::new();
        exec.on("test -f", CommandOutput::failed(1, ""));
        let out = backup_data(&exec, &Host::from("t1"), &instance(), &PathSettings::default()).await.unwrap();
        assert_eq!(out, BackupOutcome::NoDataFile);
        assert_eq!(exec.count("cp "), 0);
    }

    #[tokio::test]
    async fn rollback_needs_a_backup() {
        let exec = RecordingExecutor::new();
        exec.on(&format!("test -f {BACKUP}"), CommandOutput::failed(1, ""));
        let err = rollback_data(&exec, &Host::from("t1"), &instance(), &PathSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::MissingFile { .. }));
    }

    #[tokio::test]
    async fn rollback_copies_backup_over_data() {
        let exec = RecordingExecutor::new();
        rollback_data(&exec, &Host::from("t1"), &instance(), &PathSettings::default())
            .await
            .unwrap();
        assert_eq!(exec.count(&format!("cp {BACKUP} {DATA}")), 1);
    }

    #[tokio::test]
    async fn repoints_binary_on_every_host() {
        let exec = RecordingExecutor::new();
        let hosts = [Host::from("e1"), Host::from("e2")];
        repoint_binary(&exec, &hosts, "/usr/bin/kraken", "/usr/bin/kraken-15.2").await.unwrap();
        assert_eq!(exec.count("ln -sfn /usr/bin/kraken-15.2 /usr/bin/kraken"), 2);
    }
}
