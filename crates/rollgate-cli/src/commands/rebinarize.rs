use anyhow::Result;
use rollgate_core::CoreError;
use rollgate_rollout::Rebinarizer;
use tracing::{error, info};

use super::Runtime;

/// Rebuild the data of `instances`. With `all`, instances are inspected
/// first and those without any data are skipped.
pub async fn rebinarize(rt: &Runtime, instances: &str, parallelism: Option<usize>) -> Result<u8> {
    let parallelism = parallelism.unwrap_or(rt.ctx.batch.parallelism);
    if parallelism == 0 {
        return Err(CoreError::Configuration("--parallelism must be at least 1".to_string()).into());
    }
    let rebinarizer = Rebinarizer::new(rt.ctx.clone(), rt.controller.clone(), rt.status.clone());
    run_with(rt, rebinarizer, instances, parallelism).await
}

pub(crate) async fn run_with(
    rt: &Runtime,
    rebinarizer: Rebinarizer,
    instances: &str,
    parallelism: usize,
) -> Result<u8> {
    let mut registry = rt.registry.clone();
    let jobs = registry.select(instances)?;
    if instances.trim() == "all" {
        let found = rebinarizer.discover(&mut registry).await?;
        if !found.critical.is_empty() {
            error!(instances = ?found.critical, "engines down with data present");
        }
    }
    info!(jobs = jobs.len(), parallelism, "starting rebinarization");

    let report = rebinarizer.run(&registry, jobs, parallelism).await?;
    Ok(if report.outcome.is_complete() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::exit_code_for;
    use crate::commands::testing::harness;
    use rollgate_batch::AlwaysConfirm;
    use rollgate_core::Host;
    use rollgate_exec::CommandOutput;
    use rollgate_health::StatusReport;
    use std::sync::Arc;

    fn rebinarizer(rt: &Runtime) -> Rebinarizer {
        Rebinarizer::new(rt.ctx.clone(), rt.controller.clone(), rt.status.clone())
            .with_confirmation(Arc::new(AlwaysConfirm))
    }

    #[tokio::test(start_paused = true)]
    async fn selected_instances_are_binarized() {
        let h = harness(&[]);
        let code = run_with(&h.rt, rebinarizer(&h.rt), "fr-nw", 2).await.unwrap();
        assert_eq!(code, 0);
        let master = Host::from("root@t1");
        assert_eq!(h.exec.count_on(&master, "import_last_dataset fr-nw"), 1);
        assert_eq!(h.exec.count_on(&master, "import_last_dataset fr-idf"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn instances_without_data_are_skipped() {
        let h = harness(&[]);
        h.status.script_engine(
            &Host::from("root@e1"),
            "fr-idf",
            vec![Some(StatusReport::with_status("no_data"))],
        );
        h.exec.on("test -f", CommandOutput::failed(1, ""));
        let code = run_with(&h.rt, rebinarizer(&h.rt), "all", 1).await.unwrap();
        assert_eq!(code, 0);
        let master = Host::from("root@t1");
        assert_eq!(h.exec.count_on(&master, "import_last_dataset fr-idf"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_exit_with_one() {
        let h = harness(&[]);
        h.exec.on("import_last_dataset fr-nw", CommandOutput::failed(1, "ed2nav crashed"));
        let code = run_with(&h.rt, rebinarizer(&h.rt), "fr-idf,fr-nw", 1).await.unwrap();
        assert_eq!(code, 1);
    }

    #[tokio::test]
    async fn zero_parallelism_is_a_configuration_error() {
        let h = harness(&[]);
        let err = rebinarize(&h.rt, "all", Some(0)).await.unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }
}
