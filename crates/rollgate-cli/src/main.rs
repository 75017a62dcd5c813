use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::Runtime;

#[derive(Parser)]
#[command(
    name = "rollgate",
    about = "Rolling upgrades of a transit-routing fleet",
    version,
    propagate_version = true
)]
struct Cli {
    /// Platform file
    #[arg(short, long, global = true, default_value = "rollgate.toml")]
    config: PathBuf,
    /// Override a platform setting (`key.path=value`). Repeatable.
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    overrides: Vec<String>,
    /// Run every command on this machine instead of over ssh
    #[arg(long, global = true)]
    local: bool,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upgrade the fleet one partition at a time behind the load balancer.
    Rollout {
        /// Expected number of partitions; must match the platform file
        #[arg(long)]
        partitions: Option<usize>,
        /// Ask the operator to switch nodes instead of running the balancer commands
        #[arg(long, action = ArgAction::Set, default_value_t = false)]
        manual_lb: bool,
        /// Skip the rollout when the engine package is already up to date
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        check_version: bool,
        /// Render engine and front-end configuration files
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        update_configs: bool,
        /// Wait for every restarted engine to load its data
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        kraken_wait: bool,
        /// Upgrade the data-preparation packages before the first phase
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        upgrade_tyr: bool,
        /// Rebuild the data of every instance before the first phase
        #[arg(long, action = ArgAction::Set, default_value_t = false)]
        rebinarize: bool,
    },
    /// Rebuild instance data on the data-preparation master.
    Rebinarize {
        /// `all` or a comma-separated list of instances
        #[arg(long, default_value = "all")]
        instances: String,
        /// Concurrent jobs (default: the platform's batch parallelism)
        #[arg(long)]
        parallelism: Option<usize>,
    },
    /// Check one instance on every engine replica.
    HealthCheck {
        #[arg(long)]
        instance: String,
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        fail_on_error: bool,
    },
    /// Count dead instances and compare against the platform threshold.
    CheckDead {
        /// Also fail when the engine package differs from the candidate
        #[arg(long, action = ArgAction::Set, default_value_t = false)]
        check_version: bool,
    },
    /// Restart the engines of the selected instances.
    RestartEngines {
        #[arg(long, default_value = "all")]
        instances: String,
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        wait: bool,
    },
    /// Copy instance data files aside before an upgrade.
    BackupData {
        #[arg(long, default_value = "all")]
        instances: String,
    },
    /// Restore backed-up data files and optionally an older engine binary.
    Rollback {
        #[arg(long, default_value = "all")]
        instances: String,
        /// Previous engine binary to point the engine link at
        #[arg(long)]
        binary: Option<String>,
    },
    /// Show installed and candidate package versions for a role.
    ShowVersion {
        #[arg(long, default_value = "eng", value_parser = commands::version::parse_role)]
        role: rollgate_core::Role,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rollgate=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let rt = Runtime::load(&cli.config, &cli.overrides, cli.local)?;
    match cli.command {
        Commands::Rollout {
            partitions,
            manual_lb,
            check_version,
            update_configs,
            kraken_wait,
            upgrade_tyr,
            rebinarize,
        } => {
            let args = commands::rollout::RolloutArgs {
                partitions,
                manual_lb,
                check_version,
                update_configs,
                wait_loaded: kraken_wait,
                upgrade_data_prep: upgrade_tyr,
                rebinarize,
            };
            commands::rollout::rollout(&rt, args).await
        }
        Commands::Rebinarize {
            instances,
            parallelism,
        } => commands::rebinarize::rebinarize(&rt, &instances, parallelism).await,
        Commands::HealthCheck {
            instance,
            fail_on_error,
        } => commands::health::health_check(&rt, &instance, fail_on_error).await,
        Commands::CheckDead { check_version } => commands::health::check_dead(&rt, check_version).await,
        Commands::RestartEngines { instances, wait } => {
            commands::health::restart_engines(&rt, &instances, wait).await
        }
        Commands::BackupData { instances } => commands::data::backup(&rt, &instances).await,
        Commands::Rollback { instances, binary } => {
            commands::data::rollback(&rt, &instances, binary.as_deref()).await
        }
        Commands::ShowVersion { role } => commands::version::show_version(&rt, role).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(commands::exit_code_for(&e))
        }
    }
}
