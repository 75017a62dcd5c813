//! Settings sections of the platform file.
//!
//! Every section has defaults matching a stock single-platform install, so
//! a platform file only needs to spell out what differs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded-retry parameters shared by health polling and service
/// confirmation. A plain value with no mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Give up once this much time has elapsed.
    pub max_wait_ms: u64,
    /// Delay between two probes.
    pub poll_interval_ms: u64,
    /// Raise on the first probe failure instead of retrying it.
    #[serde(default)]
    pub fail_fast: bool,
}

impl RetryPolicy {
    pub const fn new(max_wait_ms: u64, poll_interval_ms: u64) -> Self {
        Self {
            max_wait_ms,
            poll_interval_ms,
            fail_fast: false,
        }
    }

    pub const fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// On-host directory layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub kraken_basedir: String,
    pub kraken_binary: String,
    pub tyr_basedir: String,
    pub tyr_settings_file: String,
    /// Where binarized data files land (`<dir>/<instance>/data.nav.lz4`).
    pub data_destination_dir: String,
    /// Per-instance data-preparation working directories.
    pub ed_basedir: String,
    /// Per-instance front-end configuration files (`<dir>/<instance>.json`).
    pub frontend_instances_dir: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            kraken_basedir: "/srv/kraken".to_string(),
            kraken_binary: "/usr/bin/kraken".to_string(),
            tyr_basedir: "/srv/tyr".to_string(),
            tyr_settings_file: "/srv/tyr/settings.py".to_string(),
            data_destination_dir: "/srv/ed/data".to_string(),
            ed_basedir: "/srv/ed".to_string(),
            frontend_instances_dir: "/etc/jormungandr.d".to_string(),
        }
    }
}

/// How OS services are driven and how long to wait for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub use_systemd: bool,
    /// Web server fronting the engine monitor and the front-end app.
    pub web_server: String,
    /// Data-preparation periodic scheduler, paused during batches.
    pub scheduler_service: String,
    /// Data-preparation workers, restarted after a package upgrade.
    pub worker_service: String,
    pub stop_start: RetryPolicy,
    pub web_server_start: RetryPolicy,
    /// Wait for an engine to report its data loaded after a restart.
    pub engine_load: RetryPolicy,
    pub engine_start_only_once: bool,
    pub web_server_start_only_once: bool,
    pub scheduler_start_only_once: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            use_systemd: false,
            web_server: "apache2".to_string(),
            scheduler_service: "tyr_beat".to_string(),
            worker_service: "tyr_worker".to_string(),
            stop_start: RetryPolicy::new(4_000, 500),
            web_server_start: RetryPolicy::new(8_000, 500),
            engine_load: RetryPolicy::new(90_000, 1_000),
            engine_start_only_once: true,
            web_server_start_only_once: true,
            scheduler_start_only_once: true,
        }
    }
}

/// Engine monitor endpoint (`http://<engine>:<port>/<location>/?instance=<name>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub port: u16,
    pub location: String,
    pub probe_timeout_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            port: 85,
            location: "monitor-kraken".to_string(),
            probe_timeout_ms: 2_000,
        }
    }
}

/// Front-end status endpoint used to verify a restarted partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendSettings {
    /// Public name sent as the `Host` header.
    pub public_host: Option<String>,
    pub url_prefix: String,
    pub port: u16,
    pub token: Option<String>,
    pub verify: RetryPolicy,
}

impl Default for FrontendSettings {
    fn default() -> Self {
        Self {
            public_host: None,
            url_prefix: String::new(),
            port: 80,
            token: None,
            verify: RetryPolicy::new(30_000, 1_000),
        }
    }
}

/// Packages installed on each tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageSettings {
    /// Install `.deb` files copied to the host instead of using a repository.
    pub manual_deploy: bool,
    /// Directory holding the `.deb` files when `manual_deploy` is set.
    pub packages_dir: String,
    pub engine: Vec<String>,
    pub frontend: Vec<String>,
    pub tyr: Vec<String>,
}

impl Default for PackageSettings {
    fn default() -> Self {
        Self {
            manual_deploy: false,
            packages_dir: "/tmp/rollgate-packages".to_string(),
            engine: vec![
                "navitia-kraken".to_string(),
                "navitia-monitor-kraken".to_string(),
            ],
            frontend: vec!["navitia-jormungandr".to_string()],
            tyr: vec!["navitia-tyr".to_string(), "navitia-ed".to_string()],
        }
    }
}

/// How node changes reach the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerMode {
    /// Run the configured enable/disable commands.
    Scripted,
    /// Ask the operator to flip the node by hand.
    #[default]
    Manual,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerSettings {
    pub enabled: bool,
    pub mode: BalancerMode,
    /// Command run locally to drain a node; `{node}` is replaced by its address.
    pub disable_command: Option<String>,
    /// Command run locally to reinstate a node.
    pub enable_command: Option<String>,
}

/// What the watchdog does once a batch looks frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallAction {
    /// Ask the operator on the terminal.
    #[default]
    Prompt,
    /// Abort without asking.
    Abort,
    /// Keep going without asking.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub interval_secs: u64,
    /// Consecutive silent samples before the batch counts as frozen.
    pub stall_samples: u32,
    /// Command-line fragments identifying batch job processes.
    pub process_names: Vec<String>,
    pub on_stall: StallAction,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            stall_samples: 3,
            process_names: vec!["ed2".to_string(), "2ed".to_string()],
            on_stall: StallAction::Prompt,
        }
    }
}

/// Remote command transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Kill remote commands running longer than this; 0 disables the limit.
    pub command_timeout_secs: u64,
    /// Extra `-o` options passed to `ssh`.
    pub options: Vec<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: 3_600,
            options: Vec::new(),
        }
    }
}

impl SshSettings {
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}

/// Data-preparation batch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub parallelism: usize,
    /// Command run on the data-preparation master; `{instance}` is replaced.
    pub binarize_command: String,
    /// Pause the periodic scheduler for the duration of a batch.
    pub pilot_scheduler: bool,
    pub watchdog: WatchdogSettings,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            parallelism: 1,
            binarize_command: "cd /srv/tyr && TYR_CONFIG_FILE=/srv/tyr/settings.py \
                               python manage.py import_last_dataset {instance} \
                               --custom_output_dir temp"
                .to_string(),
            pilot_scheduler: true,
            watchdog: WatchdogSettings::default(),
        }
    }
}

/// Hand-off to the external template renderer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSettings {
    /// Command run on the target host as `<cmd> <template> <destination>`
    /// with the JSON context on stdin. Unset means configuration files are
    /// left as they are.
    pub render_command: Option<String>,
}
