//! Deployment context: the immutable view of one platform.
//!
//! Loaded once from the platform TOML file. Command-line overrides
//! (`key.path=value`) are applied to the parsed document before it is
//! deserialized, so nothing downstream ever sees a half-overridden value.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::*;
use crate::error::{CoreError, CoreResult};
use crate::instance::{DeploymentMode, InstanceDecl};
use crate::roles::{Host, HostPartition, Role, RoleTable, validate_partitions};

fn default_ssh_user() -> Option<String> {
    Some("root".to_string())
}

fn default_threshold() -> f64 {
    0.15
}

/// Everything known about a platform, fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentContext {
    /// Platform name (`prod`, `customer`, ...).
    pub name: String,
    #[serde(default)]
    pub mode: DeploymentMode,
    /// Front address of the engine tier in network mode.
    #[serde(default)]
    pub virtual_address: Option<String>,
    /// User prepended to bare host names found in instance declarations.
    #[serde(default = "default_ssh_user")]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub roles: RoleTable,
    #[serde(default)]
    pub partitions: Vec<HostPartition>,
    #[serde(default)]
    pub instances: Vec<InstanceDecl>,
    /// Fraction of instances allowed to be dead after a rollout.
    #[serde(default = "default_threshold")]
    pub dead_instance_threshold: f64,
    /// Log load-balancer changes instead of applying them.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub services: ServiceSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub frontend: FrontendSettings,
    #[serde(default)]
    pub packages: PackageSettings,
    #[serde(default)]
    pub load_balancer: LoadBalancerSettings,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub templates: TemplateSettings,
}

impl DeploymentContext {
    /// A context with default settings and the given role table.
    pub fn for_roles(name: &str, roles: RoleTable) -> Self {
        Self {
            name: name.to_string(),
            mode: DeploymentMode::default(),
            virtual_address: None,
            ssh_user: default_ssh_user(),
            roles,
            partitions: Vec::new(),
            instances: Vec::new(),
            dead_instance_threshold: default_threshold(),
            dry_run: false,
            paths: PathSettings::default(),
            services: ServiceSettings::default(),
            monitor: MonitorSettings::default(),
            frontend: FrontendSettings::default(),
            packages: PackageSettings::default(),
            load_balancer: LoadBalancerSettings::default(),
            ssh: SshSettings::default(),
            batch: BatchSettings::default(),
            templates: TemplateSettings::default(),
        }
    }

    /// Load a platform file and apply `overrides` (`key.path=value`).
    pub fn load(path: &Path, overrides: &[String]) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let ctx = Self::from_toml_str(&content, overrides)?;
        info!(
            platform = %ctx.name,
            path = %path.display(),
            instances = ctx.instances.len(),
            partitions = ctx.partitions.len(),
            "platform configuration loaded"
        );
        Ok(ctx)
    }

    pub fn from_toml_str(content: &str, overrides: &[String]) -> CoreResult<Self> {
        let mut doc: toml::Table =
            toml::from_str(content).map_err(|e| CoreError::Parse(e.to_string()))?;
        for raw in overrides {
            apply_override(&mut doc, raw)?;
        }
        let ctx: DeploymentContext = toml::Value::Table(doc)
            .try_into()
            .map_err(|e: toml::de::Error| CoreError::Parse(e.to_string()))?;
        ctx.validate()?;
        Ok(ctx)
    }

    /// Reject contexts the rollout engine cannot run against.
    pub fn validate(&self) -> CoreResult<()> {
        if !(0.0..=1.0).contains(&self.dead_instance_threshold) {
            return Err(CoreError::config(format!(
                "dead_instance_threshold must be within [0, 1], got {}",
                self.dead_instance_threshold
            )));
        }
        if self.batch.parallelism == 0 {
            return Err(CoreError::config("batch.parallelism must be at least 1"));
        }
        if self.batch.watchdog.stall_samples == 0 {
            return Err(CoreError::config("batch.watchdog.stall_samples must be at least 1"));
        }
        let mut names = std::collections::BTreeSet::new();
        for decl in &self.instances {
            if !names.insert(decl.name.as_str()) {
                return Err(CoreError::config(format!("instance {} declared twice", decl.name)));
            }
        }
        validate_partitions(&self.partitions, &self.roles)?;
        if self.load_balancer.enabled && self.load_balancer.mode == BalancerMode::Scripted {
            let lb = &self.load_balancer;
            if lb.disable_command.is_none() || lb.enable_command.is_none() {
                return Err(CoreError::config(
                    "scripted load balancer needs both disable_command and enable_command",
                ));
            }
        }
        debug!(platform = %self.name, "configuration validated");
        Ok(())
    }

    /// The ssh target for a bare server name from an instance declaration.
    pub fn ssh_target(&self, server: &str) -> Host {
        match &self.ssh_user {
            Some(user) if !server.contains('@') => Host::new(format!("{user}@{server}")),
            _ => Host::new(server),
        }
    }

    /// First host holding `role`.
    pub fn first_host(&self, role: Role) -> CoreResult<Host> {
        self.roles
            .hosts(role)
            .first()
            .cloned()
            .ok_or_else(|| CoreError::config(format!("no host declared with role {role}")))
    }

    /// Whether rollouts go through the load balancer in partitions.
    pub fn uses_load_balancer(&self) -> bool {
        self.load_balancer.enabled
    }
}

/// Apply one `key.path=value` override to a parsed document.
///
/// The value is read as a TOML value when it parses as one (`true`, `3`,
/// `0.2`, `["a", "b"]`), and as a plain string otherwise.
pub fn apply_override(doc: &mut toml::Table, raw: &str) -> CoreResult<()> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| CoreError::Override(raw.to_string()))?;
    let key = key.trim();
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(CoreError::Override(raw.to_string()));
    }
    let value = parse_override_value(value.trim());

    let mut segments: Vec<&str> = key.split('.').collect();
    let last = segments.pop().ok_or_else(|| CoreError::Override(raw.to_string()))?;
    let mut table = doc;
    for segment in segments {
        let entry = table
            .entry(segment.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        table = match entry {
            toml::Value::Table(t) => t,
            _ => return Err(CoreError::Override(raw.to_string())),
        };
    }
    debug!(key, "configuration override applied");
    table.insert(last.to_string(), value);
    Ok(())
}

fn parse_override_value(value: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("v = {value}"))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PLATFORM: &str = r#"
name = "prod"
mode = "network"
virtual_address = "kraken-vip"

[roles]
tyr_master = ["root@tyr1"]
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
zmq_port = 30001

[[instances]]
name = "fr-nw"
db_password = "pw"
zmq_port = 30002
engines = "e2"

[load_balancer]
enabled = true
"#;

    #[test]
    fn parses_platform_file() {
        let ctx = DeploymentContext::from_toml_str(PLATFORM, &[]).unwrap();
        assert_eq!(ctx.name, "prod");
        assert_eq!(ctx.mode, DeploymentMode::Network);
        assert_eq!(ctx.partitions.len(), 2);
        assert_eq!(ctx.instances.len(), 2);
        assert_eq!(ctx.roles.hosts(Role::Ws).len(), 2);
        assert!(ctx.uses_load_balancer());
        assert_eq!(ctx.load_balancer.mode, BalancerMode::Manual);
        assert_eq!(ctx.dead_instance_threshold, 0.15);
    }

    #[test]
    fn overrides_apply_before_deserialization() {
        let overrides = vec![
            "dead_instance_threshold=0.3".to_string(),
            "batch.parallelism=4".to_string(),
            "frontend.public_host=api.example.org".to_string(),
            "dry_run=true".to_string(),
        ];
        let ctx = DeploymentContext::from_toml_str(PLATFORM, &overrides).unwrap();
        assert_eq!(ctx.dead_instance_threshold, 0.3);
        assert_eq!(ctx.batch.parallelism, 4);
        assert_eq!(ctx.frontend.public_host.as_deref(), Some("api.example.org"));
        assert!(ctx.dry_run);
    }

    #[test]
    fn malformed_override_rejected() {
        let err = DeploymentContext::from_toml_str(PLATFORM, &["nokey".to_string()]).unwrap_err();
        assert!(matches!(err, CoreError::Override(_)));
        let err = DeploymentContext::from_toml_str(PLATFORM, &["name.x=1".to_string()]).unwrap_err();
        assert!(matches!(err, CoreError::Override(_)));
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let err = DeploymentContext::from_toml_str(PLATFORM, &["dead_instance_threshold=1.5".into()])
            .unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn scripted_balancer_needs_commands() {
        let err = DeploymentContext::from_toml_str(PLATFORM, &["load_balancer.mode=scripted".into()])
            .unwrap_err();
        assert!(err.to_string().contains("disable_command"));
    }

    #[test]
    fn duplicate_instances_rejected() {
        let doubled = format!("{PLATFORM}\n[[instances]]\nname = \"fr-idf\"\ndb_password = \"x\"\nzmq_port = 1\n");
        assert!(DeploymentContext::from_toml_str(&doubled, &[]).is_err());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PLATFORM.as_bytes()).unwrap();
        let ctx = DeploymentContext::load(file.path(), &[]).unwrap();
        assert_eq!(ctx.name, "prod");
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = DeploymentContext::load(Path::new("/nonexistent/rollgate.toml"), &[]).unwrap_err();
        assert!(matches!(err, CoreError::Io { .. }));
    }

    #[test]
    fn ssh_target_adds_default_user() {
        let ctx = DeploymentContext::from_toml_str(PLATFORM, &[]).unwrap();
        assert_eq!(ctx.ssh_target("e2").as_str(), "root@e2");
        assert_eq!(ctx.ssh_target("deploy@e2").as_str(), "deploy@e2");
    }

    #[test]
    fn registry_builds_from_file() {
        let ctx = DeploymentContext::from_toml_str(PLATFORM, &[]).unwrap();
        let registry = crate::InstanceRegistry::from_context(&ctx).unwrap();
        let nw = registry.get("fr-nw").unwrap();
        assert_eq!(nw.engine_hosts, vec![Host::from("root@e2")]);
        assert_eq!(nw.socket.frontend_connect, "tcp://kraken-vip:30002");
    }

    #[test]
    fn sample_platform_file_is_valid() {
        let ctx = DeploymentContext::from_toml_str(include_str!("../../../rollgate.example.toml"), &[]).unwrap();
        assert_eq!(ctx.partitions.len(), 2);
        assert_eq!(ctx.load_balancer.mode, BalancerMode::Scripted);
        let registry = crate::InstanceRegistry::from_context(&ctx).unwrap();
        assert_eq!(registry.get("fr-idf").unwrap().engine_hosts.len(), 4);
    }
}
