//! Package installation commands and installed-vs-candidate version checks.

use std::sync::LazyLock;

use regex::Regex;
use rollgate_core::{Host, PackageSettings};
use tracing::{info, warn};

use crate::error::ExecResult;
use crate::executor::{CommandExecutor, shell_quote};

static INSTALLED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Installed:\s*(\S+)").ok());
static CANDIDATE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Candidate:\s*(\S+)").ok());

/// The command installing `packages` on a host.
pub fn install_command(packages: &[String], settings: &PackageSettings) -> String {
    if settings.manual_deploy {
        let debs: Vec<String> = packages
            .iter()
            .map(|p| format!("{}/{}_*.deb", settings.packages_dir, p))
            .collect();
        format!("dpkg -i {}", debs.join(" "))
    } else {
        let names: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
        format!(
            "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y -o Dpkg::Options::=--force-confold {}",
            names.join(" ")
        )
    }
}

/// Installed and candidate versions of one package on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageVersions {
    pub installed: Option<String>,
    pub candidate: Option<String>,
}

impl PackageVersions {
    /// Parse `apt-cache policy <package>` output.
    pub fn parse_policy(output: &str) -> Self {
        let grab = |re: &Option<Regex>| {
            re.as_ref()
                .and_then(|re| re.captures(output))
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .filter(|v| v != "(none)")
        };
        Self {
            installed: grab(&*INSTALLED),
            candidate: grab(&*CANDIDATE),
        }
    }

    /// Whether the installed version is the candidate one.
    pub fn up_to_date(&self) -> bool {
        match (&self.installed, &self.candidate) {
            (Some(i), Some(c)) => same_version(i, c),
            _ => false,
        }
    }
}

/// Compare package versions, semantically when both parse as semver
/// (after dropping a `v` prefix and a Debian revision suffix).
pub fn same_version(a: &str, b: &str) -> bool {
    match (semver_of(a), semver_of(b)) {
        (Some(va), Some(vb)) => va == vb,
        _ => a == b,
    }
}

fn semver_of(raw: &str) -> Option<semver::Version> {
    let trimmed = raw.trim_start_matches('v');
    let core = trimmed
        .split(['~', '+', '-'])
        .next()
        .unwrap_or(trimmed);
    semver::Version::parse(core).ok()
}

/// Query `package` versions on one host.
pub async fn query_versions(
    executor: &dyn CommandExecutor,
    host: &Host,
    package: &str,
) -> ExecResult<PackageVersions> {
    let output = executor
        .run_checked(host, &format!("apt-cache policy {}", shell_quote(package)))
        .await?;
    Ok(PackageVersions::parse_policy(&output.stdout))
}

/// Versions of one package across a set of hosts.
#[derive(Debug, Clone, Default)]
pub struct VersionReport {
    pub package: String,
    pub hosts: Vec<(Host, PackageVersions)>,
}

impl VersionReport {
    pub fn up_to_date(&self) -> bool {
        !self.hosts.is_empty() && self.hosts.iter().all(|(_, v)| v.up_to_date())
    }

    /// Distinct installed versions, in host order.
    pub fn installed(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for (_, v) in &self.hosts {
            let label = v.installed.clone().unwrap_or_else(|| "(none)".to_string());
            if !seen.contains(&label) {
                seen.push(label);
            }
        }
        seen
    }
}

/// Query `package` on every host and log the result.
pub async fn check_versions(
    executor: &dyn CommandExecutor,
    hosts: &[Host],
    package: &str,
) -> ExecResult<VersionReport> {
    let mut report = VersionReport {
        package: package.to_string(),
        hosts: Vec::with_capacity(hosts.len()),
    };
    for host in hosts {
        let versions = query_versions(executor, host, package).await?;
        if versions.up_to_date() {
            info!(%host, package, installed = ?versions.installed, "package up to date");
        } else {
            warn!(
                %host,
                package,
                installed = ?versions.installed,
                candidate = ?versions.candidate,
                "installed version differs from candidate"
            );
        }
        report.hosts.push((host.clone(), versions));
    }
    Ok(report)
}
