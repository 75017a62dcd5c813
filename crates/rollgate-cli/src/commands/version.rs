use anyhow::Result;
use rollgate_core::{CoreError, Role};
use rollgate_exec::check_versions;
use tracing::info;

use super::Runtime;

/// Parse a role name as written in the platform file.
pub fn parse_role(s: &str) -> Result<Role, String> {
    Role::ALL
        .into_iter()
        .find(|r| r.to_string() == s)
        .ok_or_else(|| format!("unknown role `{s}`"))
}

/// Log installed and candidate versions of the package `role` runs.
pub async fn show_version(rt: &Runtime, role: Role) -> Result<u8> {
    let package = role
        .package()
        .ok_or_else(|| CoreError::Configuration(format!("role {role} has no versioned package")))?;
    let report = check_versions(rt.executor.as_ref(), rt.ctx.roles.hosts(role), package).await?;
    info!(
        package,
        %role,
        installed = ?report.installed(),
        up_to_date = report.up_to_date(),
        "package versions"
    );
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::exit_code_for;
    use crate::commands::testing::harness;

    #[test]
    fn parses_every_role() {
        for role in Role::ALL {
            assert_eq!(parse_role(&role.to_string()), Ok(role));
        }
        assert!(parse_role("kraken").is_err());
    }

    #[tokio::test]
    async fn queries_each_host_of_the_role() {
        let h = harness(&[]);
        assert_eq!(show_version(&h.rt, Role::Ws).await.unwrap(), 0);
        assert_eq!(h.exec.count("apt-cache policy navitia-jormungandr"), 2);
    }

    #[tokio::test]
    async fn database_role_has_no_package() {
        let h = harness(&[]);
        let err = show_version(&h.rt, Role::Db).await.unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }
}
