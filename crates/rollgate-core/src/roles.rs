//! Hosts, host roles, and rollout partitions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// A remote host, written as an ssh target (`user@address` or `address`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Host(String);

impl Host {
    pub fn new(target: impl Into<String>) -> Self {
        Self(target.into())
    }

    /// The full ssh target.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The network address, without any `user@` prefix.
    pub fn addr(&self) -> &str {
        self.0.rsplit('@').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Host {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The part a host plays in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Data-preparation workers.
    Tyr,
    /// The data-preparation host that owns scheduling and batch jobs.
    TyrMaster,
    /// Database host.
    Db,
    /// Routing-engine hosts.
    Eng,
    /// Front-end request-dispatch hosts.
    Ws,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Tyr, Role::TyrMaster, Role::Db, Role::Eng, Role::Ws];

    /// The package whose version identifies what this role runs.
    pub fn package(&self) -> Option<&'static str> {
        match self {
            Role::Tyr | Role::TyrMaster => Some("navitia-tyr"),
            Role::Eng => Some("navitia-kraken"),
            Role::Ws => Some("navitia-jormungandr"),
            Role::Db => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Tyr => "tyr",
            Role::TyrMaster => "tyr_master",
            Role::Db => "db",
            Role::Eng => "eng",
            Role::Ws => "ws",
        };
        f.write_str(s)
    }
}

/// Hosts per role, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleTable(BTreeMap<Role, Vec<Host>>);

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hosts holding `role`; empty if the role is not declared.
    pub fn hosts(&self, role: Role) -> &[Host] {
        self.0.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set(&mut self, role: Role, hosts: Vec<Host>) {
        self.0.insert(role, hosts);
    }

    /// A copy of this table with `role` bound to `hosts` instead.
    pub fn restricted(&self, role: Role, hosts: &[Host]) -> Self {
        let mut table = self.clone();
        table.set(role, hosts.to_vec());
        table
    }

    /// Hosts holding any of `roles`, deduplicated, first occurrence wins.
    pub fn hosts_for(&self, roles: &[Role]) -> Vec<Host> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for role in roles {
            for host in self.hosts(*role) {
                if seen.insert(host.clone()) {
                    out.push(host.clone());
                }
            }
        }
        out
    }
}

/// A group of hosts upgraded together during one rollout phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPartition {
    /// Routing-engine hosts of this partition.
    #[serde(default)]
    pub engines: Vec<Host>,
    /// Front-end hosts that depend on those engines.
    #[serde(default)]
    pub frontends: Vec<Host>,
}

impl HostPartition {
    pub fn new(engines: Vec<Host>, frontends: Vec<Host>) -> Self {
        Self { engines, frontends }
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty() && self.frontends.is_empty()
    }
}

/// Check that `partitions` are disjoint and together cover the engine and
/// front-end roles exactly.
pub fn validate_partitions(partitions: &[HostPartition], roles: &RoleTable) -> CoreResult<()> {
    if partitions.is_empty() {
        return Ok(());
    }
    check_cover(
        Role::Eng,
        partitions.iter().map(|p| p.engines.as_slice()),
        roles.hosts(Role::Eng),
    )?;
    check_cover(
        Role::Ws,
        partitions.iter().map(|p| p.frontends.as_slice()),
        roles.hosts(Role::Ws),
    )
}

fn check_cover<'a>(
    role: Role,
    groups: impl Iterator<Item = &'a [Host]>,
    declared: &[Host],
) -> CoreResult<()> {
    let mut union = BTreeSet::new();
    for group in groups {
        for host in group {
            if !union.insert(host) {
                return Err(CoreError::config(format!(
                    "host {host} appears in more than one {role} partition"
                )));
            }
        }
    }
    let declared: BTreeSet<&Host> = declared.iter().collect();
    if let Some(extra) = union.difference(&declared).next() {
        return Err(CoreError::config(format!(
            "partition host {extra} is not declared with role {role}"
        )));
    }
    if let Some(missing) = declared.difference(&union).next() {
        return Err(CoreError::config(format!(
            "{role} host {missing} is not in any partition"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(names: &[&str]) -> Vec<Host> {
        names.iter().map(|n| Host::from(*n)).collect()
    }

    fn table() -> RoleTable {
        let mut t = RoleTable::new();
        t.set(Role::Eng, hosts(&["root@e1", "root@e2", "root@e3", "root@e4"]));
        t.set(Role::Ws, hosts(&["root@w1", "root@w2"]));
        t
    }

    #[test]
    fn host_addr_strips_user() {
        assert_eq!(Host::from("root@e1.example.org").addr(), "e1.example.org");
        assert_eq!(Host::from("e1").addr(), "e1");
    }

    #[test]
    fn hosts_for_deduplicates_in_order() {
        let mut t = table();
        t.set(Role::Tyr, hosts(&["root@w2", "root@t1"]));
        let all = t.hosts_for(&[Role::Ws, Role::Tyr]);
        assert_eq!(all, hosts(&["root@w1", "root@w2", "root@t1"]));
    }

    #[test]
    fn restricted_leaves_original_untouched() {
        let t = table();
        let r = t.restricted(Role::Eng, &hosts(&["root@e1"]));
        assert_eq!(r.hosts(Role::Eng).len(), 1);
        assert_eq!(t.hosts(Role::Eng).len(), 4);
    }

    #[test]
    fn valid_partitions_pass() {
        let parts = vec![
            HostPartition::new(hosts(&["root@e1", "root@e2"]), hosts(&["root@w1"])),
            HostPartition::new(hosts(&["root@e3", "root@e4"]), hosts(&["root@w2"])),
        ];
        validate_partitions(&parts, &table()).unwrap();
    }

    #[test]
    fn overlapping_partitions_rejected() {
        let parts = vec![
            HostPartition::new(hosts(&["root@e1", "root@e2"]), hosts(&["root@w1"])),
            HostPartition::new(hosts(&["root@e2", "root@e3", "root@e4"]), hosts(&["root@w2"])),
        ];
        let err = validate_partitions(&parts, &table()).unwrap_err();
        assert!(err.to_string().contains("more than one"));
    }

    #[test]
    fn incomplete_partitions_rejected() {
        let parts = vec![
            HostPartition::new(hosts(&["root@e1"]), hosts(&["root@w1"])),
            HostPartition::new(hosts(&["root@e3", "root@e4"]), hosts(&["root@w2"])),
        ];
        let err = validate_partitions(&parts, &table()).unwrap_err();
        assert!(err.to_string().contains("root@e2"));
    }

    #[test]
    fn undeclared_partition_host_rejected() {
        let parts = vec![HostPartition::new(
            hosts(&["root@e1", "root@e2", "root@e3", "root@e4", "root@e9"]),
            hosts(&["root@w1", "root@w2"]),
        )];
        assert!(validate_partitions(&parts, &table()).is_err());
    }
}
