//! Logical instances (routing regions) and how they are wired to engines.
//!
//! An [`InstanceDecl`] is what the platform file says. [`Instance::resolve`]
//! turns it into an [`Instance`] with a fixed engine address and a private
//! copy of the engine hosts serving it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PathSettings;
use crate::context::DeploymentContext;
use crate::error::{CoreError, CoreResult};
use crate::roles::{Host, Role};

/// How front-ends reach engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// Engines and front-ends share a host and talk over a socket file.
    #[default]
    FileSocket,
    /// Engines listen on a per-instance TCP port.
    Network,
}

/// Which engines serve an instance in network mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EngineSelector {
    /// A single host, or `localhost` for engines co-located with front-ends.
    One(String),
    /// Several replicas behind a virtual address.
    Many(Vec<String>),
}

/// An instance as declared in the platform file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDecl {
    pub name: String,
    pub db_password: String,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub db_user: Option<String>,
    /// Engine port; required unless the platform uses socket files.
    #[serde(default)]
    pub zmq_port: Option<u16>,
    #[serde(default)]
    pub engines: Option<EngineSelector>,
    #[serde(default)]
    pub is_free: bool,
}

impl InstanceDecl {
    pub fn new(name: &str, db_password: &str) -> Self {
        Self {
            name: name.to_string(),
            db_password: db_password.to_string(),
            db_name: None,
            db_user: None,
            zmq_port: None,
            engines: None,
            is_free: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.zmq_port = Some(port);
        self
    }

    pub fn with_engines(mut self, engines: EngineSelector) -> Self {
        self.engines = Some(engines);
        self
    }
}

/// Database credentials of an instance's data-preparation database.
#[derive(Clone, PartialEq, Eq)]
pub struct DbCredentials {
    pub name: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentials")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Shape of the engine address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// IPC socket file on the engine host itself.
    FileSocket,
    /// TCP endpoint served by a single engine host.
    SingleEndpoint,
    /// TCP endpoint on the virtual address, served by several engines.
    MultiHostEndpoint,
}

/// Engine socket as seen from both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZmqAddress {
    pub kind: AddressKind,
    /// What the engine binds.
    pub engine_bind: String,
    /// What the front-end connects to.
    pub frontend_connect: String,
}

/// A resolved logical instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub name: String,
    pub db: DbCredentials,
    pub socket: ZmqAddress,
    /// Copied at resolution time; later role-table changes do not reach it.
    pub engine_hosts: Vec<Host>,
    pub is_free: bool,
    /// No data is available; skipped by restarts and batch jobs.
    pub excluded: bool,
    /// The data-preparation directory did not exist yet.
    pub first_deploy: bool,
}

impl Instance {
    /// Resolve a declaration against the deployment context.
    ///
    /// Precedence: socket-file mode, then an explicit port (with or without
    /// a dedicated engine set). A network-mode instance without a port is a
    /// configuration error.
    pub fn resolve(decl: &InstanceDecl, ctx: &DeploymentContext) -> CoreResult<Self> {
        let (socket, engine_hosts) = resolve_socket(decl, ctx)?;
        let db_default = format!("ed_{}", decl.name.replace('-', "_"));
        debug!(
            instance = %decl.name,
            bind = %socket.engine_bind,
            engines = engine_hosts.len(),
            "resolved instance"
        );
        Ok(Self {
            name: decl.name.clone(),
            db: DbCredentials {
                name: decl.db_name.clone().unwrap_or_else(|| db_default.clone()),
                user: decl.db_user.clone().unwrap_or(db_default),
                password: decl.db_password.clone(),
            },
            socket,
            engine_hosts,
            is_free: decl.is_free,
            excluded: false,
            first_deploy: false,
        })
    }

    /// OS service running this instance's engine.
    pub fn service_name(&self) -> String {
        format!("kraken_{}", self.name)
    }

    pub fn kraken_dir(&self, paths: &PathSettings) -> String {
        format!("{}/{}", paths.kraken_basedir, self.name)
    }

    /// The binarized data file loaded by the engines.
    pub fn data_file(&self, paths: &PathSettings) -> String {
        format!("{}/{}/data.nav.lz4", paths.data_destination_dir, self.name)
    }

    /// Copy of the data file kept for rollback.
    pub fn backup_file(&self, paths: &PathSettings) -> String {
        format!("{}_{}", self.data_file(paths), self.name)
    }

    pub fn ed_dir(&self, paths: &PathSettings) -> String {
        format!("{}/{}", paths.ed_basedir, self.name)
    }

    pub fn serves_on(&self, host: &Host) -> bool {
        self.engine_hosts.contains(host)
    }

    /// Values handed to the configuration template renderer.
    pub fn template_context(&self, paths: &PathSettings) -> serde_json::Value {
        serde_json::json!({
            "instance": {
                "name": self.name,
                "is_free": self.is_free,
                "kraken_engine": self.socket.engine_bind,
                "jormungandr_zmq_socket": self.socket.frontend_connect,
                "kraken_dir": self.kraken_dir(paths),
                "data_file": self.data_file(paths),
                "db_name": self.db.name,
                "db_user": self.db.user,
                "db_password": self.db.password,
            }
        })
    }
}

fn resolve_socket(decl: &InstanceDecl, ctx: &DeploymentContext) -> CoreResult<(ZmqAddress, Vec<Host>)> {
    if ctx.mode == DeploymentMode::FileSocket {
        let path = format!("ipc://{}/{}/kraken.sock", ctx.paths.kraken_basedir, decl.name);
        let socket = ZmqAddress {
            kind: AddressKind::FileSocket,
            engine_bind: path.clone(),
            frontend_connect: path,
        };
        return Ok((socket, ctx.roles.hosts(Role::Eng).to_vec()));
    }

    let Some(port) = decl.zmq_port else {
        return Err(CoreError::config(format!(
            "instance {} must specify a network port",
            decl.name
        )));
    };

    let global = ctx.virtual_address.as_deref();
    let (server, engines, kind) = match &decl.engines {
        Some(EngineSelector::One(server)) if server == "localhost" => (
            server.clone(),
            ctx.roles.hosts(Role::Ws).to_vec(),
            AddressKind::SingleEndpoint,
        ),
        Some(EngineSelector::One(server)) => (
            global.unwrap_or(server).to_string(),
            vec![ctx.ssh_target(server)],
            AddressKind::SingleEndpoint,
        ),
        Some(EngineSelector::Many(servers)) => {
            let Some(vip) = global else {
                return Err(CoreError::config(format!(
                    "instance {} lists several engines but the platform has no virtual_address",
                    decl.name
                )));
            };
            (
                vip.to_string(),
                servers.iter().map(|s| ctx.ssh_target(s)).collect(),
                AddressKind::MultiHostEndpoint,
            )
        }
        None => {
            let Some(vip) = global else {
                return Err(CoreError::config(format!(
                    "instance {} has no engine host and the platform has no virtual_address",
                    decl.name
                )));
            };
            (
                vip.to_string(),
                ctx.roles.hosts(Role::Eng).to_vec(),
                AddressKind::MultiHostEndpoint,
            )
        }
    };

    let socket = ZmqAddress {
        kind,
        engine_bind: format!("tcp://*:{port}"),
        frontend_connect: format!("tcp://{server}:{port}"),
    };
    Ok((socket, engines))
}

/// Either a bare instance name or an already resolved instance.
#[derive(Debug, Clone)]
pub enum InstanceRef {
    Name(String),
    Resolved(Box<Instance>),
}

impl From<&str> for InstanceRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for InstanceRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<Instance> for InstanceRef {
    fn from(instance: Instance) -> Self {
        Self::Resolved(Box::new(instance))
    }
}

/// Resolved instances keyed by name.
///
/// Written at load time and by flag flips from the control thread; never
/// touched from batch workers.
#[derive(Debug, Clone, Default)]
pub struct InstanceRegistry {
    instances: BTreeMap<String, Instance>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every declared instance.
    pub fn from_context(ctx: &DeploymentContext) -> CoreResult<Self> {
        let mut registry = Self::new();
        for decl in &ctx.instances {
            registry.register(Instance::resolve(decl, ctx)?);
        }
        Ok(registry)
    }

    /// Insert an instance. An existing entry with the same name is
    /// replaced and returned.
    pub fn register(&mut self, instance: Instance) -> Option<Instance> {
        self.instances.insert(instance.name.clone(), instance)
    }

    pub fn get(&self, name: &str) -> CoreResult<&Instance> {
        self.instances
            .get(name)
            .ok_or_else(|| CoreError::UnknownInstance(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> CoreResult<&mut Instance> {
        self.instances
            .get_mut(name)
            .ok_or_else(|| CoreError::UnknownInstance(name.to_string()))
    }

    /// Return the instance behind `r`, resolving and registering it from
    /// its declaration the first time a name is seen.
    pub fn resolve(&mut self, r: InstanceRef, ctx: &DeploymentContext) -> CoreResult<Instance> {
        match r {
            InstanceRef::Resolved(instance) => Ok(*instance),
            InstanceRef::Name(name) => {
                if let Some(instance) = self.instances.get(&name) {
                    return Ok(instance.clone());
                }
                let decl = ctx
                    .instances
                    .iter()
                    .find(|d| d.name == name)
                    .ok_or_else(|| CoreError::UnknownInstance(name.clone()))?;
                let instance = Instance::resolve(decl, ctx)?;
                self.register(instance.clone());
                Ok(instance)
            }
        }
    }

    pub fn set_excluded(&mut self, name: &str, excluded: bool) -> CoreResult<()> {
        self.get_mut(name)?.excluded = excluded;
        Ok(())
    }

    pub fn set_first_deploy(&mut self, name: &str, first_deploy: bool) -> CoreResult<()> {
        self.get_mut(name)?.first_deploy = first_deploy;
        Ok(())
    }

    /// Parse `all` or a comma-separated list into known instance names.
    pub fn select(&self, selection: &str) -> CoreResult<Vec<String>> {
        if selection.trim() == "all" {
            return Ok(self.names());
        }
        selection
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|name| self.get(name).map(|i| i.name.clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
