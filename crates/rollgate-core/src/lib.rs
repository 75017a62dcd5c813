//! rollgate-core: topology model and deployment context for rollgate.
//!
//! Everything the rollout engine needs to know about a platform is loaded
//! once from a TOML file into an immutable [`DeploymentContext`]. Logical
//! instances (routing regions) are resolved from their declarations into
//! [`Instance`] values and kept in an [`InstanceRegistry`].
//!
//! # Components
//!
//! - **`roles`**: hosts, role table, and rollout partitions
//! - **`config`**: settings sections of the platform file
//! - **`context`**: loading, overrides, and validation
//! - **`instance`**: instance declarations, address resolution, registry
//! - **`error`**: configuration error taxonomy

pub mod config;
pub mod context;
pub mod error;
pub mod instance;
pub mod roles;

pub use config::*;
pub use context::DeploymentContext;
pub use error::{CoreError, CoreResult};
pub use instance::{
    DbCredentials, DeploymentMode, EngineSelector, Instance, InstanceDecl, InstanceRef,
    InstanceRegistry, ZmqAddress,
};
pub use roles::{Host, HostPartition, Role, RoleTable};
