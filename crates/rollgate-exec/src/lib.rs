//! rollgate-exec: everything rollgate does on a host.
//!
//! Commands go through the [`CommandExecutor`] boundary (ssh, local shell,
//! or the in-memory [`RecordingExecutor`]). On top of it sit the service
//! lifecycle controller, the template hand-off, package commands, and the
//! role-filtered task dispatcher.
//!
//! # Components
//!
//! - **`executor`**: command boundary, ssh and local executors
//! - **`recording`**: recording fake with optional service simulation
//! - **`lifecycle`**: `ensure_state` with retry-until-confirmed and once-per-run cache
//! - **`template`**: hand-off to the external renderer
//! - **`packages`**: install commands and version checks
//! - **`task`**: `Task` and `Dispatcher`

pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod packages;
pub mod recording;
pub mod task;
pub mod template;

pub use error::{ExecError, ExecResult};
pub use executor::{CommandExecutor, CommandOutput, LocalExecutor, SshExecutor, shell_quote};
pub use lifecycle::{EnsureOptions, ServiceController, ServiceManager, ServiceState};
pub use packages::{PackageVersions, VersionReport, check_versions, install_command, same_version};
pub use recording::RecordingExecutor;
pub use task::{Dispatcher, Task, TaskContext};
pub use template::{ExecRenderer, SkipRenderer, TemplateRenderer, renderer_for};
