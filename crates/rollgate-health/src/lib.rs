//! rollgate-health: readiness polling and fleet health for rollgate.
//!
//! Restarted engines and front-ends are confirmed ready by polling their
//! HTTP status endpoints with a bounded retry. After a rollout the whole
//! fleet is evaluated against the dead-instance threshold.
//!
//! # Architecture
//!
//! ```text
//! poll_until_ready(policy, probe, predicate)
//!   └── probe = StatusSource::{engine_status, frontend_status}
//!         ├── HttpStatusSource → http_get_json() → StatusReport
//!         └── ScriptedStatusSource (canned answers)
//! check_instance / verify_instance → InstanceHealth per replica
//! evaluate_fleet → FleetOutcome (strict `dead / total > threshold`)
//! ```

pub mod check;
pub mod error;
pub mod poll;
pub mod probe;
pub mod source;
pub mod status;
pub mod threshold;

pub use check::{HostHealth, check_instance, verify_instance, wait_until_loaded};
pub use error::{HealthError, HealthResult, PollError};
pub use poll::poll_until_ready;
pub use probe::{ProbeRequest, http_get_json};
pub use source::{HttpStatusSource, ScriptedStatusSource, StatusSource};
pub use status::{InstanceHealth, Readiness, StatusReport, is_dead};
pub use threshold::{FleetOutcome, evaluate_fleet};
