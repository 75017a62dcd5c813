//! rollgate-rollout: rolling upgrades of the routing fleet.
//!
//! The [`RolloutSequencer`] walks the host partitions through drain,
//! upgrade, verify and reinstate against a [`LoadBalancer`]. The actual
//! work on a partition is behind [`PartitionWork`]; [`FleetWork`] does it
//! over real hosts.
//!
//! # Components
//!
//! - **`balancer`**: load-balancer port (scripted, manual, none, recording)
//! - **`sequencer`**: rollout phase state machine and report
//! - **`fleet`**: partition upgrade and front-end verification
//! - **`restart`**: engine restart pass with optional load wait
//! - **`rebinarize`**: instance discovery and the watched data rebuild batch
//! - **`rollback`**: data backup, rollback, binary re-pointing

pub mod balancer;
pub mod error;
pub mod fleet;
pub mod rebinarize;
pub mod restart;
pub mod rollback;
pub mod sequencer;

pub use balancer::{
    FixedOperator, LoadBalancer, ManualBalancer, NoBalancer, NodeState, OperatorPort,
    RecordingBalancer, ScriptedBalancer, TerminalOperator, balancer_for,
};
pub use error::{RolloutError, RolloutResult};
pub use fleet::{FleetOptions, FleetWork};
pub use rebinarize::{Discovery, RebinarizeReport, Rebinarizer};
pub use restart::{EngineRestarter, RestartSummary};
pub use rollback::{BackupOutcome, backup_data, repoint_binary, rollback_data};
pub use sequencer::{PartitionWork, RolloutPhase, RolloutReport, RolloutSequencer};
