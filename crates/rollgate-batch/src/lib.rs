//! rollgate-batch: bounded parallel job pool with a stall watchdog.
//!
//! Used for the data rebuild pass, where one job per instance runs a long
//! external binarization and a frozen job leaves no other trace than the
//! absence of its processes.
//!
//! # Components
//!
//! - **`pool`**: `JobPool`, residual tracking, watched batches
//! - **`watchdog`**: process sampler, stall counter, abort confirmation

pub mod error;
pub mod pool;
pub mod watchdog;

pub use error::{BatchError, BatchResult};
pub use pool::{BatchOutcome, JobPool, JobStatus};
pub use watchdog::{
    AlwaysConfirm, ConfirmationPort, ExecutorProcessSampler, NeverConfirm, ProcessSampler,
    TerminalPrompt, Watchdog, WatchdogHandle, port_for,
};
