//! Bounded parallel job pool.
//!
//! `parallelism` workers drain a queue of job ids. A job leaves the
//! outstanding set when its worker returns `Done` or `Excluded`; `Failed`
//! jobs stay outstanding and come back in [`BatchOutcome::residual`] so a
//! caller can rerun just those. One failure never stops the other jobs.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{BatchError, BatchResult};
use crate::watchdog::Watchdog;

/// State of one job in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued, waiting for a free worker.
    Pending,
    /// Picked up by a worker.
    Running,
    /// The worker reported success.
    Done,
    /// No data for this job; skipped without counting as a failure.
    Excluded,
    /// The worker reported failure or panicked.
    Failed,
}

impl JobStatus {
    /// Whether the job no longer needs to run.
    pub fn is_settled(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Excluded)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Excluded => "excluded",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of a batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Jobs still outstanding, in input order.
    pub residual: Vec<String>,
    /// Final status of every job, in input order.
    pub statuses: Vec<(String, JobStatus)>,
    pub elapsed: Duration,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.residual.is_empty()
    }

    pub fn with_status(&self, status: JobStatus) -> Vec<String> {
        self.statuses
            .iter()
            .filter(|(_, s)| *s == status)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Shared per-batch bookkeeping.
struct BatchState {
    jobs: Vec<String>,
    statuses: Mutex<Vec<JobStatus>>,
    queue: Mutex<VecDeque<usize>>,
}

impl BatchState {
    fn new(jobs: Vec<String>) -> Self {
        let n = jobs.len();
        Self {
            jobs,
            statuses: Mutex::new(vec![JobStatus::Pending; n]),
            queue: Mutex::new((0..n).collect()),
        }
    }

    fn next(&self) -> Option<usize> {
        self.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    /// Record a status and return how many jobs are still outstanding.
    fn set(&self, index: usize, status: JobStatus) -> usize {
        match self.statuses.lock() {
            Ok(mut statuses) => {
                if let Some(slot) = statuses.get_mut(index) {
                    *slot = status;
                }
                statuses.iter().filter(|s| !s.is_settled()).count()
            }
            Err(_) => self.jobs.len(),
        }
    }

    fn snapshot(&self) -> Vec<(String, JobStatus)> {
        let statuses = match self.statuses.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        self.jobs.iter().cloned().zip(statuses).collect()
    }

    fn residual(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|(_, s)| !s.is_settled())
            .map(|(id, _)| id)
            .collect()
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Fixed-size pool of concurrent workers.
#[derive(Debug, Clone, Copy)]
pub struct JobPool {
    parallelism: usize,
}

impl JobPool {
    /// A pool of `parallelism` workers; `1` runs jobs strictly in order.
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Run `worker` once per job and wait for all of them.
    pub async fn run_batch<W, Fut>(&self, jobs: Vec<String>, worker: W) -> BatchOutcome
    where
        W: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobStatus> + Send + 'static,
    {
        let state = Arc::new(BatchState::new(jobs));
        let start = Instant::now();
        self.drain(state.clone(), Arc::new(worker)).await;
        self.outcome(&state, start)
    }

    /// Like [`JobPool::run_batch`], with `watchdog` running for the whole
    /// batch. A confirmed stall abort cancels the remaining jobs and returns
    /// [`BatchError::Aborted`] with the jobs that had not completed.
    pub async fn run_batch_watched<W, Fut>(
        &self,
        jobs: Vec<String>,
        worker: W,
        watchdog: &Watchdog,
    ) -> BatchResult<BatchOutcome>
    where
        W: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobStatus> + Send + 'static,
    {
        let state = Arc::new(BatchState::new(jobs));
        let start = Instant::now();
        let mut handle = watchdog.start();

        let result = tokio::select! {
            _ = self.drain(state.clone(), Arc::new(worker)) => Ok(()),
            reason = handle.aborted() => Err(reason),
        };
        handle.stop();

        match result {
            Ok(()) => Ok(self.outcome(&state, start)),
            Err(reason) => {
                let residual = state.residual();
                error!(%reason, left = residual.len(), "batch aborted");
                Err(BatchError::Aborted { residual, reason })
            }
        }
    }

    async fn drain<W, Fut>(&self, state: Arc<BatchState>, worker: Arc<W>)
    where
        W: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobStatus> + Send + 'static,
    {
        let workers = self.parallelism.min(state.jobs.len());
        info!(jobs = state.jobs.len(), workers, "batch started");

        let mut set = JoinSet::new();
        for slot in 0..workers {
            let state = state.clone();
            let worker = worker.clone();
            set.spawn(async move {
                while let Some(index) = state.next() {
                    let id = state.jobs[index].clone();
                    state.set(index, JobStatus::Running);
                    debug!(worker = slot, job = %id, "job started");

                    let job = tokio::spawn((*worker)(id.clone()));
                    let _guard = AbortOnDrop(job.abort_handle());
                    let status = match job.await {
                        Ok(status) => status,
                        Err(e) => {
                            error!(job = %id, error = %e, "job panicked");
                            JobStatus::Failed
                        }
                    };

                    let left = state.set(index, status);
                    match status {
                        JobStatus::Failed => warn!(job = %id, left, "job failed, instances left: {left}"),
                        _ => info!(job = %id, %status, left, "job finished, instances left: {left}"),
                    }
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    fn outcome(&self, state: &BatchState, start: Instant) -> BatchOutcome {
        let statuses = state.snapshot();
        let residual = state.residual();
        let elapsed = start.elapsed();
        if residual.is_empty() {
            info!(elapsed_secs = elapsed.as_secs(), "batch complete");
        } else {
            warn!(left = residual.len(), ?residual, "batch finished with outstanding jobs");
        }
        BatchOutcome {
            residual,
            statuses,
            elapsed,
        }
    }
}
