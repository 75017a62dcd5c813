//! Stall watchdog for long batch runs.
//!
//! A background task samples, once per interval, how many job processes
//! are visible on the hosts running the batch. After `stall_samples`
//! consecutive samples with none, it asks its [`ConfirmationPort`] whether
//! to abort. A "no" resets the counter; a "yes" flags the batch as aborted.
//! Sampling errors, including samples that do not answer within one
//! interval, count neither as progress nor as silence.

use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollgate_core::{Host, StallAction, WatchdogSettings};
use rollgate_exec::CommandExecutor;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BatchError, BatchResult};

/// Counts job processes currently running.
#[async_trait]
pub trait ProcessSampler: Send + Sync {
    async fn sample(&self) -> BatchResult<usize>;
}

/// Counts processes whose command line contains one of `patterns`, summed
/// over `hosts`, using `ps`.
pub struct ExecutorProcessSampler {
    executor: Arc<dyn CommandExecutor>,
    hosts: Vec<Host>,
    patterns: Vec<String>,
}

impl ExecutorProcessSampler {
    pub fn new(executor: Arc<dyn CommandExecutor>, hosts: Vec<Host>, patterns: Vec<String>) -> Self {
        Self {
            executor,
            hosts,
            patterns,
        }
    }

    fn count(&self, ps_output: &str) -> usize {
        ps_output
            .lines()
            .filter(|line| self.patterns.iter().any(|p| line.contains(p.as_str())))
            .count()
    }
}

#[async_trait]
impl ProcessSampler for ExecutorProcessSampler {
    async fn sample(&self) -> BatchResult<usize> {
        let mut total = 0;
        for host in &self.hosts {
            let output = self
                .executor
                .run_checked(host, "ps -eo args=")
                .await
                .map_err(|e| BatchError::Sampling(format!("{host}: {e}")))?;
            total += self.count(&output.stdout);
        }
        Ok(total)
    }
}

/// Decides whether a stalled batch is aborted.
#[async_trait]
pub trait ConfirmationPort: Send + Sync {
    /// Return `true` to abort.
    async fn confirm_abort(&self, message: &str) -> bool;
}

/// Aborts without asking.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConfirm;

#[async_trait]
impl ConfirmationPort for AlwaysConfirm {
    async fn confirm_abort(&self, message: &str) -> bool {
        warn!(%message, "aborting stalled batch");
        true
    }
}

/// Never aborts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverConfirm;

#[async_trait]
impl ConfirmationPort for NeverConfirm {
    async fn confirm_abort(&self, message: &str) -> bool {
        warn!(%message, "batch looks stalled, continuing");
        false
    }
}

/// Asks on the controlling terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

#[async_trait]
impl ConfirmationPort for TerminalPrompt {
    async fn confirm_abort(&self, message: &str) -> bool {
        let prompt = format!("{message}\nAbort the batch? [y/N] ");
        let answer = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{prompt}");
            let _ = stderr.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            _ => {
                warn!("cannot read the operator's answer, not aborting");
                false
            }
        }
    }
}

/// The confirmation port matching a configured stall action.
pub fn port_for(action: StallAction) -> Arc<dyn ConfirmationPort> {
    match action {
        StallAction::Prompt => Arc::new(TerminalPrompt),
        StallAction::Abort => Arc::new(AlwaysConfirm),
        StallAction::Continue => Arc::new(NeverConfirm),
    }
}

/// Stall watchdog configuration and collaborators.
#[derive(Clone)]
pub struct Watchdog {
    sampler: Arc<dyn ProcessSampler>,
    port: Arc<dyn ConfirmationPort>,
    interval: Duration,
    stall_samples: u32,
}

impl Watchdog {
    pub fn new(
        sampler: Arc<dyn ProcessSampler>,
        port: Arc<dyn ConfirmationPort>,
        interval: Duration,
        stall_samples: u32,
    ) -> Self {
        Self {
            sampler,
            port,
            interval,
            stall_samples: stall_samples.max(1),
        }
    }

    pub fn from_settings(
        settings: &WatchdogSettings,
        sampler: Arc<dyn ProcessSampler>,
        port: Arc<dyn ConfirmationPort>,
    ) -> Self {
        Self::new(
            sampler,
            port,
            Duration::from_secs(settings.interval_secs),
            settings.stall_samples,
        )
    }

    /// Spawn the sampling loop. It runs until the handle is stopped or
    /// dropped, or until an abort is confirmed.
    pub fn start(&self) -> WatchdogHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(None);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_loop(shutdown_rx, abort_tx).await;
        });
        info!(
            interval_secs = self.interval.as_secs(),
            stall_samples = self.stall_samples,
            "watchdog started"
        );
        WatchdogHandle {
            handle: Some(handle),
            shutdown_tx,
            abort_rx,
        }
    }

    async fn run_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
        abort_tx: watch::Sender<Option<String>>,
    ) {
        let mut silent = 0u32;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("watchdog shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            // A sample gets one interval to answer.
            let sampled = tokio::time::timeout(self.interval, self.sampler.sample())
                .await
                .unwrap_or_else(|_| {
                    Err(BatchError::Sampling(format!("no answer within {:?}", self.interval)))
                });
            match sampled {
                Ok(0) => {
                    silent += 1;
                    warn!(silent, of = self.stall_samples, "no batch process observed");
                }
                Ok(processes) => {
                    debug!(processes, "batch processes observed");
                    silent = 0;
                }
                Err(e) => {
                    warn!(error = %e, "process sampling failed");
                    continue;
                }
            }

            if silent >= self.stall_samples {
                let message = format!(
                    "no batch process observed for {silent} samples ({:?} apart)",
                    self.interval
                );
                if self.port.confirm_abort(&message).await {
                    let _ = abort_tx.send(Some(message));
                    return;
                }
                info!("abort declined, watching again");
                silent = 0;
            }
        }
    }
}

/// Running watchdog. Dropping it stops the sampling loop.
pub struct WatchdogHandle {
    handle: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    abort_rx: watch::Receiver<Option<String>>,
}

impl WatchdogHandle {
    /// Resolve with the abort reason once an abort is confirmed. Never
    /// resolves if the watchdog ends any other way.
    pub async fn aborted(&mut self) -> String {
        loop {
            if let Some(reason) = self.abort_rx.borrow_and_update().clone() {
                return reason;
            }
            if self.abort_rx.changed().await.is_err() {
                if let Some(reason) = self.abort_rx.borrow().clone() {
                    return reason;
                }
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("watchdog stopped");
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers a scripted sequence of samples, then repeats the last one.
    pub(crate) struct ScriptedSampler {
        answers: Mutex<VecDeque<Option<usize>>>,
        pub(crate) calls: AtomicUsize,
    }

    impl ScriptedSampler {
        pub(crate) fn new(answers: Vec<Option<usize>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ProcessSampler for ScriptedSampler {
        async fn sample(&self) -> BatchResult<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            let next = if answers.len() > 1 {
                answers.pop_front().flatten()
            } else {
                answers.front().copied().flatten()
            };
            next.ok_or_else(|| BatchError::Sampling("ssh failed".into()))
        }
    }

    /// Counts prompts and answers with a fixed decision.
    pub(crate) struct CountingPort {
        pub(crate) prompts: AtomicUsize,
        abort: bool,
    }

    impl CountingPort {
        pub(crate) fn new(abort: bool) -> Self {
            Self {
                prompts: AtomicUsize::new(0),
                abort,
            }
        }
    }

    #[async_trait]
    impl ConfirmationPort for CountingPort {
        async fn confirm_abort(&self, _message: &str) -> bool {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            self.abort
        }
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn three_silent_samples_trigger_abort() {
        let sampler = Arc::new(ScriptedSampler::new(vec![Some(0)]));
        let port = Arc::new(CountingPort::new(true));
        let watchdog = Watchdog::new(sampler.clone(), port.clone(), MINUTE, 3);

        let start = tokio::time::Instant::now();
        let mut handle = watchdog.start();
        let reason = handle.aborted().await;

        assert!(reason.contains("3 samples"));
        assert_eq!(start.elapsed(), 3 * MINUTE);
        assert_eq!(port.prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_the_counter() {
        let sampler = Arc::new(ScriptedSampler::new(vec![
            Some(0),
            Some(0),
            Some(2),
            Some(0),
            Some(0),
            Some(0),
        ]));
        let port = Arc::new(CountingPort::new(true));
        let watchdog = Watchdog::new(sampler.clone(), port.clone(), MINUTE, 3);

        let start = tokio::time::Instant::now();
        let mut handle = watchdog.start();
        handle.aborted().await;
        assert_eq!(start.elapsed(), 6 * MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn declining_resets_and_keeps_watching() {
        let sampler = Arc::new(ScriptedSampler::new(vec![Some(0)]));
        let port = Arc::new(CountingPort::new(false));
        let watchdog = Watchdog::new(sampler.clone(), port.clone(), MINUTE, 3);

        let handle = watchdog.start();
        tokio::time::sleep(7 * MINUTE).await;
        assert_eq!(port.prompts.load(Ordering::SeqCst), 2);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_errors_are_not_silence() {
        let sampler = Arc::new(ScriptedSampler::new(vec![Some(0), None, Some(0), None, Some(0)]));
        let port = Arc::new(CountingPort::new(true));
        let watchdog = Watchdog::new(sampler.clone(), port.clone(), MINUTE, 3);

        let start = tokio::time::Instant::now();
        let mut handle = watchdog.start();
        handle.aborted().await;
        assert_eq!(start.elapsed(), 5 * MINUTE);
    }

    /// Hangs on the first sample, then reports no process.
    struct StuckOnceSampler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProcessSampler for StuckOnceSampler {
        async fn sample(&self) -> BatchResult<usize> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_sample_times_out_as_an_error() {
        let sampler = Arc::new(StuckOnceSampler {
            calls: AtomicUsize::new(0),
        });
        let port = Arc::new(CountingPort::new(true));
        let watchdog = Watchdog::new(sampler.clone(), port.clone(), MINUTE, 3);

        let start = tokio::time::Instant::now();
        let mut handle = watchdog.start();
        handle.aborted().await;
        assert_eq!(start.elapsed(), 5 * MINUTE);
        assert_eq!(sampler.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_sampling() {
        let sampler = Arc::new(ScriptedSampler::new(vec![Some(1)]));
        let watchdog = Watchdog::new(sampler.clone(), Arc::new(NeverConfirm), MINUTE, 3);

        let handle = watchdog.start();
        tokio::time::sleep(2 * MINUTE + Duration::from_secs(1)).await;
        drop(handle);
        let seen = sampler.calls.load(Ordering::SeqCst);
        assert_eq!(seen, 2);

        tokio::time::sleep(10 * MINUTE).await;
        assert_eq!(sampler.calls.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn ps_sampler_counts_matching_lines() {
        let exec = Arc::new(rollgate_exec::RecordingExecutor::new());
        exec.on(
            "ps -eo args=",
            rollgate_exec::CommandOutput::ok("/usr/bin/python\n/usr/bin/ed2nav --input x\nosm2ed -i y\nbash\n"),
        );
        let sampler = ExecutorProcessSampler::new(
            exec,
            vec![Host::from("root@t1"), Host::from("root@t2")],
            vec!["ed2".to_string(), "2ed".to_string()],
        );
        assert_eq!(sampler.sample().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn ps_failure_is_a_sampling_error() {
        let exec = Arc::new(rollgate_exec::RecordingExecutor::new());
        exec.on_host(
            &Host::from("root@t2"),
            "ps -eo args=",
            vec![rollgate_exec::CommandOutput::failed(255, "connection refused")],
        );
        let sampler = ExecutorProcessSampler::new(
            exec,
            vec![Host::from("root@t1"), Host::from("root@t2")],
            vec!["ed2".to_string()],
        );
        let err = sampler.sample().await.unwrap_err();
        assert!(matches!(&err, BatchError::Sampling(msg) if msg.contains("root@t2")));
    }
}
