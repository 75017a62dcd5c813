//! Service lifecycle control.
//!
//! [`ServiceController::ensure_state`] issues one start or stop command and
//! then polls the service status until it matches, bounded by a
//! [`RetryPolicy`]. Only the confirmation is retried, never the command.
//!
//! With `only_once` set the whole operation runs at most once per
//! `(action, host, service)` key until [`ServiceController::reset_run`]
//! clears the cache; later calls return the memoized result.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use rollgate_core::{Host, RetryPolicy};
use rollgate_health::{PollError, poll_until_ready};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::error::{ExecError, ExecResult};
use crate::executor::CommandExecutor;

/// Desired state of an OS service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Running, as reported by the status command.
    Started,
    /// Not running.
    Stopped,
}

impl ServiceState {
    fn verb(&self) -> &'static str {
        match self {
            ServiceState::Started => "start",
            ServiceState::Stopped => "stop",
        }
    }

    fn running(&self) -> bool {
        matches!(self, ServiceState::Started)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// How an `ensure_state` call behaves.
#[derive(Debug, Clone, Copy)]
pub struct EnsureOptions {
    pub policy: RetryPolicy,
    /// Run at most once per run for the same service, host, and action.
    pub only_once: bool,
    /// Return an error instead of `Ok(false)` when confirmation fails.
    pub raise: bool,
}

impl EnsureOptions {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            only_once: false,
            raise: false,
        }
    }

    pub fn only_once(mut self, only_once: bool) -> Self {
        self.only_once = only_once;
        self
    }

    pub fn raising(mut self, raise: bool) -> Self {
        self.raise = raise;
        self
    }
}

/// Service manager command syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceManager {
    SysV,
    Systemd,
}

impl ServiceManager {
    pub fn from_systemd_flag(use_systemd: bool) -> Self {
        if use_systemd {
            ServiceManager::Systemd
        } else {
            ServiceManager::SysV
        }
    }

    pub fn action_command(&self, service: &str, state: ServiceState) -> String {
        match self {
            ServiceManager::SysV => format!("service {service} {}", state.verb()),
            ServiceManager::Systemd => format!("systemctl {} {service}", state.verb()),
        }
    }

    /// Graceful reload, used for the front-end web server.
    pub fn reload_command(&self, service: &str) -> String {
        match self {
            ServiceManager::SysV => format!("service {service} reload"),
            ServiceManager::Systemd => format!("systemctl reload {service}"),
        }
    }

    /// Exits 0 when the service is running.
    pub fn status_command(&self, service: &str) -> String {
        match self {
            ServiceManager::SysV => format!("service {service} status"),
            ServiceManager::Systemd => format!("systemctl is-active --quiet {service}"),
        }
    }
}

/// A service command recognised in a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCommand {
    Action(String, ServiceState),
    Status(String),
}

/// Recognise the commands produced by [`ServiceManager`].
pub fn parse_service_command(command: &str) -> Option<ServiceCommand> {
    let words: Vec<&str> = command.split_whitespace().collect();
    match words.as_slice() {
        ["service", name, "start"] | ["systemctl", "start", name] => {
            Some(ServiceCommand::Action(name.to_string(), ServiceState::Started))
        }
        ["service", name, "stop"] | ["systemctl", "stop", name] => {
            Some(ServiceCommand::Action(name.to_string(), ServiceState::Stopped))
        }
        ["service", name, "status"] | ["systemctl", "is-active", "--quiet", name] => {
            Some(ServiceCommand::Status(name.to_string()))
        }
        _ => None,
    }
}

type Confirmation = Result<(), String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OnceKey {
    action: ServiceState,
    host: Host,
    args: String,
}

impl OnceKey {
    fn new(action: ServiceState, host: &Host, service: &str) -> Self {
        Self {
            action,
            host: host.clone(),
            args: hex::encode(Sha256::digest(service.as_bytes())),
        }
    }
}

/// Starts and stops services, with an opt-in once-per-run cache.
pub struct ServiceController {
    executor: Arc<dyn CommandExecutor>,
    manager: ServiceManager,
    once: Mutex<HashMap<OnceKey, Arc<OnceCell<Confirmation>>>>,
}

impl ServiceController {
    pub fn new(executor: Arc<dyn CommandExecutor>, manager: ServiceManager) -> Self {
        Self {
            executor,
            manager,
            once: Mutex::new(HashMap::new()),
        }
    }

    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    pub fn manager(&self) -> ServiceManager {
        self.manager
    }

    /// Forget every memoized result. Called at the start of each
    /// top-level run.
    pub fn reset_run(&self) {
        if let Ok(mut once) = self.once.lock() {
            debug!(entries = once.len(), "once-per-run cache cleared");
            once.clear();
        }
    }

    /// Whether `service` currently runs on `host`.
    pub async fn is_running(&self, host: &Host, service: &str) -> ExecResult<bool> {
        let output = self
            .executor
            .run(host, &self.manager.status_command(service))
            .await?;
        Ok(output.success())
    }

    /// Bring `service` on `host` to `desired`.
    pub async fn ensure_state(
        &self,
        host: &Host,
        service: &str,
        desired: ServiceState,
        opts: EnsureOptions,
    ) -> ExecResult<bool> {
        if !opts.only_once {
            let confirmation = self.apply(host, service, desired, &opts).await?;
            return self.settle(host, service, desired, &opts, confirmation);
        }

        let cell = {
            let mut once = self.once.lock().map_err(|_| ExecError::ServiceState {
                service: service.to_string(),
                host: host.to_string(),
                action: desired.to_string(),
                reason: "once-per-run cache poisoned".to_string(),
            })?;
            once.entry(OnceKey::new(desired, host, service))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        if cell.initialized() {
            debug!(%host, service, action = %desired, "already done this run");
        }
        // Failed confirmations are cached too; only executor errors leave
        // the cell empty.
        let confirmation = cell
            .get_or_try_init(|| self.apply(host, service, desired, &opts))
            .await?
            .clone();
        self.settle(host, service, desired, &opts, confirmation)
    }

    /// Stop then start `service` on `host`.
    pub async fn restart(
        &self,
        host: &Host,
        service: &str,
        stop: EnsureOptions,
        start: EnsureOptions,
    ) -> ExecResult<bool> {
        let stopped = self.ensure_state(host, service, ServiceState::Stopped, stop).await?;
        let started = self.ensure_state(host, service, ServiceState::Started, start).await?;
        Ok(stopped && started)
    }

    /// Issue the command and poll for the state. The inner `Err` carries
    /// why confirmation failed.
    async fn apply(
        &self,
        host: &Host,
        service: &str,
        desired: ServiceState,
        opts: &EnsureOptions,
    ) -> ExecResult<Confirmation> {
        let command = self.manager.action_command(service, desired);
        let output = self.executor.run(host, &command).await?;
        if !output.success() {
            warn!(%host, service, action = %desired, code = output.exit_code, "service command exited non-zero");
        }

        let want = desired.running();
        let confirmed = poll_until_ready(
            &opts.policy,
            || self.is_running(host, service),
            |running| *running == want,
        )
        .await;

        Ok(match confirmed {
            Ok(_) => {
                info!(%host, service, action = %desired, "service confirmed");
                Ok(())
            }
            Err(PollError::RetryExhausted { attempts, elapsed, .. }) => Err(format!(
                "state not reached after {attempts} checks in {elapsed:?}"
            )),
            Err(PollError::ProbeFailed { reason, .. }) => Err(reason),
        })
    }

    /// Turn a confirmation into the caller's form: an error when raising,
    /// `Ok(false)` otherwise.
    fn settle(
        &self,
        host: &Host,
        service: &str,
        desired: ServiceState,
        opts: &EnsureOptions,
        confirmation: Confirmation,
    ) -> ExecResult<bool> {
        match confirmation {
            Ok(()) => Ok(true),
            Err(reason) if opts.raise => Err(ExecError::ServiceState {
                service: service.to_string(),
                host: host.to_string(),
                action: desired.to_string(),
                reason,
            }),
            Err(reason) => {
                error!(%host, service, action = %desired, %reason, "service {desired} failed");
                Ok(false)
            }
        }
    }
}

impl fmt::Debug for ServiceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceController")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}
