//! Role-filtered tasks.
//!
//! A [`Task`] names the roles it applies to; the [`Dispatcher`] resolves
//! those roles to hosts from its role table and runs the task on each,
//! either one host after the other or as a concurrent broadcast.

use std::fmt;
use std::sync::Arc;

use rollgate_core::{DeploymentContext, Host, Role, RoleTable};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::{ExecError, ExecResult};

pub type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ExecResult<()>> + Send>>;

/// Body of a task, run once per target host.
pub type TaskFn = Arc<dyn Fn(TaskContext) -> BoxFuture + Send + Sync>;

/// What a task body gets to work with.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub host: Host,
    pub ctx: Arc<DeploymentContext>,
}

/// A named unit of remote work bound to a set of roles.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub roles: Vec<Role>,
    run: TaskFn,
}

impl Task {
    pub fn new<F, Fut>(name: &str, roles: &[Role], f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ExecResult<()>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            roles: roles.to_vec(),
            run: Arc::new(move |tc| Box::pin(f(tc))),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

/// Resolves task roles to hosts and runs tasks on them.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    ctx: Arc<DeploymentContext>,
    roles: RoleTable,
}

impl Dispatcher {
    pub fn new(ctx: Arc<DeploymentContext>) -> Self {
        let roles = ctx.roles.clone();
        Self { ctx, roles }
    }

    /// Dispatch against `roles` instead of the platform's role table.
    pub fn with_roles(ctx: Arc<DeploymentContext>, roles: RoleTable) -> Self {
        Self { ctx, roles }
    }

    pub fn targets(&self, task: &Task) -> Vec<Host> {
        self.roles.hosts_for(&task.roles)
    }

    /// Run `task` on its hosts one after the other, stopping at the first
    /// failure.
    pub async fn run(&self, task: &Task) -> ExecResult<()> {
        for host in self.targets(task) {
            debug!(task = %task.name, %host, "running task");
            (task.run)(self.task_context(host)).await?;
        }
        Ok(())
    }

    /// Run `task` on all its hosts at once and wait for every one of them.
    ///
    /// Returns the first failure in host order once all hosts are done.
    pub async fn broadcast(&self, task: &Task) -> ExecResult<()> {
        let targets = self.targets(task);
        info!(task = %task.name, hosts = targets.len(), "broadcasting task");

        let mut set = JoinSet::new();
        for (index, host) in targets.iter().enumerate() {
            let fut = (task.run)(self.task_context(host.clone()));
            set.spawn(async move { (index, fut.await) });
        }

        let mut failures: Vec<(usize, ExecError)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((index, Err(e))) => {
                    error!(task = %task.name, host = %targets[index], error = %e, "task failed");
                    failures.push((index, e));
                }
                Err(join_error) => {
                    error!(task = %task.name, error = %join_error, "task panicked");
                    failures.push((
                        usize::MAX,
                        ExecError::Task {
                            task: task.name.clone(),
                            host: "unknown".to_string(),
                            reason: join_error.to_string(),
                        },
                    ));
                }
            }
        }
        failures.sort_by_key(|(index, _)| *index);
        match failures.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }

    fn task_context(&self, host: Host) -> TaskContext {
        TaskContext {
            host,
            ctx: self.ctx.clone(),
        }
    }
}
