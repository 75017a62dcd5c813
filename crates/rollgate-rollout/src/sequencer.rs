//! Rollout phase sequencer.
//!
//! Drives the partitions of the fleet through drain, upgrade, verify and
//! reinstate so one partition always serves traffic:
//!
//! ```text
//! Idle ─► Draining(1) ─► Verifying(1) ─► Draining(2) ─► Verifying(2) ─► ... ─► Reinstating ─► Done
//!   └──────────────┴──────────────┴───── any failure ─────┴──────────────────► Aborted
//! ```
//!
//! Entering `Draining(n)` for n > 1 reinstates partition n-1 before
//! draining partition n, engines first then front-ends. A failure stops
//! at the phase it happened in; partitions already drained stay drained.
//! Without a balancer managing traffic the whole fleet runs as a single
//! partition.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollgate_core::{DeploymentContext, Host, HostPartition, Role};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::balancer::{LoadBalancer, NodeState};
use crate::error::{RolloutError, RolloutResult};

/// Where a rollout stands. Partition numbers start at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutPhase {
    Idle,
    Draining(usize),
    Verifying(usize),
    Reinstating,
    Done,
    Aborted { reason: String },
}

impl RolloutPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutPhase::Done | RolloutPhase::Aborted { .. })
    }
}

impl fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutPhase::Idle => f.write_str("idle"),
            RolloutPhase::Draining(n) => write!(f, "draining partition {n}"),
            RolloutPhase::Verifying(n) => write!(f, "verifying partition {n}"),
            RolloutPhase::Reinstating => f.write_str("reinstating"),
            RolloutPhase::Done => f.write_str("done"),
            RolloutPhase::Aborted { reason } => write!(f, "aborted: {reason}"),
        }
    }
}

/// The work done on a partition while it is out of rotation.
#[async_trait]
pub trait PartitionWork: Send + Sync {
    /// Install, reconfigure and restart everything on `partition`.
    async fn upgrade(&self, partition: &HostPartition) -> RolloutResult<()>;

    /// Check the upgraded partition actually serves.
    async fn verify(&self, partition: &HostPartition) -> RolloutResult<()>;

    /// Gracefully reload the front-ends on `hosts`.
    async fn reload_frontends(&self, hosts: &[Host]) -> RolloutResult<()>;
}

/// Final state and timings of a rollout.
#[derive(Debug, Clone)]
pub struct RolloutReport {
    pub phase: RolloutPhase,
    pub history: Vec<RolloutPhase>,
    /// Elapsed time per stage, in execution order.
    pub stages: Vec<(String, Duration)>,
    pub elapsed: Duration,
}

impl RolloutReport {
    pub fn succeeded(&self) -> bool {
        self.phase == RolloutPhase::Done
    }

    pub fn exit_code(&self) -> u8 {
        if self.succeeded() { 0 } else { 1 }
    }

    /// The phase the rollout was in when it aborted.
    pub fn aborted_after(&self) -> Option<&RolloutPhase> {
        match self.phase {
            RolloutPhase::Aborted { .. } => self.history.iter().rev().nth(1),
            _ => None,
        }
    }
}

pub struct RolloutSequencer {
    partitions: Vec<HostPartition>,
    balancer: Arc<dyn LoadBalancer>,
    work: Arc<dyn PartitionWork>,
    phase: RolloutPhase,
    history: Vec<RolloutPhase>,
    stages: Vec<(String, Duration)>,
}

impl RolloutSequencer {
    /// A sequencer over `partitions`. When the balancer does not manage
    /// traffic they are merged into a single pass.
    pub fn new(
        partitions: Vec<HostPartition>,
        balancer: Arc<dyn LoadBalancer>,
        work: Arc<dyn PartitionWork>,
    ) -> Self {
        let partitions = if balancer.manages_traffic() {
            partitions
        } else {
            vec![merge(&partitions)]
        };
        Self {
            partitions,
            balancer,
            work,
            phase: RolloutPhase::Idle,
            history: vec![RolloutPhase::Idle],
            stages: Vec::new(),
        }
    }

    /// A sequencer over the partitions configured for the platform, or a
    /// single partition holding every engine and front-end host when the
    /// rollout does not go through the balancer.
    pub fn from_context(
        ctx: &DeploymentContext,
        balancer: Arc<dyn LoadBalancer>,
        work: Arc<dyn PartitionWork>,
    ) -> RolloutResult<Self> {
        if !balancer.manages_traffic() || ctx.partitions.is_empty() {
            if balancer.manages_traffic() {
                return Err(RolloutError::Core(rollgate_core::CoreError::Configuration(
                    "a load-balanced rollout needs partitions".to_string(),
                )));
            }
            let whole = HostPartition::new(
                ctx.roles.hosts(Role::Eng).to_vec(),
                ctx.roles.hosts(Role::Ws).to_vec(),
            );
            return Ok(Self::new(vec![whole], balancer, work));
        }
        Ok(Self::new(ctx.partitions.clone(), balancer, work))
    }

    pub fn phase(&self) -> &RolloutPhase {
        &self.phase
    }

    pub fn partitions(&self) -> &[HostPartition] {
        &self.partitions
    }

    /// Run every phase. Never returns an error: failures end in
    /// [`RolloutPhase::Aborted`].
    pub async fn run(&mut self) -> RolloutReport {
        let start = Instant::now();
        info!(
            partitions = self.partitions.len(),
            balanced = self.balancer.manages_traffic(),
            "rollout started"
        );

        if let Err(e) = self.drive().await {
            error!(phase = %self.phase, error = %e, "rollout aborted");
            self.enter(RolloutPhase::Aborted {
                reason: e.to_string(),
            });
        }

        let elapsed = start.elapsed();
        for (stage, took) in &self.stages {
            info!(stage = %stage, secs = took.as_secs(), "stage timing");
        }
        info!(phase = %self.phase, secs = elapsed.as_secs(), "rollout finished");
        RolloutReport {
            phase: self.phase.clone(),
            history: self.history.clone(),
            stages: self.stages.clone(),
            elapsed,
        }
    }

    async fn drive(&mut self) -> RolloutResult<()> {
        let total = self.partitions.len();
        for index in 0..total {
            let n = index + 1;
            self.enter(RolloutPhase::Draining(n));
            let stage = Instant::now();
            self.switch_to(index).await?;

            let partition = self.partitions[index].clone();
            self.work.upgrade(&partition).await?;
            self.stages.push((format!("upgrade partition {n}"), stage.elapsed()));

            self.enter(RolloutPhase::Verifying(n));
            let stage = Instant::now();
            self.work.verify(&partition).await?;
            self.stages.push((format!("verify partition {n}"), stage.elapsed()));
        }

        self.enter(RolloutPhase::Reinstating);
        let stage = Instant::now();
        self.reinstate().await?;
        self.stages.push(("reinstate".to_string(), stage.elapsed()));

        self.enter(RolloutPhase::Done);
        Ok(())
    }

    /// Take partition `index` out of rotation, putting the previous one
    /// back first.
    async fn switch_to(&self, index: usize) -> RolloutResult<()> {
        if !self.balancer.manages_traffic() {
            return Ok(());
        }
        let current = &self.partitions[index];
        if index == 0 {
            self.balancer.set_state(&current.engines, NodeState::Disabled).await?;
            // The other front-ends reconnect away from the drained engines.
            let others: Vec<Host> = self.partitions[1..]
                .iter()
                .flat_map(|p| p.frontends.iter().cloned())
                .collect();
            self.work.reload_frontends(&others).await?;
            self.balancer.set_state(&current.frontends, NodeState::Disabled).await?;
            return Ok(());
        }
        let previous = &self.partitions[index - 1];
        self.balancer.set_state(&previous.engines, NodeState::Enabled).await?;
        self.balancer.set_state(&current.engines, NodeState::Disabled).await?;
        self.balancer.set_state(&previous.frontends, NodeState::Enabled).await?;
        self.balancer.set_state(&current.frontends, NodeState::Disabled).await?;
        Ok(())
    }

    /// Put the last partition back, then enable every node and reload
    /// every front-end.
    async fn reinstate(&self) -> RolloutResult<()> {
        if !self.balancer.manages_traffic() {
            return Ok(());
        }
        if let Some(last) = self.partitions.last() {
            self.balancer.set_state(&last.engines, NodeState::Enabled).await?;
            self.balancer.set_state(&last.frontends, NodeState::Enabled).await?;
        }
        let all = merge(&self.partitions);
        self.balancer.set_state(&all.engines, NodeState::Enabled).await?;
        self.balancer.set_state(&all.frontends, NodeState::Enabled).await?;
        for partition in self.partitions.iter().rev() {
            self.work.reload_frontends(&partition.frontends).await?;
        }
        Ok(())
    }

    fn enter(&mut self, phase: RolloutPhase) {
        if self.phase.is_terminal() {
            warn!(from = %self.phase, to = %phase, "ignoring transition out of a terminal phase");
            return;
        }
        info!(from = %self.phase, to = %phase, "rollout phase");
        self.history.push(phase.clone());
        self.phase = phase;
    }
}

fn merge(partitions: &[HostPartition]) -> HostPartition {
    let mut engines: Vec<Host> = Vec::new();
    let mut frontends: Vec<Host> = Vec::new();
    for p in partitions {
        for h in &p.engines {
            if !engines.contains(h) {
                engines.push(h.clone());
            }
        }
        for h in &p.frontends {
            if !frontends.contains(h) {
                frontends.push(h.clone());
            }
        }
    }
    HostPartition::new(engines, frontends)
}
