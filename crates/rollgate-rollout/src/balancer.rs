//! Load-balancer port.
//!
//! The sequencer only asks for nodes to be enabled or disabled. How that
//! happens depends on the platform: a scripted command per node, an
//! operator doing it by hand, or nothing at all when no balancer fronts
//! the fleet.

use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rollgate_core::{BalancerMode, DeploymentContext, Host};
use rollgate_exec::CommandExecutor;
use tracing::{info, warn};

use crate::error::{RolloutError, RolloutResult};

/// Rotation state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// In rotation, receiving traffic.
    Enabled,
    /// Out of rotation.
    Disabled,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Enabled => f.write_str("enable"),
            NodeState::Disabled => f.write_str("disable"),
        }
    }
}

#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Put `nodes` in `state`. Nodes already in that state are fine.
    async fn set_state(&self, nodes: &[Host], state: NodeState) -> RolloutResult<()>;

    /// Whether traffic actually goes through this balancer. When it does
    /// not, a rollout runs as a single pass.
    fn manages_traffic(&self) -> bool {
        true
    }
}

/// Runs the configured enable or disable command once per node, on the
/// machine running rollgate. `{node}` in the command is replaced by the
/// node address.
pub struct ScriptedBalancer {
    executor: Arc<dyn CommandExecutor>,
    runner: Host,
    disable_command: String,
    enable_command: String,
    dry_run: bool,
}

impl ScriptedBalancer {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        disable_command: impl Into<String>,
        enable_command: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            runner: Host::new("localhost"),
            disable_command: disable_command.into(),
            enable_command: enable_command.into(),
            dry_run: false,
        }
    }

    /// Log node changes without running them.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn command_for(&self, node: &Host, state: NodeState) -> String {
        let template = match state {
            NodeState::Enabled => &self.enable_command,
            NodeState::Disabled => &self.disable_command,
        };
        template.replace("{node}", node.addr())
    }
}

#[async_trait]
impl LoadBalancer for ScriptedBalancer {
    async fn set_state(&self, nodes: &[Host], state: NodeState) -> RolloutResult<()> {
        for node in nodes {
            let command = self.command_for(node, state);
            if self.dry_run {
                info!(node = %node, action = %state, %command, "dry run, balancer unchanged");
                continue;
            }
            let output = self.executor.run(&self.runner, &command).await?;
            if !output.success() {
                return Err(RolloutError::Balancer {
                    action: state.to_string(),
                    node: node.to_string(),
                    reason: output.stderr.trim().to_string(),
                });
            }
            info!(node = %node, action = %state, "balancer updated");
        }
        Ok(())
    }
}

/// Someone who can act on an instruction and say when it is done.
#[async_trait]
pub trait OperatorPort: Send + Sync {
    /// Show `instruction` and wait. `false` means the operator refused.
    async fn acknowledge(&self, instruction: &str) -> bool;
}

/// Asks on the controlling terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalOperator;

#[async_trait]
impl OperatorPort for TerminalOperator {
    async fn acknowledge(&self, instruction: &str) -> bool {
        let prompt = format!("{instruction}\nType 'done' when finished, anything else aborts: ");
        tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{prompt}");
            let _ = stderr.flush();
            let mut answer = String::new();
            if std::io::stdin().lock().read_line(&mut answer).is_err() {
                return false;
            }
            answer.trim().eq_ignore_ascii_case("done")
        })
        .await
        .unwrap_or(false)
    }
}

/// Answers every instruction the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedOperator(pub bool);

#[async_trait]
impl OperatorPort for FixedOperator {
    async fn acknowledge(&self, instruction: &str) -> bool {
        info!(instruction, acknowledged = self.0, "operator instruction");
        self.0
    }
}

/// Hands every node change to an operator.
pub struct ManualBalancer {
    operator: Arc<dyn OperatorPort>,
}

impl ManualBalancer {
    pub fn new(operator: Arc<dyn OperatorPort>) -> Self {
        Self { operator }
    }
}

#[async_trait]
impl LoadBalancer for ManualBalancer {
    async fn set_state(&self, nodes: &[Host], state: NodeState) -> RolloutResult<()> {
        if nodes.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = nodes.iter().map(Host::addr).collect();
        let instruction = format!("Please {state} these nodes on the load balancer: {}", names.join(", "));
        if self.operator.acknowledge(&instruction).await {
            Ok(())
        } else {
            warn!(action = %state, nodes = ?names, "operator refused the balancer change");
            Err(RolloutError::NotConfirmed(instruction))
        }
    }
}

/// No balancer in front of the fleet.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBalancer;

#[async_trait]
impl LoadBalancer for NoBalancer {
    async fn set_state(&self, _nodes: &[Host], _state: NodeState) -> RolloutResult<()> {
        Ok(())
    }

    fn manages_traffic(&self) -> bool {
        false
    }
}

/// In-memory balancer that remembers node states and every change.
#[derive(Debug, Default)]
pub struct RecordingBalancer {
    states: Mutex<HashMap<Host, NodeState>>,
    events: Mutex<Vec<(NodeState, Vec<Host>)>>,
    fail_on: Mutex<Option<(Host, NodeState)>>,
}

impl RecordingBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail whenever `node` is put in `state`.
    pub fn fail_on(&self, node: &Host, state: NodeState) {
        if let Ok(mut f) = self.fail_on.lock() {
            *f = Some((node.clone(), state));
        }
    }

    /// Last state set on `node`, `None` if never touched.
    pub fn state(&self, node: &Host) -> Option<NodeState> {
        self.states.lock().ok().and_then(|s| s.get(node).copied())
    }

    pub fn events(&self) -> Vec<(NodeState, Vec<Host>)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LoadBalancer for RecordingBalancer {
    async fn set_state(&self, nodes: &[Host], state: NodeState) -> RolloutResult<()> {
        let failing = self.fail_on.lock().ok().and_then(|f| f.clone());
        if let Some((node, s)) = failing {
            if s == state && nodes.contains(&node) {
                return Err(RolloutError::Balancer {
                    action: state.to_string(),
                    node: node.to_string(),
                    reason: "rejected".to_string(),
                });
            }
        }
        if let Ok(mut states) = self.states.lock() {
            for node in nodes {
                states.insert(node.clone(), state);
            }
        }
        if let Ok(mut events) = self.events.lock() {
            events.push((state, nodes.to_vec()));
        }
        Ok(())
    }
}

/// The balancer a platform is configured for. `manual` forces the
/// operator-driven variant even when commands are configured.
pub fn balancer_for(
    ctx: &DeploymentContext,
    executor: Arc<dyn CommandExecutor>,
    operator: Arc<dyn OperatorPort>,
    manual: bool,
) -> Arc<dyn LoadBalancer> {
    let lb = &ctx.load_balancer;
    if !lb.enabled {
        return Arc::new(NoBalancer);
    }
    match (&lb.mode, &lb.disable_command, &lb.enable_command) {
        (BalancerMode::Scripted, Some(disable), Some(enable)) if !manual => Arc::new(
            ScriptedBalancer::new(executor, disable.clone(), enable.clone()).dry_run(ctx.dry_run),
        ),
        _ => Arc::new(ManualBalancer::new(operator)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_core::{LoadBalancerSettings, RoleTable};
    use rollgate_exec::{CommandOutput, RecordingExecutor};

    fn nodes() -> Vec<Host> {
        vec![Host::from("root@e1"), Host::from("root@e2")]
    }

    #[tokio::test]
    async fn scripted_runs_one_command_per_node() {
        let exec = Arc::new(RecordingExecutor::new());
        let lb = ScriptedBalancer::new(exec.clone(), "lbctl disable {node}", "lbctl enable {node}");
        lb.set_state(&nodes(), NodeState::Disabled).await.unwrap();
        let calls: Vec<String> = exec.calls().into_iter().map(|(_, c)| c).collect();
        assert_eq!(calls, vec!["lbctl disable e1", "lbctl disable e2"]);
    }

    #[tokio::test]
    async fn scripted_failure_names_the_node() {
        let exec = Arc::new(RecordingExecutor::new());
        exec.on("lbctl enable e2", CommandOutput::failed(1, "unknown node"));
        let lb = ScriptedBalancer::new(exec, "lbctl disable {node}", "lbctl enable {node}");
        let err = lb.set_state(&nodes(), NodeState::Enabled).await.unwrap_err();
        assert!(err.to_string().contains("root@e2"));
        assert!(err.to_string().contains("unknown node"));
    }

    #[tokio::test]
    async fn dry_run_executes_nothing() {
        let exec = Arc::new(RecordingExecutor::new());
        let lb = ScriptedBalancer::new(exec.clone(), "d {node}", "e {node}").dry_run(true);
        lb.set_state(&nodes(), NodeState::Enabled).await.unwrap();
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn manual_balancer_needs_the_operator() {
        let lb = ManualBalancer::new(Arc::new(FixedOperator(false)));
        assert!(matches!(
            lb.set_state(&nodes(), NodeState::Disabled).await,
            Err(RolloutError::NotConfirmed(_))
        ));
        let lb = ManualBalancer::new(Arc::new(FixedOperator(true)));
        lb.set_state(&nodes(), NodeState::Disabled).await.unwrap();
    }

    #[test]
    fn selection_follows_configuration() {
        let exec: Arc<dyn CommandExecutor> = Arc::new(RecordingExecutor::new());
        let op: Arc<dyn OperatorPort> = Arc::new(FixedOperator(true));
        let mut ctx = DeploymentContext::for_roles("t", RoleTable::new());
        assert!(!balancer_for(&ctx, exec.clone(), op.clone(), false).manages_traffic());

        ctx.load_balancer = LoadBalancerSettings {
            enabled: true,
            mode: BalancerMode::Scripted,
            disable_command: Some("d {node}".into()),
            enable_command: Some("e {node}".into()),
        };
        assert!(balancer_for(&ctx, exec, op, true).manages_traffic());
    }
}
