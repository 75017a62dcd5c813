//! In-memory executor that records every command.
//!
//! Answers come from rules (substring match, optionally per host) that are
//! consumed in order with the last answer repeating. With service
//! simulation on, unmatched `start`/`stop`/`status` commands update and
//! report a per-host service table instead.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rollgate_core::Host;

use crate::error::ExecResult;
use crate::executor::{CommandExecutor, CommandOutput};
use crate::lifecycle::{ServiceCommand, ServiceState, parse_service_command};

struct Rule {
    pattern: String,
    host: Option<Host>,
    answers: VecDeque<CommandOutput>,
}

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    calls: Vec<(Host, String)>,
    services: HashMap<(Host, String), bool>,
}

/// Recording fake for [`CommandExecutor`].
#[derive(Default)]
pub struct RecordingExecutor {
    state: Mutex<State>,
    simulate_services: bool,
}

impl RecordingExecutor {
    /// Every command succeeds with empty output unless a rule says otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Like [`RecordingExecutor::new`], with services tracked per host.
    /// Services start out stopped.
    pub fn simulating_services() -> Self {
        Self {
            state: Mutex::new(State::default()),
            simulate_services: true,
        }
    }

    /// Answer commands containing `pattern` with `output`.
    pub fn on(&self, pattern: &str, output: CommandOutput) {
        self.push_rule(pattern, None, vec![output]);
    }

    /// Answer commands containing `pattern` with `outputs` in turn.
    pub fn on_seq(&self, pattern: &str, outputs: Vec<CommandOutput>) {
        self.push_rule(pattern, None, outputs);
    }

    /// Answer commands containing `pattern` on `host` only.
    pub fn on_host(&self, host: &Host, pattern: &str, outputs: Vec<CommandOutput>) {
        self.push_rule(pattern, Some(host.clone()), outputs);
    }

    pub fn set_running(&self, host: &Host, service: &str, running: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.services.insert((host.clone(), service.to_string()), running);
        }
    }

    pub fn is_running(&self, host: &Host, service: &str) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.services.get(&(host.clone(), service.to_string())).copied())
            .unwrap_or(false)
    }

    pub fn calls(&self) -> Vec<(Host, String)> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Commands containing `pattern`, on any host.
    pub fn count(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|(_, c)| c.contains(pattern)).count()
    }

    pub fn count_on(&self, host: &Host, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(h, c)| h == host && c.contains(pattern))
            .count()
    }

    fn push_rule(&self, pattern: &str, host: Option<Host>, answers: Vec<CommandOutput>) {
        if let Ok(mut state) = self.state.lock() {
            state.rules.push(Rule {
                pattern: pattern.to_string(),
                host,
                answers: answers.into(),
            });
        }
    }

    fn answer(&self, state: &mut State, host: &Host, command: &str) -> CommandOutput {
        // Host-specific rules win over global ones.
        let matching = |r: &Rule, with_host: bool| {
            command.contains(&r.pattern) && (r.host.as_ref() == Some(host) || (!with_host && r.host.is_none()))
        };
        let index = state
            .rules
            .iter()
            .position(|r| matching(r, true))
            .or_else(|| state.rules.iter().position(|r| matching(r, false)));
        if let Some(rule) = index.and_then(|i| state.rules.get_mut(i)) {
            let answer = if rule.answers.len() > 1 {
                rule.answers.pop_front()
            } else {
                rule.answers.front().cloned()
            };
            return answer.unwrap_or_default();
        }

        if self.simulate_services {
            match parse_service_command(command) {
                Some(ServiceCommand::Action(name, desired)) => {
                    state
                        .services
                        .insert((host.clone(), name), desired == ServiceState::Started);
                }
                Some(ServiceCommand::Status(name)) => {
                    let running = state.services.get(&(host.clone(), name)).copied().unwrap_or(false);
                    return if running {
                        CommandOutput::ok("running")
                    } else {
                        CommandOutput::failed(3, "stopped")
                    };
                }
                None => {}
            }
        }
        CommandOutput::default()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(&self, host: &Host, command: &str) -> ExecResult<CommandOutput> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.calls.push((host.clone(), command.to_string()));
        Ok(self.answer(&mut state, host, command))
    }
}
