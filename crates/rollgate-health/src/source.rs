//! Where status reports come from.
//!
//! [`HttpStatusSource`] queries the engine monitor and the front-end
//! coverage endpoint. [`ScriptedStatusSource`] answers from canned
//! sequences and is what the rollout tests drive.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rollgate_core::{DeploymentContext, FrontendSettings, Host, MonitorSettings};
use tracing::debug;

use crate::error::{HealthError, HealthResult};
use crate::probe::{ProbeRequest, http_get_json};
use crate::status::StatusReport;

/// Source of per-instance status reports.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Status of `instance` as seen by the engine monitor on `engine`.
    async fn engine_status(&self, engine: &Host, instance: &str) -> HealthResult<StatusReport>;

    /// Status of `instance` as served by the front-end on `frontend`.
    async fn frontend_status(&self, frontend: &Host, instance: &str) -> HealthResult<StatusReport>;
}

/// Status over HTTP.
#[derive(Debug, Clone)]
pub struct HttpStatusSource {
    monitor: MonitorSettings,
    frontend: FrontendSettings,
}

impl HttpStatusSource {
    pub fn new(monitor: MonitorSettings, frontend: FrontendSettings) -> Self {
        Self { monitor, frontend }
    }

    pub fn from_context(ctx: &DeploymentContext) -> Self {
        Self::new(ctx.monitor.clone(), ctx.frontend.clone())
    }

    pub fn engine_request(&self, engine: &Host, instance: &str) -> ProbeRequest {
        ProbeRequest::new(
            format!("{}:{}", engine.addr(), self.monitor.port),
            format!("/{}/?instance={}", self.monitor.location, instance),
        )
    }

    pub fn frontend_request(&self, frontend: &Host, instance: &str) -> ProbeRequest {
        ProbeRequest::new(
            format!("{}:{}", frontend.addr(), self.frontend.port),
            format!("{}/v1/coverage/{}/status", self.frontend.url_prefix, instance),
        )
        .with_host_header(self.frontend.public_host.clone())
        .with_authorization(self.frontend.token.clone())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.monitor.probe_timeout_ms)
    }

    async fn fetch(&self, request: ProbeRequest) -> HealthResult<StatusReport> {
        let uri = request.uri();
        let value = http_get_json(&request, self.timeout()).await?;
        let report = StatusReport::from_json(value).map_err(|e| HealthError::Decode {
            uri: uri.clone(),
            reason: e.to_string(),
        })?;
        debug!(%uri, status = %report.status, loaded = report.loaded, "status fetched");
        Ok(report)
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn engine_status(&self, engine: &Host, instance: &str) -> HealthResult<StatusReport> {
        self.fetch(self.engine_request(engine, instance)).await
    }

    async fn frontend_status(&self, frontend: &Host, instance: &str) -> HealthResult<StatusReport> {
        self.fetch(self.frontend_request(frontend, instance)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Endpoint {
    Engine,
    Frontend,
}

type Script = VecDeque<Option<StatusReport>>;

/// Canned answers keyed by host and instance.
///
/// Each key holds a sequence; answers are consumed in order and the last
/// one repeats. `None` in a sequence reads as an unreachable endpoint.
/// Keys without a sequence fall back to the default answer.
#[derive(Debug)]
pub struct ScriptedStatusSource {
    scripts: Mutex<HashMap<(Endpoint, String, String), Script>>,
    default: Option<StatusReport>,
    calls: Mutex<Vec<(Host, String)>>,
}

impl ScriptedStatusSource {
    /// Every endpoint answers `default` unless scripted otherwise.
    pub fn new(default: Option<StatusReport>) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script_engine(&self, engine: &Host, instance: &str, answers: Vec<Option<StatusReport>>) {
        self.script(Endpoint::Engine, engine, instance, answers);
    }

    pub fn script_frontend(&self, frontend: &Host, instance: &str, answers: Vec<Option<StatusReport>>) {
        self.script(Endpoint::Frontend, frontend, instance, answers);
    }

    /// Every `(host, instance)` pair queried so far, in order.
    pub fn calls(&self) -> Vec<(Host, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn script(&self, endpoint: Endpoint, host: &Host, instance: &str, answers: Vec<Option<StatusReport>>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(
                (endpoint, host.to_string(), instance.to_string()),
                answers.into(),
            );
        }
    }

    fn answer(&self, endpoint: Endpoint, host: &Host, instance: &str) -> HealthResult<StatusReport> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((host.clone(), instance.to_string()));
        }
        let key = (endpoint, host.to_string(), instance.to_string());
        let answer = match self.scripts.lock() {
            Ok(mut scripts) => match scripts.get_mut(&key) {
                Some(seq) if seq.len() > 1 => seq.pop_front().flatten(),
                Some(seq) => seq.front().cloned().flatten(),
                None => self.default.clone(),
            },
            Err(_) => None,
        };
        answer.ok_or_else(|| HealthError::Unreachable {
            uri: format!("{endpoint:?}://{host}/{instance}"),
            reason: "scripted as unreachable".to_string(),
        })
    }
}

#[async_trait]
impl StatusSource for ScriptedStatusSource {
    async fn engine_status(&self, engine: &Host, instance: &str) -> HealthResult<StatusReport> {
        self.answer(Endpoint::Engine, engine, instance)
    }

    async fn frontend_status(&self, frontend: &Host, instance: &str) -> HealthResult<StatusReport> {
        self.answer(Endpoint::Frontend, frontend, instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_request_targets_monitor() {
        let source = HttpStatusSource::new(MonitorSettings::default(), FrontendSettings::default());
        let req = source.engine_request(&Host::from("root@e1"), "fr-idf");
        assert_eq!(req.uri(), "http://e1:85/monitor-kraken/?instance=fr-idf");
        assert!(req.host_header.is_none());
    }

    #[test]
    fn frontend_request_carries_public_host_and_token() {
        let frontend = FrontendSettings {
            public_host: Some("api.example.org".to_string()),
            url_prefix: "/navitia".to_string(),
            token: Some("tok".to_string()),
            ..FrontendSettings::default()
        };
        let source = HttpStatusSource::new(MonitorSettings::default(), frontend);
        let req = source.frontend_request(&Host::from("root@w1"), "fr-idf");
        assert_eq!(req.uri(), "http://w1:80/navitia/v1/coverage/fr-idf/status");
        assert_eq!(req.host_header.as_deref(), Some("api.example.org"));
        assert_eq!(req.authorization.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn scripted_answers_are_consumed_then_repeat() {
        let source = ScriptedStatusSource::new(None);
        let e1 = Host::from("root@e1");
        source.script_engine(
            &e1,
            "a",
            vec![None, Some(StatusReport::running(false)), Some(StatusReport::running(true))],
        );
        assert!(source.engine_status(&e1, "a").await.is_err());
        assert!(!source.engine_status(&e1, "a").await.unwrap().loaded);
        assert!(source.engine_status(&e1, "a").await.unwrap().loaded);
        assert!(source.engine_status(&e1, "a").await.unwrap().loaded);
        assert!(source.frontend_status(&e1, "a").await.is_err());
        assert_eq!(source.calls().len(), 5);
    }
}
