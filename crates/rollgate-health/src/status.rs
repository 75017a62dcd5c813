//! Status documents returned by engine monitors and front-ends, and the
//! readiness predicates built on them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of one instance as reported by an engine monitor or front-end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// `running`, `no_data`, `dead`, `timeout`, ...
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub loaded: bool,
    #[serde(default, alias = "is_connected_to_rabbitmq")]
    pub connected_to_broker: bool,
    #[serde(default)]
    pub publication_date: Option<String>,
    #[serde(default)]
    pub kraken_version: Option<String>,
    /// Error message some front-ends return instead of a status.
    #[serde(default)]
    pub message: Option<String>,
}

impl StatusReport {
    pub fn running(loaded: bool) -> Self {
        Self {
            status: "running".to_string(),
            loaded,
            connected_to_broker: true,
            ..Self::default()
        }
    }

    pub fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn is_timeout(&self) -> bool {
        self.status == "timeout"
    }

    /// Unwrap a front-end coverage status (`{"status": {...}}`) or read an
    /// engine monitor document as is.
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        match value {
            serde_json::Value::Object(mut map) if map.get("status").is_some_and(|s| s.is_object()) => {
                let inner = map.remove("status").unwrap_or_default();
                serde_json::from_value(inner)
            }
            other => serde_json::from_value(other),
        }
    }
}

/// Readiness predicate over a [`StatusReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The process answers with `running`.
    Running,
    /// The process answers with `running` and has its data loaded.
    Loaded,
}

impl Readiness {
    pub fn accepts(&self, report: &StatusReport) -> bool {
        match self {
            Readiness::Running => report.is_running() && report.message.is_none(),
            Readiness::Loaded => report.is_running() && report.loaded,
        }
    }
}

/// Classification of an instance health check on one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceHealth {
    Ok,
    NoData,
    NotRunning(String),
    NotConnected,
    NotLoaded,
    Unreachable(String),
}

impl InstanceHealth {
    /// Classify a report. `expect_loaded` makes missing data a failure.
    pub fn classify(report: &StatusReport, expect_loaded: bool) -> Self {
        if !report.is_running() {
            if report.status == "no_data" {
                return InstanceHealth::NoData;
            }
            return InstanceHealth::NotRunning(report.status.clone());
        }
        if !report.connected_to_broker {
            return InstanceHealth::NotConnected;
        }
        if expect_loaded && !report.loaded {
            return InstanceHealth::NotLoaded;
        }
        InstanceHealth::Ok
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, InstanceHealth::Ok)
    }
}

impl fmt::Display for InstanceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceHealth::Ok => f.write_str("ok"),
            InstanceHealth::NoData => f.write_str("no data loaded"),
            InstanceHealth::NotRunning(status) => write!(f, "not running (status {status})"),
            InstanceHealth::NotConnected => f.write_str("not connected to the broker"),
            InstanceHealth::NotLoaded => f.write_str("data not loaded"),
            InstanceHealth::Unreachable(reason) => write!(f, "unreachable: {reason}"),
        }
    }
}

/// Whether one engine replica counts as dead for the fleet threshold.
pub fn is_dead(report: Option<&StatusReport>) -> bool {
    match report {
        None => true,
        Some(r) => r.is_timeout() || !r.loaded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_monitor_document() {
        let body = serde_json::json!({
            "status": "running",
            "loaded": true,
            "is_connected_to_rabbitmq": true,
            "publication_date": "20240101T101010",
            "kraken_version": "v15.2.0"
        });
        let report = StatusReport::from_json(body).unwrap();
        assert!(report.is_running());
        assert!(report.connected_to_broker);
        assert_eq!(report.kraken_version.as_deref(), Some("v15.2.0"));
        assert!(Readiness::Loaded.accepts(&report));
    }

    #[test]
    fn unwraps_frontend_coverage_status() {
        let body = serde_json::json!({
            "status": {"status": "running", "loaded": true, "is_connected_to_rabbitmq": true}
        });
        let report = StatusReport::from_json(body).unwrap();
        assert!(report.is_running());
        assert!(report.loaded);
    }

    #[test]
    fn message_only_document_is_not_ready() {
        let body = serde_json::json!({"message": "unknown coverage"});
        let report = StatusReport::from_json(body).unwrap();
        assert!(!Readiness::Running.accepts(&report));
    }

    #[test]
    fn running_predicate_is_looser_than_loaded() {
        let report = StatusReport::running(false);
        assert!(Readiness::Running.accepts(&report));
        assert!(!Readiness::Loaded.accepts(&report));
    }

    #[test]
    fn classify_order() {
        assert_eq!(
            InstanceHealth::classify(&StatusReport::with_status("no_data"), true),
            InstanceHealth::NoData
        );
        assert_eq!(
            InstanceHealth::classify(&StatusReport::with_status("dead"), false),
            InstanceHealth::NotRunning("dead".to_string())
        );
        let mut disconnected = StatusReport::running(true);
        disconnected.connected_to_broker = false;
        assert_eq!(InstanceHealth::classify(&disconnected, true), InstanceHealth::NotConnected);
        assert_eq!(
            InstanceHealth::classify(&StatusReport::running(false), true),
            InstanceHealth::NotLoaded
        );
        assert!(InstanceHealth::classify(&StatusReport::running(false), false).is_ok());
    }

    #[test]
    fn dead_replicas() {
        assert!(is_dead(None));
        assert!(is_dead(Some(&StatusReport::with_status("timeout"))));
        assert!(is_dead(Some(&StatusReport::running(false))));
        assert!(!is_dead(Some(&StatusReport::running(true))));
    }
}
