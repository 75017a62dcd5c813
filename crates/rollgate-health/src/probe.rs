//! HTTP JSON probe.
//!
//! One GET over a fresh connection, bounded by a timeout. Connection and
//! timeout failures are reported as [`HealthError::Unreachable`] so the
//! poller can retry them.

use std::time::Duration;

use http_body_util::BodyExt;
use tracing::debug;

use crate::error::{HealthError, HealthResult};

/// A GET request against a status endpoint.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    /// `host:port` to connect to.
    pub address: String,
    /// Path and query.
    pub path: String,
    /// `Host` header; defaults to `address`.
    pub host_header: Option<String>,
    pub authorization: Option<String>,
}

impl ProbeRequest {
    pub fn new(address: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
            host_header: None,
            authorization: None,
        }
    }

    pub fn with_host_header(mut self, host: Option<String>) -> Self {
        self.host_header = host;
        self
    }

    pub fn with_authorization(mut self, token: Option<String>) -> Self {
        self.authorization = token;
        self
    }

    pub fn uri(&self) -> String {
        format!("http://{}{}", self.address, self.path)
    }
}

/// Perform a GET and decode the body as JSON.
pub async fn http_get_json(request: &ProbeRequest, timeout: Duration) -> HealthResult<serde_json::Value> {
    let uri = request.uri();
    let unreachable = |reason: String| HealthError::Unreachable {
        uri: uri.clone(),
        reason,
    };

    let body = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(&request.address)
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| unreachable(format!("handshake: {e}")))?;

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let host = request.host_header.as_deref().unwrap_or(&request.address);
        let mut builder = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", host)
            .header("user-agent", "rollgate/0.1")
            .header("accept", "application/json");
        if let Some(token) = &request.authorization {
            builder = builder.header("authorization", token);
        }
        let req = builder
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| unreachable(format!("invalid request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            debug!(%status, %uri, "status probe non-2xx");
            return Err(HealthError::Status {
                uri: uri.clone(),
                status: status.as_u16(),
            });
        }
        let collected = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| unreachable(format!("reading body: {e}")))?;
        Ok::<_, HealthError>(collected.to_bytes())
    })
    .await
    .map_err(|_| {
        debug!(%uri, "status probe timed out");
        unreachable("timed out".to_string())
    })??;

    serde_json::from_slice(&body).map_err(|e| HealthError::Decode {
        uri: uri.clone(),
        reason: e.to_string(),
    })
}
