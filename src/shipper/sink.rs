//! Log sinks: where pushed batches end up
//!
//! [`HttpLogSink`] speaks the Loki push API. [`MemorySink`] keeps requests in
//! memory for tests and offline runs, [`DiscardSink`] drops them when no
//! backend is configured.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ShipError;

/// Path of the push endpoint relative to the backend base URL
pub const PUSH_PATH: &str = "/loki/api/v1/push";

/// One labelled stream in a push request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushStream {
    pub stream: BTreeMap<String, String>,
    /// `[timestamp_ns, json_payload]` pairs, both as strings
    pub values: Vec<[String; 2]>,
}

/// Body of a push request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub streams: Vec<PushStream>,
}

impl PushRequest {
    pub fn line_count(&self) -> usize {
        self.streams.iter().map(|s| s.values.len()).sum()
    }
}

/// Destination for batched log lines
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send + Sync {
    /// Deliver one batch. An error means nothing is assumed delivered.
    fn push(&self, request: &PushRequest) -> Result<(), ShipError>;

    /// Short name for log messages
    fn name(&self) -> &'static str {
        "sink"
    }
}

/// Pushes batches to a Loki-compatible HTTP endpoint
pub struct HttpLogSink {
    client: reqwest::blocking::Client,
    push_url: String,
    tenant_id: Option<String>,
}

impl HttpLogSink {
    /// Create a sink for the backend at `base_url` (e.g. `http://localhost:3100`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ShipError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            push_url: format!("{}{}", base_url.trim_end_matches('/'), PUSH_PATH),
            tenant_id: None,
        })
    }

    /// Send an `X-Scope-OrgID` header with every push
    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn push_url(&self) -> &str {
        &self.push_url
    }
}

impl LogSink for HttpLogSink {
    fn push(&self, request: &PushRequest) -> Result<(), ShipError> {
        let mut builder = self.client.post(&self.push_url).json(request);
        if let Some(tenant) = &self.tenant_id {
            builder = builder.header("X-Scope-OrgID", tenant);
        }

        let response = builder.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ShipError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Pushed {} log lines to {}", request.line_count(), self.push_url);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Keeps every pushed request in memory
#[derive(Default)]
pub struct MemorySink {
    requests: Mutex<Vec<PushRequest>>,
    failures_remaining: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` pushes fail
    pub fn fail_next(&self, count: usize) {
        *self.failures_remaining.lock() = count;
    }

    pub fn requests(&self) -> Vec<PushRequest> {
        self.requests.lock().clone()
    }

    /// Every delivered line as `(labels, payload)`, in delivery order
    pub fn lines(&self) -> Vec<(BTreeMap<String, String>, serde_json::Value)> {
        let requests = self.requests.lock();
        let mut lines = Vec::new();
        for request in requests.iter() {
            for stream in &request.streams {
                for [_, payload] in &stream.values {
                    let value = serde_json::from_str(payload)
                        .unwrap_or_else(|_| serde_json::Value::String(payload.clone()));
                    lines.push((stream.stream.clone(), value));
                }
            }
        }
        lines
    }

    pub fn line_count(&self) -> usize {
        self.requests.lock().iter().map(|r| r.line_count()).sum()
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
    }
}

impl LogSink for MemorySink {
    fn push(&self, request: &PushRequest) -> Result<(), ShipError> {
        {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ShipError::Unavailable("memory sink set to fail".to_string()));
            }
        }
        self.requests.lock().push(request.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Accepts and drops everything
#[derive(Debug, Default)]
pub struct DiscardSink;

impl LogSink for DiscardSink {
    fn push(&self, request: &PushRequest) -> Result<(), ShipError> {
        trace!("Discarding {} log lines (no backend configured)", request.line_count());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "discard"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> PushRequest {
        let mut labels = BTreeMap::new();
        labels.insert("job".to_string(), "toolwatch".to_string());
        PushRequest {
            streams: vec![PushStream {
                stream: labels,
                values: vec![["1700000000000000000".to_string(), r#"{"a":1}"#.to_string()]],
            }],
        }
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(sample_request()).unwrap();
        assert_eq!(json["streams"][0]["stream"]["job"], "toolwatch");
        assert_eq!(json["streams"][0]["values"][0][0], "1700000000000000000");
        assert_eq!(json["streams"][0]["values"][0][1], r#"{"a":1}"#);
    }

    #[test]
    fn test_memory_sink_failure_toggle() {
        let sink = MemorySink::new();
        sink.fail_next(1);
        assert!(sink.push(&sample_request()).is_err());
        assert!(sink.push(&sample_request()).is_ok());
        assert_eq!(sink.line_count(), 1);
        assert_eq!(sink.lines()[0].1["a"], 1);
    }

    #[test]
    fn test_http_sink_posts_to_push_endpoint() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", PUSH_PATH)
            .match_header("x-scope-orgid", "tenant-a")
            .match_header("content-type", "application/json")
            .with_status(204)
            .create();

        let sink = HttpLogSink::new(&server.url(), Duration::from_secs(5))
            .unwrap()
            .with_tenant(Some("tenant-a".to_string()));
        sink.push(&sample_request()).unwrap();
        mock.assert();
    }

    #[test]
    fn test_http_sink_reports_status_errors() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", PUSH_PATH)
            .with_status(500)
            .with_body("ingester unavailable")
            .create();

        let sink = HttpLogSink::new(&server.url(), Duration::from_secs(5)).unwrap();
        match sink.push(&sample_request()) {
            Err(ShipError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "ingester unavailable");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }
}
