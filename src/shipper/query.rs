//! Range queries against the log-aggregation backend
//!
//! Used by analyzers to pull recent exception and variance records back out
//! of Loki. Lines are returned raw; callers decode them with
//! [`QueriedLine::decode`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::error::QueryError;

pub const QUERY_RANGE_PATH: &str = "/loki/api/v1/query_range";

/// Builds a stream selector such as `{job="toolwatch",tool_name="sum_tool"}`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    matchers: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `label` to equal `value`
    pub fn eq(mut self, label: &str, value: &str) -> Self {
        self.matchers.insert(label.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .matchers
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
            .collect();
        write!(f, "{{{}}}", parts.join(","))
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// One raw line returned by a range query
#[derive(Debug, Clone, PartialEq)]
pub struct QueriedLine {
    pub labels: BTreeMap<String, String>,
    pub timestamp_ns: i64,
    pub line: String,
}

impl QueriedLine {
    /// Decode the JSON payload of this line
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueryError> {
        Ok(serde_json::from_str(&self.line)?)
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    data: QueryData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    #[serde(default)]
    result: Vec<QueryStream>,
}

#[derive(Debug, Deserialize)]
struct QueryStream {
    #[serde(default)]
    stream: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<[String; 2]>,
}

/// Blocking client for `query_range`
pub struct LokiQuery {
    client: reqwest::blocking::Client,
    base_url: String,
    tenant_id: Option<String>,
}

impl LokiQuery {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, QueryError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tenant_id: None,
        })
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Fetch lines matching `selector` between `start` and `end`, newest first
    pub fn query_range(
        &self,
        selector: &LabelSelector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<QueriedLine>, QueryError> {
        let url = format!("{}{}", self.base_url, QUERY_RANGE_PATH);
        let params = [
            ("query", selector.to_string()),
            ("start", to_ns(start).to_string()),
            ("end", to_ns(end).to_string()),
            ("limit", limit.to_string()),
            ("direction", "backward".to_string()),
        ];

        let mut builder = self.client.get(&url).query(&params);
        if let Some(tenant) = &self.tenant_id {
            builder = builder.header("X-Scope-OrgID", tenant);
        }

        let response = builder.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }

        let body: QueryResponse = response
            .json()
            .map_err(|e| QueryError::Decode(e.to_string()))?;
        if body.status != "success" {
            return Err(QueryError::Decode(format!("query status '{}'", body.status)));
        }
        if body.data.result_type != "streams" {
            return Err(QueryError::Decode(format!(
                "expected streams result, got '{}'",
                body.data.result_type
            )));
        }

        let mut lines = Vec::new();
        for stream in body.data.result {
            for [ts, line] in stream.values {
                let timestamp_ns = ts
                    .parse::<i64>()
                    .map_err(|e| QueryError::Decode(format!("bad timestamp '{}': {}", ts, e)))?;
                lines.push(QueriedLine {
                    labels: stream.stream.clone(),
                    timestamp_ns,
                    line,
                });
            }
        }
        lines.sort_by(|a, b| b.timestamp_ns.cmp(&a.timestamp_ns));
        lines.truncate(limit);

        debug!("Query {} returned {} lines", selector, lines.len());
        Ok(lines)
    }

    /// Lines for `selector` from the last `window`
    pub fn query_recent(
        &self,
        selector: &LabelSelector,
        window: chrono::Duration,
        limit: usize,
    ) -> Result<Vec<QueriedLine>, QueryError> {
        let end = Utc::now();
        let start = end.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.query_range(selector, start, end, limit)
    }
}

fn to_ns(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt()
        .unwrap_or_else(|| at.timestamp_micros().saturating_mul(1_000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[test]
    fn test_selector_formatting_and_escaping() {
        let selector = LabelSelector::new()
            .eq("job", "toolwatch")
            .eq("tool_name", "say \"hi\"");
        assert_eq!(
            selector.to_string(),
            r#"{job="toolwatch",tool_name="say \"hi\""}"#
        );
        assert_eq!(LabelSelector::new().to_string(), "{}");
    }

    #[test]
    fn test_query_range_decodes_streams() {
        let mut server = mockito::Server::new();
        let body = json!({
            "status": "success",
            "data": {
                "resultType": "streams",
                "result": [
                    {
                        "stream": {"job": "toolwatch", "tool_name": "sum_tool"},
                        "values": [
                            ["1700000000000000001", "{\"exception_type\":\"ValueError\"}"],
                            ["1700000000000000003", "{\"exception_type\":\"IoError\"}"]
                        ]
                    },
                    {
                        "stream": {"job": "toolwatch", "tool_name": "sum_tool", "severity": "high"},
                        "values": [["1700000000000000002", "{\"exception_type\":\"Timeout\"}"]]
                    }
                ]
            }
        });
        let mock = server
            .mock("GET", QUERY_RANGE_PATH)
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("query".into(), r#"{tool_name="sum_tool"}"#.into()),
                Matcher::UrlEncoded("limit".into(), "10".into()),
                Matcher::UrlEncoded("direction".into(), "backward".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create();

        let client = LokiQuery::new(&server.url(), Duration::from_secs(5)).unwrap();
        let selector = LabelSelector::new().eq("tool_name", "sum_tool");
        let lines = client
            .query_recent(&selector, chrono::Duration::hours(1), 10)
            .unwrap();
        mock.assert();

        assert_eq!(lines.len(), 3);
        let stamps: Vec<i64> = lines.iter().map(|l| l.timestamp_ns).collect();
        assert_eq!(
            stamps,
            vec![1700000000000000003, 1700000000000000002, 1700000000000000001]
        );
        let first: serde_json::Value = lines[0].decode().unwrap();
        assert_eq!(first["exception_type"], "IoError");
        assert_eq!(lines[1].labels.get("severity").map(String::as_str), Some("high"));
    }

    #[test]
    fn test_query_range_status_error() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("GET", QUERY_RANGE_PATH)
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body("parse error")
            .create();

        let client = LokiQuery::new(&server.url(), Duration::from_secs(5)).unwrap();
        let err = client
            .query_recent(&LabelSelector::new().eq("job", "x"), chrono::Duration::minutes(5), 5)
            .unwrap_err();
        assert!(matches!(err, QueryError::Status { status: 400, .. }));
    }
}
