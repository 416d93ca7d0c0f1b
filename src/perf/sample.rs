//! Performance samples and the process-wide sampling mode

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// How much detail the performance store records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerfMode {
    /// Minimal samples: tool, parameter digest, timing
    Normal,
    /// Detailed samples with resource usage and call linkage
    Optimization,
}

impl PerfMode {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            PerfMode::Normal => 0,
            PerfMode::Optimization => 1,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PerfMode::Optimization,
            _ => PerfMode::Normal,
        }
    }
}

impl fmt::Display for PerfMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerfMode::Normal => write!(f, "normal"),
            PerfMode::Optimization => write!(f, "optimization"),
        }
    }
}

/// One recorded tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PerformanceSample {
    Minimal {
        tool: String,
        params_digest: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Detailed {
        tool: String,
        request_id: String,
        params: Value,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        duration_ms: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory_mb: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cpu_pct: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool: Option<String>,
        #[serde(default)]
        child_tools: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl PerformanceSample {
    pub fn tool(&self) -> &str {
        match self {
            PerformanceSample::Minimal { tool, .. } | PerformanceSample::Detailed { tool, .. } => tool,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        match self {
            PerformanceSample::Minimal { start, .. } | PerformanceSample::Detailed { start, .. } => *start,
        }
    }

    /// Duration in milliseconds; derived from the timestamps for minimal samples
    pub fn duration_ms(&self) -> f64 {
        match self {
            PerformanceSample::Minimal { start, end, .. } => {
                (*end - *start).num_microseconds().unwrap_or(0) as f64 / 1000.0
            }
            PerformanceSample::Detailed { duration_ms, .. } => *duration_ms,
        }
    }

    pub fn is_detailed(&self) -> bool {
        matches!(self, PerformanceSample::Detailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_tag_on_the_wire() {
        let start = Utc::now();
        let sample = PerformanceSample::Minimal {
            tool: "sum_tool".to_string(),
            params_digest: "[2,3]".to_string(),
            start,
            end: start + chrono::Duration::milliseconds(15),
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["kind"], "minimal");
        assert_eq!(json["tool"], "sum_tool");
        assert!((sample.duration_ms() - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_detailed_defaults_when_fields_missing() {
        let line = json!({
            "kind": "detailed",
            "tool": "fetch",
            "request_id": "r1",
            "params": {"url": "x"},
            "start": "2024-01-01T00:00:00Z",
            "end": "2024-01-01T00:00:01Z",
            "duration_ms": 1000.0
        });
        let sample: PerformanceSample = serde_json::from_value(line).unwrap();
        assert!(sample.is_detailed());
        assert_eq!(sample.tool(), "fetch");
        match sample {
            PerformanceSample::Detailed { child_tools, parent_tool, .. } => {
                assert!(child_tools.is_empty());
                assert!(parent_tool.is_none());
            }
            PerformanceSample::Minimal { .. } => unreachable!(),
        }
    }

    #[test]
    fn test_mode_roundtrip_through_atomic_repr() {
        assert_eq!(PerfMode::from_u8(PerfMode::Optimization.as_u8()), PerfMode::Optimization);
        assert_eq!(PerfMode::from_u8(7), PerfMode::Normal);
    }
}
