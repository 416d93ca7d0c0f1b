//! Exception monitor - records every failure with the context of its call
//!
//! Contexts are tracked by request id from the before-hook until the call
//! ends. Failures become [`ExceptionRecord`]s that are shipped to the log
//! backend and kept in a small recent-records cache for local queries.

pub mod panic_capture;

pub use panic_capture::{PanicCapture, PanicReport};

use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::BoundedCache;
use crate::interceptor::{priority, ExceptionAction, Interceptor};
use crate::shipper::{labels, LogShipper};
use crate::types::{
    truncate_chars, CallContext, ContextSnapshot, ExceptionRecord, Severity, ToolFailure,
    ToolOutput, SUMMARY_MAX_CHARS,
};

/// Failure kinds and messages that point at the environment
const HIGH_SEVERITY_MARKERS: &[&str] = &[
    "ioerror",
    "i/o",
    "os error",
    "connection",
    "refused",
    "permission",
    "auth",
    "forbidden",
    "timeout",
    "timed out",
];

/// Failure kinds and messages that point at bad input
const MEDIUM_SEVERITY_MARKERS: &[&str] = &[
    "validation",
    "invalid",
    "parse",
    "valueerror",
    "value error",
    "argument",
    "typeerror",
    "keyerror",
];

/// Monitor tuning
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Capacity of the tracked-context cache (0 disables, -1 unbounded)
    pub context_cache_size: i64,
    /// Capacity of the recent-records cache
    pub recent_records: i64,
    /// Keep a rendering of successful outputs until eviction
    pub track_outputs: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            context_cache_size: 100,
            recent_records: 100,
            track_outputs: false,
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedCall {
    snapshot: ContextSnapshot,
    output: Option<String>,
}

/// Outermost interceptor: captures failures with full call context
pub struct ExceptionMonitor {
    shipper: Arc<LogShipper>,
    contexts: BoundedCache<String, TrackedCall>,
    recent: BoundedCache<u64, ExceptionRecord>,
    track_outputs: bool,
    sequence: AtomicU64,
}

impl ExceptionMonitor {
    pub fn new(shipper: Arc<LogShipper>, settings: MonitorSettings) -> Self {
        Self {
            shipper,
            contexts: BoundedCache::with_limit(settings.context_cache_size),
            recent: BoundedCache::with_limit(settings.recent_records),
            track_outputs: settings.track_outputs,
            sequence: AtomicU64::new(0),
        }
    }

    /// Report a failure for a known request id from outside the chain.
    ///
    /// The tracked context is left in place; the call that owns it may
    /// still complete.
    pub fn capture(&self, request_id: &str, failure: &ToolFailure) -> ExceptionRecord {
        let (context, last_output) = match self.contexts.peek(&request_id.to_string()) {
            Some(tracked) => (tracked.snapshot, tracked.output),
            None => (ContextSnapshot::unknown(request_id), None),
        };
        let record = build_record(request_id, failure, context, last_output, false);
        self.emit(&record);
        record
    }

    /// Record a panic that escaped every wrapped call
    pub fn record_uncaught(&self, failure: &ToolFailure) -> ExceptionRecord {
        let request_id = uuid::Uuid::new_v4().to_string();
        let context = ContextSnapshot::unknown(&request_id);
        let record = build_record(&request_id, failure, context, None, true);
        self.emit(&record);
        record
    }

    /// Most recent records, newest first, optionally for one tool
    pub fn recent_exceptions(&self, tool: Option<&str>, limit: usize) -> Vec<ExceptionRecord> {
        self.recent
            .values()
            .into_iter()
            .filter(|r| tool.map_or(true, |t| r.context.tool_name == t))
            .take(limit)
            .collect()
    }

    /// Number of calls currently tracked
    pub fn tracked_contexts(&self) -> usize {
        self.contexts.size()
    }

    /// Rendering of the output recorded for `request_id`, if any
    pub fn tracked_output(&self, request_id: &str) -> Option<String> {
        self.contexts
            .peek(&request_id.to_string())
            .and_then(|tracked| tracked.output)
    }

    /// Total records captured since creation
    pub fn captured_count(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    fn emit(&self, record: &ExceptionRecord) {
        let mut stream = crate::shipper::label_map([
            (labels::KIND, "exception"),
            (labels::SEVERITY, record.severity.as_str()),
            (labels::EXCEPTION_TYPE, record.exception_type.as_str()),
            (labels::TOOL_NAME, record.context.tool_name.as_str()),
        ]);
        if let Some(workflow_id) = &record.context.workflow_id {
            stream.insert(labels::WORKFLOW_ID.to_string(), workflow_id.clone());
        }
        self.shipper.push(stream, record);

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.recent.put(seq, record.clone());

        debug!(
            "Captured {} {} in '{}' ({})",
            record.severity, record.exception_type, record.context.tool_name, record.request_id
        );
    }
}

impl Interceptor for ExceptionMonitor {
    fn name(&self) -> &str {
        "exception_monitor"
    }

    fn priority(&self) -> i32 {
        priority::EXCEPTION_MONITOR
    }

    fn before_execution(&self, ctx: &mut CallContext) -> Result<()> {
        self.contexts.put(
            ctx.request_id.clone(),
            TrackedCall {
                snapshot: ctx.snapshot(),
                output: None,
            },
        );
        Ok(())
    }

    fn after_execution(&self, output: &mut dyn ToolOutput, ctx: &mut CallContext) -> Result<()> {
        if self.track_outputs {
            let rendered = truncate_chars(&format!("{:?}", output), SUMMARY_MAX_CHARS);
            self.contexts.update(&ctx.request_id, |tracked| {
                tracked.output = Some(rendered);
            });
        } else {
            self.contexts.remove(&ctx.request_id);
        }
        Ok(())
    }

    fn on_exception(&self, failure: &ToolFailure, ctx: &mut CallContext) -> Result<ExceptionAction> {
        let (context, last_output) = match self.contexts.remove(&ctx.request_id) {
            Some(tracked) => (tracked.snapshot, tracked.output),
            None => {
                warn!(
                    "No tracked context for request {} in '{}', recording partial context",
                    ctx.request_id, ctx.tool_name
                );
                let mut snapshot = ctx.snapshot();
                snapshot.partial = true;
                (snapshot, None)
            }
        };

        let record = build_record(&ctx.request_id, failure, context, last_output, false);
        self.emit(&record);
        Ok(ExceptionAction::Propagate)
    }
}

/// Severity for a failure that carries none explicitly
pub fn classify(failure: &ToolFailure) -> Severity {
    if let Some(severity) = failure.severity {
        return severity;
    }
    if failure.panicked {
        return Severity::Critical;
    }

    let kind = failure.kind.to_lowercase();
    let message = failure.message.to_lowercase();
    let mentions = |markers: &[&str]| {
        markers
            .iter()
            .any(|m| kind.contains(m) || message.contains(m))
    };

    if mentions(HIGH_SEVERITY_MARKERS) {
        Severity::High
    } else if mentions(MEDIUM_SEVERITY_MARKERS) {
        Severity::Medium
    } else {
        Severity::Low
    }
}

fn build_record(
    request_id: &str,
    failure: &ToolFailure,
    context: ContextSnapshot,
    last_output: Option<String>,
    uncaught: bool,
) -> ExceptionRecord {
    ExceptionRecord {
        request_id: request_id.to_string(),
        exception_type: failure.kind.clone(),
        message: failure.message.clone(),
        stack_trace: failure.stack_trace.render(),
        severity: classify(failure),
        context,
        captured_at: Utc::now(),
        uncaught,
        details: failure.details.clone(),
        last_output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shipper::{MemorySink, ShipperSettings};
    use serde_json::json;

    fn failure(kind: &str, message: &str) -> ToolFailure {
        ToolFailure {
            kind: kind.to_string(),
            message: message.to_string(),
            details: String::new(),
            stack_trace: "trace".to_string().into(),
            panicked: false,
            severity: None,
        }
    }

    fn monitor_with(settings: MonitorSettings) -> (ExceptionMonitor, Arc<MemorySink>, Arc<LogShipper>) {
        let sink = Arc::new(MemorySink::new());
        let shipper = Arc::new(LogShipper::new(sink.clone(), ShipperSettings::default()));
        (ExceptionMonitor::new(shipper.clone(), settings), sink, shipper)
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&failure("IoError", "disk")), Severity::High);
        assert_eq!(classify(&failure("Error", "connection refused")), Severity::High);
        assert_eq!(classify(&failure("Error", "request timed out")), Severity::High);
        assert_eq!(classify(&failure("ValueError", "bad input")), Severity::Medium);
        assert_eq!(classify(&failure("ParseIntError", "x")), Severity::Medium);
        assert_eq!(classify(&failure("Oops", "something")), Severity::Low);
        assert_eq!(
            classify(&failure("Oops", "something").with_severity(Severity::High)),
            Severity::High
        );

        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(classify(&ToolFailure::from_panic(payload.as_ref(), None)), Severity::Critical);
    }

    #[test]
    fn test_failure_uses_tracked_context() {
        let (monitor, sink, shipper) = monitor_with(MonitorSettings::default());
        let mut ctx = CallContext::new("sum_tool", json!([2, "x"])).with_workflow("wf-7");
        monitor.before_execution(&mut ctx).unwrap();
        assert_eq!(monitor.tracked_contexts(), 1);

        let action = monitor
            .on_exception(&failure("ValueError", "bad input"), &mut ctx)
            .unwrap();
        assert_eq!(action, ExceptionAction::Propagate);
        assert_eq!(monitor.tracked_contexts(), 0);

        shipper.flush().unwrap();
        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        let (stream, payload) = &lines[0];
        assert_eq!(stream.get("exception_type").map(String::as_str), Some("ValueError"));
        assert_eq!(stream.get("tool_name").map(String::as_str), Some("sum_tool"));
        assert_eq!(stream.get("severity").map(String::as_str), Some("medium"));
        assert_eq!(stream.get("workflow_id").map(String::as_str), Some("wf-7"));
        assert_eq!(payload["context"]["partial"], false);
        assert_eq!(payload["context"]["args_summary"], r#"[2,"x"]"#);
        assert_eq!(payload["uncaught"], false);
    }

    #[test]
    fn test_cache_miss_records_partial_context() {
        let (monitor, _sink, shipper) = monitor_with(MonitorSettings {
            context_cache_size: 0,
            ..MonitorSettings::default()
        });
        let mut ctx = CallContext::new("fetch", json!({"url": "x"}));
        monitor.before_execution(&mut ctx).unwrap();
        monitor.on_exception(&failure("Timeout", "slow"), &mut ctx).unwrap();

        let records = monitor.recent_exceptions(None, 10);
        assert_eq!(records.len(), 1);
        assert!(records[0].context.partial);
        assert_eq!(records[0].context.tool_name, "fetch");
        assert_eq!(shipper.buffered(), 1);
    }

    #[test]
    fn test_success_releases_context_unless_tracking_outputs() {
        let (monitor, _, _) = monitor_with(MonitorSettings::default());
        let mut ctx = CallContext::new("t", json!(null));
        monitor.before_execution(&mut ctx).unwrap();
        monitor.after_execution(&mut 5_i64, &mut ctx).unwrap();
        assert_eq!(monitor.tracked_contexts(), 0);

        let (monitor, _, _) = monitor_with(MonitorSettings {
            track_outputs: true,
            ..MonitorSettings::default()
        });
        let mut ctx = CallContext::new("t", json!(null));
        monitor.before_execution(&mut ctx).unwrap();
        monitor.after_execution(&mut "done".to_string(), &mut ctx).unwrap();
        assert_eq!(monitor.tracked_output(&ctx.request_id).as_deref(), Some("\"done\""));
    }

    #[test]
    fn test_capture_by_request_id() {
        let (monitor, _, _) = monitor_with(MonitorSettings::default());
        let mut ctx = CallContext::new("deploy", json!([]));
        monitor.before_execution(&mut ctx).unwrap();

        let record = monitor.capture(&ctx.request_id, &failure("PermissionDenied", "no"));
        assert_eq!(record.context.tool_name, "deploy");
        assert!(!record.context.partial);
        assert_eq!(record.severity, Severity::High);

        let unknown = monitor.capture("missing", &failure("Oops", "?"));
        assert!(unknown.context.partial);
        assert_eq!(unknown.context.tool_name, "unknown");
    }

    #[test]
    fn test_recent_exceptions_newest_first_and_filtered() {
        let (monitor, _, _) = monitor_with(MonitorSettings::default());
        for tool in ["a", "b", "a"] {
            let mut ctx = CallContext::new(tool, json!(null));
            monitor.before_execution(&mut ctx).unwrap();
            monitor
                .on_exception(&failure("Oops", &format!("in {}", tool)), &mut ctx)
                .unwrap();
        }
        assert_eq!(monitor.captured_count(), 3);
        assert_eq!(monitor.recent_exceptions(Some("a"), 10).len(), 2);
        assert_eq!(monitor.recent_exceptions(None, 1)[0].context.tool_name, "a");
    }

    #[test]
    fn test_uncaught_record() {
        let (monitor, _, _) = monitor_with(MonitorSettings::default());
        let payload: Box<dyn std::any::Any + Send> = Box::new("thread died".to_string());
        let record = monitor.record_uncaught(&ToolFailure::from_panic(payload.as_ref(), None));
        assert!(record.uncaught);
        assert_eq!(record.severity, Severity::Critical);
        assert_eq!(record.message, "thread died");
    }
}
