//! Shared types used across modules
//!
//! Call contexts, failure descriptions and exception records are used by the
//! interceptor chain, the exception monitor and the performance store, so
//! they live here to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum characters kept for argument and output summaries
pub const SUMMARY_MAX_CHARS: usize = 200;

/// Lifecycle of a single intercepted call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationPhase {
    Pending,
    BeforeHooksRunning,
    Executing,
    AfterHooksRunning,
    Completed,
    ExceptionHooksRunning,
    Suppressed,
    Propagated,
}

impl fmt::Display for InvocationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationPhase::Pending => write!(f, "pending"),
            InvocationPhase::BeforeHooksRunning => write!(f, "before_hooks_running"),
            InvocationPhase::Executing => write!(f, "executing"),
            InvocationPhase::AfterHooksRunning => write!(f, "after_hooks_running"),
            InvocationPhase::Completed => write!(f, "completed"),
            InvocationPhase::ExceptionHooksRunning => write!(f, "exception_hooks_running"),
            InvocationPhase::Suppressed => write!(f, "suppressed"),
            InvocationPhase::Propagated => write!(f, "propagated"),
        }
    }
}

/// One ancestor in an explicit call stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub request_id: String,
    pub tool_name: String,
}

/// Context for one intercepted call, threaded through every hook
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: String,
    pub tool_name: String,
    pub workflow_id: Option<String>,
    pub step_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Summary of positional arguments (JSON arrays and scalars)
    pub args_summary: String,
    /// Summary of named arguments (JSON objects)
    pub kwargs_summary: String,
    /// Full arguments as passed to the wrapped function
    pub args: Value,
    /// Ancestors of this call, outermost first
    pub call_stack: Vec<StackFrame>,
    pub phase: InvocationPhase,
    started: Instant,
    marks: HashMap<&'static str, Instant>,
}

impl CallContext {
    /// Create a root context for `tool_name`
    pub fn new(tool_name: &str, args: Value) -> Self {
        let (args_summary, kwargs_summary) = summarize_args(&args);
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.to_string(),
            workflow_id: None,
            step_id: None,
            started_at: Utc::now(),
            args_summary,
            kwargs_summary,
            args,
            call_stack: Vec::new(),
            phase: InvocationPhase::Pending,
            started: Instant::now(),
            marks: HashMap::new(),
        }
    }

    /// Create a context for a call made from inside `parent`.
    ///
    /// The parent becomes the top of the child's call stack and the workflow
    /// and step identifiers are inherited.
    pub fn child_of(parent: &CallContext, tool_name: &str, args: Value) -> Self {
        let mut ctx = Self::new(tool_name, args);
        ctx.workflow_id = parent.workflow_id.clone();
        ctx.step_id = parent.step_id.clone();
        ctx.call_stack = parent.call_stack.clone();
        ctx.call_stack.push(StackFrame {
            request_id: parent.request_id.clone(),
            tool_name: parent.tool_name.clone(),
        });
        ctx
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Immediate caller, if this call is nested
    pub fn parent(&self) -> Option<&StackFrame> {
        self.call_stack.last()
    }

    /// Time since the context was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record a named instant, e.g. the start of a timed section
    pub fn mark(&mut self, name: &'static str) {
        self.marks.insert(name, Instant::now());
    }

    /// Time since a named mark, or since creation when the mark is missing
    pub fn since_mark(&self, name: &'static str) -> Duration {
        self.marks
            .get(name)
            .map(|at| at.elapsed())
            .unwrap_or_else(|| self.elapsed())
    }

    pub fn has_mark(&self, name: &'static str) -> bool {
        self.marks.contains_key(name)
    }

    /// Serializable view of this context
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            request_id: self.request_id.clone(),
            tool_name: self.tool_name.clone(),
            workflow_id: self.workflow_id.clone(),
            step_id: self.step_id.clone(),
            started_at: self.started_at,
            args_summary: self.args_summary.clone(),
            kwargs_summary: self.kwargs_summary.clone(),
            parent_request_id: self.parent().map(|p| p.request_id.clone()),
            partial: false,
        }
    }
}

/// Serializable subset of a [`CallContext`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub request_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub args_summary: String,
    #[serde(default)]
    pub kwargs_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,
    /// True when the tracked context was not found and this was rebuilt
    #[serde(default)]
    pub partial: bool,
}

impl ContextSnapshot {
    /// Placeholder for a request id with no tracked context
    pub fn unknown(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            tool_name: "unknown".to_string(),
            workflow_id: None,
            step_id: None,
            started_at: Utc::now(),
            args_summary: String::new(),
            kwargs_summary: String::new(),
            parent_request_id: None,
            partial: true,
        }
    }
}

/// How serious a captured failure is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stack trace of a failure; captured traces are symbolized only when rendered
#[derive(Debug, Clone)]
pub enum StackTrace {
    Captured(Arc<Backtrace>),
    Rendered(String),
}

impl StackTrace {
    pub fn capture() -> Self {
        StackTrace::Captured(Arc::new(Backtrace::force_capture()))
    }

    pub fn render(&self) -> String {
        match self {
            StackTrace::Captured(backtrace) => backtrace.to_string(),
            StackTrace::Rendered(text) => text.clone(),
        }
    }
}

impl From<String> for StackTrace {
    fn from(text: String) -> Self {
        StackTrace::Rendered(text)
    }
}

/// A failure observed by the chain: an `Err` from the wrapped function or a panic
#[derive(Debug, Clone)]
pub struct ToolFailure {
    /// Short type name of the error, e.g. `ValueError`, or `panic`
    pub kind: String,
    pub message: String,
    /// Debug rendering of the error value
    pub details: String,
    pub stack_trace: StackTrace,
    pub panicked: bool,
    /// Explicit severity, overriding classification
    pub severity: Option<Severity>,
}

impl ToolFailure {
    /// Describe an error value returned by a wrapped function.
    ///
    /// Type-erased errors (`anyhow::Error`, boxed `dyn Error`) are named after
    /// their root cause rather than the wrapper.
    pub fn from_error<E: fmt::Display + fmt::Debug + 'static>(err: &E) -> Self {
        Self {
            kind: erased_error_kind(err).unwrap_or_else(short_type_name::<E>),
            message: err.to_string(),
            details: format!("{:?}", err),
            stack_trace: StackTrace::capture(),
            panicked: false,
            severity: None,
        }
    }

    /// Describe a panic payload caught while running a wrapped function
    pub fn from_panic(payload: &(dyn Any + Send), stack_trace: Option<String>) -> Self {
        let message = panic_message(payload);
        Self {
            kind: "panic".to_string(),
            details: message.clone(),
            message,
            stack_trace: stack_trace.map_or_else(StackTrace::capture, StackTrace::Rendered),
            panicked: true,
            severity: Some(Severity::Critical),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// Root-cause type name of a type-erased error, `None` for concrete errors
fn erased_error_kind<E: 'static>(err: &E) -> Option<String> {
    let any = err as &dyn Any;
    let root: &(dyn StdError + 'static) = if let Some(e) = any.downcast_ref::<anyhow::Error>() {
        e.root_cause()
    } else if let Some(e) = any.downcast_ref::<Box<dyn StdError + Send + Sync>>() {
        root_source(&**e)
    } else if let Some(e) = any.downcast_ref::<Box<dyn StdError>>() {
        root_source(&**e)
    } else {
        return None;
    };

    if root.is::<std::io::Error>() {
        return Some("IoError".to_string());
    }
    // `ParseIntError { kind: InvalidDigit }` -> `ParseIntError`
    let debug = format!("{:?}", root);
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    let named = name.chars().next().is_some_and(|c| c.is_ascii_uppercase());
    Some(if named { name } else { "Error".to_string() })
}

fn root_source<'a>(mut err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    while let Some(source) = err.source() {
        err = source;
    }
    err
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A captured failure with the context of the call that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub request_id: String,
    pub exception_type: String,
    pub message: String,
    pub stack_trace: String,
    pub severity: Severity,
    pub context: ContextSnapshot,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub uncaught: bool,
    #[serde(default)]
    pub details: String,
    /// Output of the same request id, when output tracking recorded one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<String>,
}

/// Result value seen by after-hooks.
///
/// Implemented for every `Debug + 'static` type, so hooks can render the
/// output and transform it by downcasting.
pub trait ToolOutput: fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: fmt::Debug + 'static> ToolOutput for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Split arguments into positional and named summaries
pub fn summarize_args(args: &Value) -> (String, String) {
    match args {
        Value::Null => (String::new(), String::new()),
        Value::Object(_) => (String::new(), truncate_chars(&args.to_string(), SUMMARY_MAX_CHARS)),
        _ => (truncate_chars(&args.to_string(), SUMMARY_MAX_CHARS), String::new()),
    }
}

/// Truncate to at most `max` characters without splitting a code point
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// `my_crate::errors::ValueError<T>` -> `ValueError`
pub fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Best-effort message extraction from a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
