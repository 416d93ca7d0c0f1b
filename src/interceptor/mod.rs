//! Interceptor chain - observes every tool call through ordered hooks
//!
//! Interceptors are registered with priorities and fire in order: before-hooks
//! run lowest priority first, after-hooks in the exact reverse order, and
//! exception-hooks lowest priority first again. A hook that fails or panics
//! is logged and skipped; it never changes the outcome of the wrapped call.

use anyhow::Result;
use parking_lot::RwLock;
use serde_json::Value;
use std::any::TypeId;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::monitor::panic_capture;
use crate::types::{panic_message, CallContext, InvocationPhase, ToolFailure, ToolOutput};

/// Default priorities of the built-in interceptors
pub mod priority {
    pub const EXCEPTION_MONITOR: i32 = 10;
    pub const VARIANCE_DETECTOR: i32 = 20;
    pub const PERFORMANCE_STORE: i32 = 30;
    pub const DEFAULT: i32 = 100;
}

/// What an exception hook wants done with the failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionAction {
    /// Let the failure reach the caller
    Propagate,
    /// Swallow the failure; the chain returns without a value
    Suppress,
}

/// Observer of tool calls
pub trait Interceptor: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Lower runs earlier on entry and later on exit
    fn priority(&self) -> i32 {
        priority::DEFAULT
    }

    fn before_execution(&self, _ctx: &mut CallContext) -> Result<()> {
        Ok(())
    }

    fn after_execution(&self, _output: &mut dyn ToolOutput, _ctx: &mut CallContext) -> Result<()> {
        Ok(())
    }

    fn on_exception(&self, _failure: &ToolFailure, _ctx: &mut CallContext) -> Result<ExceptionAction> {
        Ok(ExceptionAction::Propagate)
    }
}

/// How a call through the chain ended
#[derive(Debug)]
pub enum Completion<T, E> {
    Returned(T),
    /// The function failed but an interceptor asked to swallow the error
    Suppressed(E),
    Failed(E),
}

impl<T, E> Completion<T, E> {
    /// Collapse into the chain's public result: `Ok(None)` when suppressed
    pub fn into_result(self) -> Result<Option<T>, E> {
        match self {
            Completion::Returned(value) => Ok(Some(value)),
            Completion::Suppressed(_) => Ok(None),
            Completion::Failed(err) => Err(err),
        }
    }
}

struct RegisteredInterceptor {
    name: String,
    priority: i32,
    type_id: TypeId,
    enabled: AtomicBool,
    interceptor: Arc<dyn Interceptor>,
}

/// Priority-ordered list of interceptors wrapped around tool calls
#[derive(Default)]
pub struct InterceptorChain {
    entries: RwLock<Vec<Arc<RegisteredInterceptor>>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interceptor at its own priority
    pub fn register<I: Interceptor>(&self, interceptor: Arc<I>) {
        let priority = interceptor.priority();
        self.register_with_priority(interceptor, priority);
    }

    /// Register an interceptor, overriding its priority
    pub fn register_with_priority<I: Interceptor>(&self, interceptor: Arc<I>, priority: i32) {
        let name = interceptor.name().to_string();
        let entry = Arc::new(RegisteredInterceptor {
            name: name.clone(),
            priority,
            type_id: TypeId::of::<I>(),
            enabled: AtomicBool::new(true),
            interceptor,
        });

        let mut entries = self.entries.write();
        entries.push(entry);
        // Stable sort keeps registration order among equal priorities
        entries.sort_by_key(|e| e.priority);

        debug!("Registered interceptor '{}' with priority {}", name, priority);
    }

    /// Remove interceptors by name; returns whether any was removed
    pub fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.name != name);
        let removed = entries.len() < before;
        if removed {
            debug!("Removed interceptor '{}'", name);
        }
        removed
    }

    /// Remove every interceptor of concrete type `I`; returns how many went
    pub fn remove_by_type<I: Interceptor>(&self) -> usize {
        let target = TypeId::of::<I>();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.type_id != target);
        before - entries.len()
    }

    /// Enable or disable an interceptor without removing it
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let entries = self.entries.read();
        let mut found = false;
        for entry in entries.iter().filter(|e| e.name == name) {
            entry.enabled.store(enabled, Ordering::SeqCst);
            found = true;
        }
        found
    }

    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.entries
            .read()
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.enabled.load(Ordering::SeqCst))
    }

    /// Names and priorities in execution order
    pub fn names(&self) -> Vec<(String, i32)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.name.clone(), e.priority))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wrap a call to `f` for `tool`.
    ///
    /// Pass the caller's context as `parent` when invoking from inside
    /// another wrapped call so parent/child linkage is preserved.
    /// Returns `Ok(None)` only if an interceptor suppressed a failure.
    pub fn invoke<T, E, F>(
        &self,
        tool: &str,
        args: Value,
        parent: Option<&CallContext>,
        f: F,
    ) -> Result<Option<T>, E>
    where
        T: fmt::Debug + 'static,
        E: fmt::Display + fmt::Debug + 'static,
        F: FnOnce(&Value, &CallContext) -> Result<T, E>,
    {
        let ctx = match parent {
            Some(parent) => CallContext::child_of(parent, tool, args),
            None => CallContext::new(tool, args),
        };
        self.run(ctx, f).into_result()
    }

    /// Drive one call with a caller-built context
    pub fn run<T, E, F>(&self, mut ctx: CallContext, f: F) -> Completion<T, E>
    where
        T: fmt::Debug + 'static,
        E: fmt::Display + fmt::Debug + 'static,
        F: FnOnce(&Value, &CallContext) -> Result<T, E>,
    {
        let active = self.snapshot();
        let _invocation = panic_capture::enter_invocation();
        let tool = ctx.tool_name.clone();

        ctx.phase = InvocationPhase::BeforeHooksRunning;
        for entry in &active {
            guarded(entry, "before_execution", &tool, || {
                entry.interceptor.before_execution(&mut ctx)
            });
        }

        ctx.phase = InvocationPhase::Executing;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&ctx.args, &ctx)));

        match outcome {
            Ok(Ok(mut value)) => {
                ctx.phase = InvocationPhase::AfterHooksRunning;
                for entry in active.iter().rev() {
                    guarded(entry, "after_execution", &tool, || {
                        entry.interceptor.after_execution(&mut value, &mut ctx)
                    });
                }
                ctx.phase = InvocationPhase::Completed;
                Completion::Returned(value)
            }
            Ok(Err(err)) => {
                let failure = ToolFailure::from_error(&err);
                if run_exception_hooks(&active, &failure, &mut ctx) {
                    ctx.phase = InvocationPhase::Suppressed;
                    debug!("Failure in '{}' suppressed by interceptor", ctx.tool_name);
                    Completion::Suppressed(err)
                } else {
                    ctx.phase = InvocationPhase::Propagated;
                    Completion::Failed(err)
                }
            }
            Err(payload) => {
                let report = panic_capture::take_report();
                let failure = ToolFailure::from_panic(
                    payload.as_ref(),
                    report.map(|r| r.stack_trace),
                );
                if run_exception_hooks(&active, &failure, &mut ctx) {
                    warn!("Ignoring suppression of a panic in '{}'", ctx.tool_name);
                }
                ctx.phase = InvocationPhase::Propagated;
                panic::resume_unwind(payload)
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<RegisteredInterceptor>> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.enabled.load(Ordering::SeqCst))
            .cloned()
            .collect()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("interceptors", &self.names())
            .finish()
    }
}

/// Every interceptor observes the failure; returns true if any asked to suppress
fn run_exception_hooks(
    active: &[Arc<RegisteredInterceptor>],
    failure: &ToolFailure,
    ctx: &mut CallContext,
) -> bool {
    ctx.phase = InvocationPhase::ExceptionHooksRunning;
    let tool = ctx.tool_name.clone();
    let mut suppress = false;
    for entry in active {
        let action = guarded(entry, "on_exception", &tool, || {
            entry.interceptor.on_exception(failure, &mut *ctx)
        });
        if action == Some(ExceptionAction::Suppress) {
            suppress = true;
        }
    }
    suppress
}

/// Run one hook, containing both errors and panics
fn guarded<R>(
    entry: &RegisteredInterceptor,
    hook: &str,
    tool: &str,
    call: impl FnOnce() -> Result<R>,
) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("Interceptor '{}' {} failed for '{}': {:#}", entry.name, hook, tool, e);
            None
        }
        Err(payload) => {
            // The panic hook stashed a report for this panic; it is not the tool's
            let _ = panic_capture::take_report();
            warn!(
                "Interceptor '{}' {} panicked for '{}': {}",
                entry.name,
                hook,
                tool,
                panic_message(payload.as_ref())
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: String,
        priority: i32,
        log: Log,
        action: ExceptionAction,
    }

    impl Recorder {
        fn new(name: &str, priority: i32, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                priority,
                log: log.clone(),
                action: ExceptionAction::Propagate,
            })
        }
    }

    impl Interceptor for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn before_execution(&self, _ctx: &mut CallContext) -> Result<()> {
            self.log.lock().push(format!("{}.before", self.name));
            Ok(())
        }

        fn after_execution(&self, _output: &mut dyn ToolOutput, _ctx: &mut CallContext) -> Result<()> {
            self.log.lock().push(format!("{}.after", self.name));
            Ok(())
        }

        fn on_exception(&self, _failure: &ToolFailure, _ctx: &mut CallContext) -> Result<ExceptionAction> {
            self.log.lock().push(format!("{}.onException", self.name));
            Ok(self.action)
        }
    }

    struct FailingBefore;

    impl Interceptor for FailingBefore {
        fn name(&self) -> &str {
            "failing"
        }

        fn priority(&self) -> i32 {
            5
        }

        fn before_execution(&self, _ctx: &mut CallContext) -> Result<()> {
            anyhow::bail!("hook bug")
        }

        fn after_execution(&self, _output: &mut dyn ToolOutput, _ctx: &mut CallContext) -> Result<()> {
            panic!("after hook bug")
        }
    }

    struct Doubler;

    impl Interceptor for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }

        fn after_execution(&self, output: &mut dyn ToolOutput, _ctx: &mut CallContext) -> Result<()> {
            if let Some(n) = output.as_any_mut().downcast_mut::<i64>() {
                *n *= 2;
            }
            Ok(())
        }
    }

    #[derive(Debug)]
    struct BadInput;

    impl fmt::Display for BadInput {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "bad input")
        }
    }

    fn sum(args: &Value, log: &Log) -> std::result::Result<i64, BadInput> {
        log.lock().push("fn".to_string());
        let a = args[0].as_i64().ok_or(BadInput)?;
        let b = args[1].as_i64().ok_or(BadInput)?;
        Ok(a + b)
    }

    #[test]
    fn test_success_hook_order_is_nested() {
        let log: Log = Arc::default();
        let chain = InterceptorChain::new();
        chain.register(Recorder::new("B", 10, &log));
        chain.register(Recorder::new("A", 0, &log));

        let result = chain.invoke("sum_tool", json!([2, 3]), None, |args, _| sum(args, &log));
        assert_eq!(result.unwrap(), Some(5));
        assert_eq!(
            *log.lock(),
            vec!["A.before", "B.before", "fn", "B.after", "A.after"]
        );
    }

    #[test]
    fn test_exception_hook_order_and_reraise() {
        let log: Log = Arc::default();
        let chain = InterceptorChain::new();
        chain.register(Recorder::new("A", 0, &log));
        chain.register(Recorder::new("B", 10, &log));

        let result = chain.invoke("sum_tool", json!(["x", 3]), None, |args, _| sum(args, &log));
        assert!(matches!(result, Err(BadInput)));
        assert_eq!(
            *log.lock(),
            vec!["A.before", "B.before", "fn", "A.onException", "B.onException"]
        );
    }

    #[test]
    fn test_failing_hooks_do_not_break_the_call() {
        let log: Log = Arc::default();
        let chain = InterceptorChain::new();
        chain.register(Arc::new(FailingBefore));
        chain.register(Recorder::new("A", 10, &log));

        let result = chain.invoke("sum_tool", json!([1, 1]), None, |args, _| sum(args, &log));
        assert_eq!(result.unwrap(), Some(2));
        assert_eq!(*log.lock(), vec!["A.before", "fn", "A.after"]);
    }

    #[test]
    fn test_suppression_returns_none() {
        let log: Log = Arc::default();
        let chain = InterceptorChain::new();
        chain.register(Arc::new(Recorder {
            name: "S".to_string(),
            priority: 0,
            log: log.clone(),
            action: ExceptionAction::Suppress,
        }));
        chain.register(Recorder::new("A", 10, &log));

        let result = chain.invoke("sum_tool", json!(null), None, |args, _| sum(args, &log));
        assert_eq!(result.unwrap(), None);
        // Every interceptor still observed the failure
        assert_eq!(log.lock().iter().filter(|e| e.ends_with("onException")).count(), 2);
    }

    #[test]
    fn test_after_hook_can_transform_result() {
        let chain = InterceptorChain::new();
        chain.register(Arc::new(Doubler));
        let result: std::result::Result<Option<i64>, BadInput> =
            chain.invoke("calc", Value::Null, None, |_, _| Ok(21));
        assert_eq!(result.unwrap(), Some(42));
    }

    #[test]
    fn test_disable_enable_and_remove() {
        let log: Log = Arc::default();
        let chain = InterceptorChain::new();
        chain.register(Recorder::new("A", 0, &log));
        chain.register(Arc::new(Doubler));
        assert_eq!(chain.len(), 2);

        assert!(chain.set_enabled("A", false));
        assert_eq!(chain.is_enabled("A"), Some(false));
        let _ = chain.invoke("calc", Value::Null, None, |_, _| Ok::<i64, BadInput>(1));
        assert!(log.lock().is_empty());

        chain.set_enabled("A", true);
        let _ = chain.invoke("calc", Value::Null, None, |_, _| Ok::<i64, BadInput>(1));
        assert_eq!(log.lock().len(), 2);

        assert_eq!(chain.remove_by_type::<Doubler>(), 1);
        assert!(chain.remove("A"));
        assert!(!chain.remove("A"));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_names_sorted_by_priority() {
        let log: Log = Arc::default();
        let chain = InterceptorChain::new();
        chain.register(Recorder::new("late", 50, &log));
        chain.register(Recorder::new("early", -5, &log));
        chain.register_with_priority(Recorder::new("middle", 99, &log), 10);
        let names: Vec<String> = chain.names().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_panic_is_observed_and_resumed() {
        let log: Log = Arc::default();
        let chain = InterceptorChain::new();
        chain.register(Recorder::new("A", 0, &log));

        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = chain.invoke("explode", Value::Null, None, |_, _| -> std::result::Result<(), BadInput> {
                panic!("kaboom")
            });
        }));
        let payload = caught.unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
        assert_eq!(*log.lock(), vec!["A.before", "A.onException"]);
    }

    #[test]
    fn test_nested_call_links_parent() {
        let chain = InterceptorChain::new();
        let result = chain.invoke("outer", Value::Null, None, |_, outer_ctx| {
            let outer_id = outer_ctx.request_id.clone();
            chain
                .invoke("inner", Value::Null, Some(outer_ctx), |_, inner_ctx| {
                    Ok::<_, BadInput>(inner_ctx.parent().map(|p| p.request_id.clone()) == Some(outer_id))
                })
                .map(|linked| linked.unwrap_or(false))
        });
        assert_eq!(result.unwrap(), Some(true));
    }
}
