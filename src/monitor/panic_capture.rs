//! Process-wide panic hook
//!
//! Panics raised inside a wrapped call are stashed per thread for the chain,
//! which reports them through the normal exception hooks. Panics raised
//! anywhere else are recorded as uncaught exceptions.

use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info};

use super::ExceptionMonitor;
use crate::types::ToolFailure;

thread_local! {
    static ACTIVE_INVOCATIONS: Cell<usize> = const { Cell::new(0) };
    static LAST_PANIC: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Monitor receiving uncaught panics; held weakly so it can be dropped
fn target() -> &'static Mutex<Option<Weak<ExceptionMonitor>>> {
    static TARGET: OnceLock<Mutex<Option<Weak<ExceptionMonitor>>>> = OnceLock::new();
    TARGET.get_or_init(|| Mutex::new(None))
}

/// Where a panic happened, captured inside the panic hook
#[derive(Debug, Clone)]
pub struct PanicReport {
    pub location: Option<String>,
    pub stack_trace: String,
}

/// Marks the current thread as running a wrapped call
pub(crate) struct InvocationGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        ACTIVE_INVOCATIONS.with(|active| active.set(active.get().saturating_sub(1)));
    }
}

pub(crate) fn enter_invocation() -> InvocationGuard {
    ACTIVE_INVOCATIONS.with(|active| active.set(active.get() + 1));
    InvocationGuard {
        _not_send: std::marker::PhantomData,
    }
}

pub(crate) fn in_invocation() -> bool {
    ACTIVE_INVOCATIONS.with(|active| active.get() > 0)
}

/// Take the report stashed by the most recent panic on this thread
pub(crate) fn take_report() -> Option<PanicReport> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}

/// Installs the panic hook feeding an [`ExceptionMonitor`]
pub struct PanicCapture;

impl PanicCapture {
    /// Route uncaught panics to `monitor`.
    ///
    /// The hook is chained in front of the current one on the first call
    /// only; later calls just switch the target monitor. Returns whether the
    /// hook was installed by this call.
    pub fn install(monitor: &Arc<ExceptionMonitor>) -> bool {
        *target().lock() = Some(Arc::downgrade(monitor));
        if INSTALLED.swap(true, Ordering::SeqCst) {
            debug!("Panic capture already installed, target updated");
            return false;
        }

        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
            let backtrace = Backtrace::force_capture().to_string();
            let stack_trace = match &location {
                Some(at) => format!("panicked at {}\n{}", at, backtrace),
                None => backtrace,
            };

            if in_invocation() {
                LAST_PANIC.with(|slot| {
                    *slot.borrow_mut() = Some(PanicReport {
                        location,
                        stack_trace,
                    })
                });
            } else {
                let monitor = target().lock().as_ref().and_then(Weak::upgrade);
                if let Some(monitor) = monitor {
                    let failure = ToolFailure::from_panic(info.payload(), Some(stack_trace));
                    monitor.record_uncaught(&failure);
                }
            }

            previous(info);
        }));

        info!("Panic capture installed");
        true
    }

    /// Stop routing uncaught panics; the hook stays installed and forwards
    pub fn clear_target() {
        *target().lock() = None;
    }

    pub fn is_installed() -> bool {
        INSTALLED.load(Ordering::SeqCst)
    }
}
