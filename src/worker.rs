//! Background flush thread
//!
//! A named OS thread that runs a tick closure whenever it is notified or the
//! interval elapses, whichever comes first. Dropping the worker stops the
//! thread after one final tick so nothing queued is left behind.

use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Default)]
struct SignalState {
    pending: bool,
    shutdown: bool,
}

#[derive(Default)]
struct Signal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

/// Cloneable handle used to wake a [`BackgroundWorker`] early
#[derive(Clone)]
pub struct Waker {
    signal: Arc<Signal>,
}

impl Waker {
    /// Request a tick as soon as possible. Never blocks on the tick itself.
    pub fn wake(&self) {
        let mut state = self.signal.state.lock();
        state.pending = true;
        self.signal.cv.notify_one();
    }
}

/// Owns the flush thread; stops and joins it on drop
pub struct BackgroundWorker {
    name: String,
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    /// Spawn a worker thread calling `tick` on wake-ups and every `interval`
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let signal = Arc::new(Signal::default());
        let thread_signal = signal.clone();
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("Worker '{}' started (interval {:?})", thread_name, interval);
                loop {
                    let stop = {
                        let mut state = thread_signal.state.lock();
                        // No deadline when the interval overflows: wait for a wake
                        let deadline = Instant::now().checked_add(interval);
                        while !state.pending && !state.shutdown {
                            match deadline {
                                Some(deadline) => {
                                    let now = Instant::now();
                                    if now >= deadline {
                                        break;
                                    }
                                    thread_signal.cv.wait_for(&mut state, deadline - now);
                                }
                                None => thread_signal.cv.wait(&mut state),
                            }
                        }
                        state.pending = false;
                        state.shutdown
                    };

                    if panic::catch_unwind(AssertUnwindSafe(&mut tick)).is_err() {
                        error!("Worker '{}' tick panicked", thread_name);
                    }

                    if stop {
                        debug!("Worker '{}' stopped", thread_name);
                        break;
                    }
                }
            })?;

        Ok(Self {
            name: name.to_string(),
            signal,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn waker(&self) -> Waker {
        Waker {
            signal: self.signal.clone(),
        }
    }

    /// Wake the worker for an early tick
    pub fn wake(&self) {
        self.waker().wake();
    }

    /// Stop the thread after a final tick and wait for it
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        {
            let mut state = self.signal.state.lock();
            state.shutdown = true;
            self.signal.cv.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Worker '{}' thread panicked", self.name);
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
