//! Telemetry - composition root wiring the interceptors together
//!
//! Builds the log shipper, the built-in interceptors and the background
//! flush thread from a [`TelemetryConfig`]. Construct one per process and
//! share it by reference or `Arc`.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TelemetryConfig;
use crate::interceptor::{Completion, InterceptorChain};
use crate::metrics::{ToolStats, VarianceDetector};
use crate::monitor::{ExceptionMonitor, PanicCapture};
use crate::perf::{PerfMode, PerformanceSample, PerformanceStore};
use crate::shipper::{DiscardSink, HttpLogSink, LogShipper, LogSink, ShipperStats};
use crate::types::{CallContext, ExceptionRecord};
use crate::worker::BackgroundWorker;

/// The tool-call telemetry pipeline
pub struct Telemetry {
    config: TelemetryConfig,
    chain: InterceptorChain,
    shipper: Arc<LogShipper>,
    monitor: Option<Arc<ExceptionMonitor>>,
    variance: Option<Arc<VarianceDetector>>,
    performance: Option<Arc<PerformanceStore>>,
    flusher: Mutex<Option<BackgroundWorker>>,
}

impl Telemetry {
    /// Build from configuration, shipping to the configured backend.
    ///
    /// Installs the process-wide panic hook when `exceptions.capture_panics`
    /// is set.
    pub fn from_config(config: TelemetryConfig) -> Result<Self> {
        let sink: Arc<dyn LogSink> = match &config.loki.url {
            Some(url) => Arc::new(
                HttpLogSink::new(url, config.loki_timeout())
                    .context("Failed to create log backend client")?
                    .with_tenant(config.loki.tenant_id.clone()),
            ),
            None => {
                info!("No log backend configured, log lines will be discarded");
                Arc::new(DiscardSink)
            }
        };

        let telemetry = Self::with_sink(config, sink)?;
        if telemetry.config.exceptions.capture_panics {
            telemetry.install_panic_capture();
        }
        Ok(telemetry)
    }

    /// Build with an explicit sink; no panic hook is installed
    pub fn with_sink(config: TelemetryConfig, sink: Arc<dyn LogSink>) -> Result<Self> {
        config.validate()?;

        let shipper = Arc::new(LogShipper::new(sink, config.shipper_settings()));
        let chain = InterceptorChain::new();

        let monitor = if config.exceptions.enabled {
            let monitor = Arc::new(ExceptionMonitor::new(shipper.clone(), config.monitor_settings()));
            chain.register(monitor.clone());
            Some(monitor)
        } else {
            None
        };

        let variance = if config.variance.enabled {
            let detector = Arc::new(VarianceDetector::new(shipper.clone(), config.variance_settings()));
            chain.register(detector.clone());
            Some(detector)
        } else {
            None
        };

        let performance = if config.performance.enabled {
            let store = Arc::new(PerformanceStore::new(config.perf_settings()?));
            chain.register(store.clone());
            Some(store)
        } else {
            None
        };

        let flush_shipper = shipper.clone();
        let flusher = BackgroundWorker::spawn("log-shipper", config.loki_flush_interval(), move || {
            if let Err(e) = flush_shipper.flush() {
                debug!("Periodic log flush failed: {}", e);
            }
        })
        .context("Failed to start log shipper thread")?;

        info!("Telemetry ready with interceptors: {:?}", chain.names());

        Ok(Self {
            config,
            chain,
            shipper,
            monitor,
            variance,
            performance,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Run `f` as `tool` through every interceptor.
    ///
    /// Transparent to the caller: the value or error of `f` is returned
    /// unchanged and panics continue unwinding. Suppression requests are
    /// logged but cannot replace an error here; use [`InterceptorChain::invoke`]
    /// through [`Telemetry::chain`] to observe them.
    pub fn intercept<T, E, F>(
        &self,
        tool: &str,
        args: Value,
        parent: Option<&CallContext>,
        f: F,
    ) -> Result<T, E>
    where
        T: fmt::Debug + 'static,
        E: fmt::Display + fmt::Debug + 'static,
        F: FnOnce(&Value, &CallContext) -> Result<T, E>,
    {
        let ctx = match parent {
            Some(parent) => CallContext::child_of(parent, tool, args),
            None => CallContext::new(tool, args),
        };
        self.intercept_with_context(ctx, f)
    }

    /// Like [`Telemetry::intercept`] with a caller-built context,
    /// e.g. one carrying a workflow id
    pub fn intercept_with_context<T, E, F>(&self, ctx: CallContext, f: F) -> Result<T, E>
    where
        T: fmt::Debug + 'static,
        E: fmt::Display + fmt::Debug + 'static,
        F: FnOnce(&Value, &CallContext) -> Result<T, E>,
    {
        let tool = ctx.tool_name.clone();
        match self.chain.run(ctx, f) {
            Completion::Returned(value) => Ok(value),
            Completion::Suppressed(err) => {
                warn!("Suppression requested for '{}' ignored; returning the error", tool);
                Err(err)
            }
            Completion::Failed(err) => Err(err),
        }
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn monitor(&self) -> Option<&Arc<ExceptionMonitor>> {
        self.monitor.as_ref()
    }

    pub fn variance(&self) -> Option<&Arc<VarianceDetector>> {
        self.variance.as_ref()
    }

    pub fn performance(&self) -> Option<&Arc<PerformanceStore>> {
        self.performance.as_ref()
    }

    pub fn shipper(&self) -> &Arc<LogShipper> {
        &self.shipper
    }

    /// Duration statistics from the variance window
    pub fn tool_stats(&self, tool: &str) -> Option<ToolStats> {
        self.variance.as_ref()?.tool_stats(tool)
    }

    pub fn recent_performance(&self, tool: &str, limit: usize) -> Vec<PerformanceSample> {
        self.performance
            .as_ref()
            .map(|store| store.recent_samples(tool, limit))
            .unwrap_or_default()
    }

    pub fn recent_exceptions(&self, tool: Option<&str>, limit: usize) -> Vec<ExceptionRecord> {
        self.monitor
            .as_ref()
            .map(|monitor| monitor.recent_exceptions(tool, limit))
            .unwrap_or_default()
    }

    /// Route panics outside wrapped calls to this instance's monitor
    pub fn install_panic_capture(&self) -> bool {
        match &self.monitor {
            Some(monitor) => PanicCapture::install(monitor),
            None => {
                warn!("Exception monitoring is disabled, panic capture not installed");
                false
            }
        }
    }

    pub fn set_mode(&self, mode: PerfMode) {
        if let Some(store) = &self.performance {
            store.set_mode(mode);
        }
    }

    pub fn shipper_stats(&self) -> ShipperStats {
        self.shipper.stats()
    }

    /// Clear performance caches and logs and forget variance windows
    pub fn cleanup(&self) -> Result<usize> {
        if let Some(detector) = &self.variance {
            detector.reset(None);
        }
        match &self.performance {
            Some(store) => store.cleanup(),
            None => Ok(0),
        }
    }

    /// Push buffered log lines and persist queued samples
    pub fn flush(&self) -> Result<()> {
        self.shipper.flush().context("Failed to flush log lines")?;
        if let Some(store) = &self.performance {
            store.flush_now()?;
        }
        Ok(())
    }

    /// Stop background threads after a final flush
    pub fn shutdown(&self) {
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.shutdown();
            info!("Telemetry shut down ({:?})", self.shipper.stats());
        }
        if let Some(store) = &self.performance {
            store.shutdown();
        }
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("chain", &self.chain)
            .field("shipper", &self.shipper.stats())
            .finish()
    }
}
