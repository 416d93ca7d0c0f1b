//! Variance detector - flags calls whose duration strays from the recent mean

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::stats::{mean, sample_stdev, ToolStats};
use crate::interceptor::{priority, ExceptionAction, Interceptor};
use crate::shipper::{label_map, labels, LogShipper};
use crate::types::{CallContext, ToolFailure, ToolOutput};

const START_MARK: &str = "variance.start";

#[derive(Debug, Clone)]
pub struct VarianceSettings {
    /// Relative deviation from the mean that triggers an event
    pub threshold: f64,
    /// Durations kept per tool
    pub window_size: usize,
    /// Baseline samples required before anything is emitted
    pub min_samples: usize,
}

impl Default for VarianceSettings {
    fn default() -> Self {
        Self {
            threshold: 0.2,
            window_size: 100,
            min_samples: 10,
        }
    }
}

/// Payload shipped for an anomalous call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceEvent {
    pub tool: String,
    pub current_ms: f64,
    pub mean_ms: f64,
    pub stdev_ms: f64,
    pub variance: f64,
    pub variance_pct: f64,
    pub request_id: String,
}

impl VarianceEvent {
    /// `high` when the deviation is more than twice the threshold
    pub fn level(&self, threshold: f64) -> &'static str {
        if self.variance > 2.0 * threshold {
            "high"
        } else {
            "medium"
        }
    }
}

/// Interceptor keeping a duration window per tool
pub struct VarianceDetector {
    shipper: Arc<LogShipper>,
    settings: VarianceSettings,
    windows: Mutex<HashMap<String, VecDeque<f64>>>,
    emitted: AtomicU64,
}

impl VarianceDetector {
    pub fn new(shipper: Arc<LogShipper>, settings: VarianceSettings) -> Self {
        Self {
            shipper,
            settings: VarianceSettings {
                window_size: settings.window_size.max(1),
                ..settings
            },
            windows: Mutex::new(HashMap::new()),
            emitted: AtomicU64::new(0),
        }
    }

    /// Record one duration for `tool` and ship an event if it is anomalous.
    ///
    /// The sample is compared against the window as it stood before it was
    /// added.
    pub fn observe(&self, tool: &str, request_id: &str, duration_ms: f64) -> Option<VarianceEvent> {
        let event = {
            let mut windows = self.windows.lock();
            let window = windows.entry(tool.to_string()).or_default();

            let event = self.evaluate(window, tool, request_id, duration_ms);

            window.push_back(duration_ms);
            while window.len() > self.settings.window_size {
                window.pop_front();
            }
            event
        };

        if let Some(event) = &event {
            let level = event.level(self.settings.threshold);
            debug!(
                "Duration variance {:.1}% ({}) for '{}': {:.1}ms vs mean {:.1}ms",
                event.variance_pct, level, tool, event.current_ms, event.mean_ms
            );
            let stream = label_map([
                (labels::KIND, "variance"),
                (labels::TOOL_NAME, tool),
                (labels::VARIANCE_LEVEL, level),
            ]);
            self.shipper.push(stream, event);
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
        event
    }

    fn evaluate(
        &self,
        baseline: &VecDeque<f64>,
        tool: &str,
        request_id: &str,
        duration_ms: f64,
    ) -> Option<VarianceEvent> {
        if baseline.len() < self.settings.min_samples {
            return None;
        }
        let samples: Vec<f64> = baseline.iter().copied().collect();
        let mean_ms = mean(&samples);
        if mean_ms <= 0.0 {
            return None;
        }

        let variance = (duration_ms - mean_ms).abs() / mean_ms;
        if variance <= self.settings.threshold {
            return None;
        }

        Some(VarianceEvent {
            tool: tool.to_string(),
            current_ms: duration_ms,
            mean_ms,
            stdev_ms: sample_stdev(&samples),
            variance,
            variance_pct: variance * 100.0,
            request_id: request_id.to_string(),
        })
    }

    /// Statistics over the current window
    pub fn tool_stats(&self, tool: &str) -> Option<ToolStats> {
        let samples: Vec<f64> = self.windows.lock().get(tool)?.iter().copied().collect();
        ToolStats::from_samples(&samples)
    }

    pub fn tracked_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = self.windows.lock().keys().cloned().collect();
        tools.sort();
        tools
    }

    /// Forget the window of one tool, or every tool when `None`
    pub fn reset(&self, tool: Option<&str>) {
        let mut windows = self.windows.lock();
        match tool {
            Some(tool) => {
                windows.remove(tool);
            }
            None => windows.clear(),
        }
    }

    /// Events shipped since creation
    pub fn emitted_count(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    fn record_call(&self, ctx: &CallContext) {
        let duration_ms = ctx.since_mark(START_MARK).as_secs_f64() * 1000.0;
        self.observe(&ctx.tool_name, &ctx.request_id, duration_ms);
    }
}

impl Interceptor for VarianceDetector {
    fn name(&self) -> &str {
        "variance_detector"
    }

    fn priority(&self) -> i32 {
        priority::VARIANCE_DETECTOR
    }

    fn before_execution(&self, ctx: &mut CallContext) -> Result<()> {
        ctx.mark(START_MARK);
        Ok(())
    }

    fn after_execution(&self, _output: &mut dyn ToolOutput, ctx: &mut CallContext) -> Result<()> {
        self.record_call(ctx);
        Ok(())
    }

    fn on_exception(&self, _failure: &ToolFailure, ctx: &mut CallContext) -> Result<ExceptionAction> {
        self.record_call(ctx);
        Ok(ExceptionAction::Propagate)
    }
}
