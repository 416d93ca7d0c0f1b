//! Log shipping - batches structured entries and pushes them to a log sink
//!
//! Entries accumulate in one mutex-guarded buffer until `batch_size` is
//! reached (inline flush on the pushing thread) or a periodic flush runs.
//! A failed push puts the batch back in front of anything queued since, so
//! delivery is at-least-once. After a failure, pushing threads stop flushing
//! inline and leave retries to the periodic flush until one succeeds. The
//! buffer is capped at `max_buffered_lines`; beyond that the oldest lines are
//! dropped.

pub mod query;
pub mod sink;

pub use query::{LabelSelector, LokiQuery, QueriedLine};
pub use sink::{DiscardSink, HttpLogSink, LogSink, MemorySink, PushRequest, PushStream};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ShipError;

/// Label names used on pushed streams
pub mod labels {
    pub const JOB: &str = "job";
    pub const KIND: &str = "kind";
    pub const SEVERITY: &str = "severity";
    pub const EXCEPTION_TYPE: &str = "exception_type";
    pub const TOOL_NAME: &str = "tool_name";
    pub const WORKFLOW_ID: &str = "workflow_id";
    pub const VARIANCE_LEVEL: &str = "variance_level";
}

/// Shipper tuning
#[derive(Debug, Clone)]
pub struct ShipperSettings {
    pub job: String,
    pub batch_size: usize,
    pub max_buffered_lines: usize,
}

impl Default for ShipperSettings {
    fn default() -> Self {
        Self {
            job: "toolwatch".to_string(),
            batch_size: 100,
            max_buffered_lines: 10_000,
        }
    }
}

/// One buffered line waiting for delivery
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub labels: BTreeMap<String, String>,
    pub timestamp_ns: i64,
    pub payload: String,
}

/// Counters for operator visibility
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShipperStats {
    pub pushed_lines: u64,
    pub failed_flushes: u64,
    pub dropped_lines: u64,
    pub buffered_lines: usize,
}

/// Batches labelled lines and pushes them through a [`LogSink`]
pub struct LogShipper {
    sink: Arc<dyn LogSink>,
    settings: ShipperSettings,
    buffer: Mutex<Vec<LogLine>>,
    // Serializes flushes so a retained batch is never sent twice concurrently
    flush_lock: Mutex<()>,
    // Set by a failed push, cleared by the next successful one
    backing_off: AtomicBool,
    pushed_lines: AtomicU64,
    failed_flushes: AtomicU64,
    dropped_lines: AtomicU64,
}

impl LogShipper {
    pub fn new(sink: Arc<dyn LogSink>, settings: ShipperSettings) -> Self {
        Self {
            sink,
            settings,
            buffer: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
            backing_off: AtomicBool::new(false),
            pushed_lines: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            dropped_lines: AtomicU64::new(0),
        }
    }

    pub fn job(&self) -> &str {
        &self.settings.job
    }

    /// Queue a structured entry.
    ///
    /// The `job` label is always added. Serialization failures are logged and
    /// the entry is skipped; this never returns an error to the caller.
    pub fn push<P: Serialize>(&self, stream_labels: BTreeMap<String, String>, payload: &P) {
        let payload = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                warn!("Dropping log entry that failed to serialize: {}", e);
                return;
            }
        };
        self.push_line(stream_labels, payload);
    }

    /// Queue an already-encoded JSON line
    pub fn push_line(&self, mut stream_labels: BTreeMap<String, String>, payload: String) {
        stream_labels.insert(labels::JOB.to_string(), self.settings.job.clone());
        let line = LogLine {
            labels: stream_labels,
            timestamp_ns: now_ns(),
            payload,
        };

        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.push(line);
            self.enforce_cap(&mut buffer);
            buffer.len() >= self.settings.batch_size
        };

        if !should_flush || self.is_backing_off() {
            return;
        }
        // Another thread is already flushing; it will take these lines too
        let Some(_flushing) = self.flush_lock.try_lock() else {
            return;
        };
        if let Err(e) = self.flush_locked() {
            debug!("Inline flush failed, batch retained: {}", e);
        }
    }

    /// Push everything buffered. On failure the batch stays buffered.
    pub fn flush(&self) -> Result<usize, ShipError> {
        let _flushing = self.flush_lock.lock();
        self.flush_locked()
    }

    /// True while the last push failed; inline flushes are skipped meanwhile
    pub fn is_backing_off(&self) -> bool {
        self.backing_off.load(Ordering::Relaxed)
    }

    fn flush_locked(&self) -> Result<usize, ShipError> {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        let request = build_request(&batch);
        match self.sink.push(&request) {
            Ok(()) => {
                self.backing_off.store(false, Ordering::Relaxed);
                self.pushed_lines.fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!("Flushed {} log lines via {} sink", batch.len(), self.sink.name());
                Ok(batch.len())
            }
            Err(e) => {
                self.backing_off.store(true, Ordering::Relaxed);
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Log push via {} sink failed, retaining {} lines: {}",
                    self.sink.name(),
                    batch.len(),
                    e
                );
                let mut buffer = self.buffer.lock();
                let newer = std::mem::replace(&mut *buffer, batch);
                buffer.extend(newer);
                self.enforce_cap(&mut buffer);
                Err(e)
            }
        }
    }

    /// Number of lines waiting for delivery
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Copy of the buffered lines, oldest first
    pub fn pending_lines(&self) -> Vec<LogLine> {
        self.buffer.lock().clone()
    }

    pub fn stats(&self) -> ShipperStats {
        ShipperStats {
            pushed_lines: self.pushed_lines.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            dropped_lines: self.dropped_lines.load(Ordering::Relaxed),
            buffered_lines: self.buffered(),
        }
    }

    fn enforce_cap(&self, buffer: &mut Vec<LogLine>) {
        let cap = self.settings.max_buffered_lines.max(1);
        if buffer.len() > cap {
            let overflow = buffer.len() - cap;
            buffer.drain(..overflow);
            self.dropped_lines.fetch_add(overflow as u64, Ordering::Relaxed);
            warn!("Log buffer full, dropped {} oldest lines", overflow);
        }
    }
}

/// Group lines into one stream per distinct label set, preserving line order
pub fn build_request(lines: &[LogLine]) -> PushRequest {
    let mut streams: BTreeMap<&BTreeMap<String, String>, Vec<[String; 2]>> = BTreeMap::new();
    for line in lines {
        streams
            .entry(&line.labels)
            .or_default()
            .push([line.timestamp_ns.to_string(), line.payload.clone()]);
    }
    PushRequest {
        streams: streams
            .into_iter()
            .map(|(labels, values)| PushStream {
                stream: labels.clone(),
                values,
            })
            .collect(),
    }
}

fn now_ns() -> i64 {
    let now = Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000))
}

/// Build a label map from `(name, value)` pairs
pub fn label_map<I, K, V>(pairs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
