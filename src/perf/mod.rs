//! Performance store - per-tool samples in memory and on disk
//!
//! In normal mode every call yields a minimal sample. In optimization mode
//! calls are tracked from entry to exit and yield detailed samples with
//! resource usage and parent/child linkage. Samples are kept in per-tool
//! LRU caches and persisted to per-tool NDJSON logs, either synchronously or
//! through a background writer.

pub mod sample;
pub mod storage;
pub mod system;

pub use sample::{PerfMode, PerformanceSample};
pub use storage::PerfLogStore;
pub use system::{ResourceUsage, SystemSampler};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::BoundedCache;
use crate::interceptor::{priority, ExceptionAction, Interceptor};
use crate::types::{truncate_chars, CallContext, ToolFailure, ToolOutput};
use crate::worker::{BackgroundWorker, Waker};

/// Performance store tuning
#[derive(Debug, Clone)]
pub struct PerfSettings {
    /// Mode at startup
    pub mode: PerfMode,
    /// Per-tool cache capacity (0 disables, -1 unbounded)
    pub default_limit: i64,
    pub tool_limits: HashMap<String, i64>,
    pub params_digest_chars: usize,
    pub storage_dir: PathBuf,
    pub async_save: bool,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Queued samples kept while the disk is failing; oldest dropped beyond it
    pub max_pending: usize,
    /// Samples per tool after which the tool is flagged for optimization
    pub trigger_threshold: u64,
}

impl Default for PerfSettings {
    fn default() -> Self {
        Self {
            mode: PerfMode::Normal,
            default_limit: 100,
            tool_limits: HashMap::new(),
            params_digest_chars: 100,
            storage_dir: PathBuf::from("perf"),
            async_save: true,
            batch_size: 100,
            flush_interval: Duration::from_secs(30),
            max_pending: 10_000,
            trigger_threshold: 1000,
        }
    }
}

/// A call seen entering in optimization mode
#[derive(Debug)]
struct OpenCall {
    parent_tool: Option<String>,
    child_tools: Vec<String>,
}

/// State shared with the background writer
struct WriteQueue {
    storage: PerfLogStore,
    pending: Mutex<VecDeque<PerformanceSample>>,
    max_pending: usize,
    dropped: AtomicU64,
    // Held while draining so file order matches enqueue order
    write_lock: Mutex<()>,
}

impl WriteQueue {
    /// Queue a sample and return the new queue length
    fn enqueue(&self, sample: PerformanceSample) -> usize {
        let mut pending = self.pending.lock();
        pending.push_back(sample);
        self.enforce_cap(&mut pending);
        pending.len()
    }

    /// Write queued samples one tool file at a time. Tools whose file fails
    /// are put back in front for the next drain; the others are not retried.
    fn drain_to_disk(&self) -> Result<usize> {
        let _writing = self.write_lock.lock();
        let batch: Vec<PerformanceSample> = self.pending.lock().drain(..).collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let mut by_tool: BTreeMap<String, Vec<PerformanceSample>> = BTreeMap::new();
        for sample in batch {
            by_tool.entry(sample.tool().to_string()).or_default().push(sample);
        }

        let mut written = 0;
        let mut failed: Vec<PerformanceSample> = Vec::new();
        let mut first_error = None;
        for (tool, group) in by_tool {
            match self.storage.append(&group) {
                Ok(count) => written += count,
                Err(e) => {
                    warn!("Keeping {} samples for '{}' queued: {:#}", group.len(), tool, e);
                    failed.extend(group);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            None => Ok(written),
            Some(e) => {
                let mut pending = self.pending.lock();
                for sample in failed.into_iter().rev() {
                    pending.push_front(sample);
                }
                self.enforce_cap(&mut pending);
                Err(e)
            }
        }
    }

    fn enforce_cap(&self, pending: &mut VecDeque<PerformanceSample>) {
        let cap = self.max_pending.max(1);
        if pending.len() > cap {
            let overflow = pending.len() - cap;
            pending.drain(..overflow);
            self.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
            warn!("Performance write queue full, dropped {} oldest samples", overflow);
        }
    }
}

/// Records one sample per intercepted call
pub struct PerformanceStore {
    settings: PerfSettings,
    mode: AtomicU8,
    caches: RwLock<HashMap<String, Arc<BoundedCache<String, PerformanceSample>>>>,
    open_calls: Mutex<HashMap<String, OpenCall>>,
    counts: Mutex<HashMap<String, u64>>,
    flagged: Mutex<HashSet<String>>,
    queue: Arc<WriteQueue>,
    writer: Mutex<Option<BackgroundWorker>>,
    waker: Option<Waker>,
    sampler: SystemSampler,
}

impl PerformanceStore {
    pub fn new(settings: PerfSettings) -> Self {
        let queue = Arc::new(WriteQueue {
            storage: PerfLogStore::new(settings.storage_dir.clone()),
            pending: Mutex::new(VecDeque::new()),
            max_pending: settings.max_pending,
            dropped: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        });

        let writer = if settings.async_save {
            let thread_queue = queue.clone();
            let spawned = BackgroundWorker::spawn("perf-writer", settings.flush_interval, move || {
                if let Err(e) = thread_queue.drain_to_disk() {
                    warn!("Failed to persist performance samples: {:#}", e);
                }
            });
            match spawned {
                Ok(worker) => Some(worker),
                Err(e) => {
                    warn!("Failed to start performance writer, saving synchronously: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let waker = writer.as_ref().map(BackgroundWorker::waker);

        info!(
            "Performance store ready (mode {}, storage {}, async {})",
            settings.mode,
            settings.storage_dir.display(),
            waker.is_some()
        );

        Self {
            mode: AtomicU8::new(settings.mode.as_u8()),
            settings,
            caches: RwLock::new(HashMap::new()),
            open_calls: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
            flagged: Mutex::new(HashSet::new()),
            queue,
            writer: Mutex::new(writer),
            waker,
            sampler: SystemSampler::new(),
        }
    }

    pub fn mode(&self) -> PerfMode {
        PerfMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    /// Switch mode; calls already in flight keep the mode they started with
    pub fn set_mode(&self, mode: PerfMode) {
        let previous = PerfMode::from_u8(self.mode.swap(mode.as_u8(), Ordering::SeqCst));
        if previous != mode {
            info!("Performance mode changed: {} -> {}", previous, mode);
        }
    }

    pub fn storage(&self) -> &PerfLogStore {
        &self.queue.storage
    }

    /// Most recent cached samples for `tool`, newest first
    pub fn recent_samples(&self, tool: &str, limit: usize) -> Vec<PerformanceSample> {
        match self.caches.read().get(tool) {
            Some(cache) => cache.values().into_iter().take(limit).collect(),
            None => Vec::new(),
        }
    }

    /// Tools with at least one recorded sample, sorted
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.counts.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Samples recorded for `tool` since creation or the last cleanup
    pub fn sample_count(&self, tool: &str) -> u64 {
        self.counts.lock().get(tool).copied().unwrap_or(0)
    }

    /// Tools whose sample count reached the optimization trigger
    pub fn tools_due_for_optimization(&self) -> Vec<String> {
        let threshold = self.settings.trigger_threshold;
        let mut due: Vec<String> = self
            .counts
            .lock()
            .iter()
            .filter(|(_, count)| **count >= threshold)
            .map(|(tool, _)| tool.clone())
            .collect();
        due.sort();
        due
    }

    /// Samples waiting for the background writer
    pub fn pending_writes(&self) -> usize {
        self.queue.pending.lock().len()
    }

    /// Samples dropped because the write queue was full
    pub fn dropped_writes(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Write every queued sample now
    pub fn flush_now(&self) -> Result<usize> {
        self.queue.drain_to_disk()
    }

    /// Drop all in-memory state and delete the on-disk logs
    pub fn cleanup(&self) -> Result<usize> {
        let _writing = self.queue.write_lock.lock();
        self.queue.pending.lock().clear();
        self.caches.write().clear();
        self.open_calls.lock().clear();
        self.counts.lock().clear();
        self.flagged.lock().clear();

        let deleted = self.queue.storage.delete_all()?;
        info!("Performance data cleaned up ({} logs deleted)", deleted);
        Ok(deleted)
    }

    /// Stop the background writer after persisting everything queued
    pub fn shutdown(&self) {
        if let Some(worker) = self.writer.lock().take() {
            worker.shutdown();
        }
        if let Err(e) = self.flush_now() {
            warn!("Failed to persist performance samples on shutdown: {:#}", e);
        }
    }

    fn cache_for(&self, tool: &str) -> Arc<BoundedCache<String, PerformanceSample>> {
        if let Some(cache) = self.caches.read().get(tool) {
            return cache.clone();
        }
        let limit = self
            .settings
            .tool_limits
            .get(tool)
            .copied()
            .unwrap_or(self.settings.default_limit);
        self.caches
            .write()
            .entry(tool.to_string())
            .or_insert_with(|| {
                debug!("Created performance cache for '{}' (limit {})", tool, limit);
                Arc::new(BoundedCache::with_limit(limit))
            })
            .clone()
    }

    fn begin(&self, ctx: &CallContext) {
        if self.mode() != PerfMode::Optimization {
            return;
        }
        let parent = ctx.parent();
        let mut open = self.open_calls.lock();
        if let Some(frame) = parent {
            if let Some(parent_call) = open.get_mut(&frame.request_id) {
                parent_call.child_tools.push(ctx.tool_name.clone());
            }
        }
        open.insert(
            ctx.request_id.clone(),
            OpenCall {
                parent_tool: parent.map(|f| f.tool_name.clone()),
                child_tools: Vec::new(),
            },
        );
    }

    fn finish(&self, ctx: &CallContext, error: Option<String>) {
        let open = self.open_calls.lock().remove(&ctx.request_id);
        let end: DateTime<Utc> = Utc::now();

        let sample = match open {
            Some(call) => {
                let usage = self.sampler.sample();
                PerformanceSample::Detailed {
                    tool: ctx.tool_name.clone(),
                    request_id: ctx.request_id.clone(),
                    params: ctx.args.clone(),
                    start: ctx.started_at,
                    end,
                    duration_ms: ctx.elapsed().as_secs_f64() * 1000.0,
                    memory_mb: usage.memory_mb,
                    cpu_pct: usage.cpu_pct,
                    parent_tool: call.parent_tool,
                    child_tools: call.child_tools,
                    error,
                }
            }
            None => PerformanceSample::Minimal {
                tool: ctx.tool_name.clone(),
                params_digest: truncate_chars(&ctx.args.to_string(), self.settings.params_digest_chars),
                start: ctx.started_at,
                end,
            },
        };

        self.record(&ctx.request_id, sample);
    }

    /// Cache, count and persist one sample
    pub fn record(&self, request_id: &str, sample: PerformanceSample) {
        let tool = sample.tool().to_string();
        self.cache_for(&tool).put(request_id.to_string(), sample.clone());
        self.count(&tool);

        match &self.waker {
            Some(waker) => {
                let queued = self.queue.enqueue(sample);
                if queued >= self.settings.batch_size {
                    waker.wake();
                }
            }
            None => {
                if let Err(e) = self.queue.storage.append(std::slice::from_ref(&sample)) {
                    warn!("Failed to persist performance sample for '{}': {:#}", tool, e);
                }
            }
        }
    }

    fn count(&self, tool: &str) {
        let count = {
            let mut counts = self.counts.lock();
            let count = counts.entry(tool.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if count >= self.settings.trigger_threshold && self.flagged.lock().insert(tool.to_string()) {
            info!("Tool '{}' reached {} samples and is due for optimization", tool, count);
        }
    }
}

impl Drop for PerformanceStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Interceptor for PerformanceStore {
    fn name(&self) -> &str {
        "performance_store"
    }

    fn priority(&self) -> i32 {
        priority::PERFORMANCE_STORE
    }

    fn before_execution(&self, ctx: &mut CallContext) -> Result<()> {
        self.begin(ctx);
        Ok(())
    }

    fn after_execution(&self, _output: &mut dyn ToolOutput, ctx: &mut CallContext) -> Result<()> {
        self.finish(ctx, None);
        Ok(())
    }

    fn on_exception(&self, failure: &ToolFailure, ctx: &mut CallContext) -> Result<ExceptionAction> {
        self.finish(ctx, Some(failure.to_string()));
        Ok(ExceptionAction::Propagate)
    }
}
