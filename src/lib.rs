//! toolwatch - tool-call interception and telemetry
//!
//! Wraps tool invocations in a chain of interceptors that:
//! - Capture failures with full call context and ship them to Loki
//! - Flag calls whose duration deviates from the recent mean
//! - Record per-tool performance samples in memory and on disk
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use toolwatch::{Telemetry, TelemetryConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let telemetry = Telemetry::from_config(TelemetryConfig::load()?)?;
//!     let sum: Result<i64, std::fmt::Error> =
//!         telemetry.intercept("sum_tool", json!([2, 3]), None, |args, _ctx| {
//!             Ok(args[0].as_i64().unwrap_or(0) + args[1].as_i64().unwrap_or(0))
//!         });
//!     println!("{:?}", sum);
//!     telemetry.shutdown();
//!     Ok(())
//! }
//! ```

// Foundations
pub mod types;
pub mod error;
pub mod cache;
pub mod worker;
pub mod shipper;
pub mod interceptor;
pub mod config;
pub mod cli;

// Interceptors
pub mod monitor;
pub mod metrics;
pub mod perf;
pub mod telemetry;

pub use cache::{BoundedCache, Capacity};
pub use config::TelemetryConfig;
pub use error::{QueryError, ShipError};
pub use interceptor::{Completion, ExceptionAction, Interceptor, InterceptorChain};
pub use metrics::{ToolStats, VarianceDetector, VarianceEvent};
pub use monitor::{ExceptionMonitor, PanicCapture};
pub use perf::{PerfMode, PerformanceSample, PerformanceStore};
pub use shipper::{DiscardSink, HttpLogSink, LogShipper, LogSink, MemorySink};
pub use telemetry::Telemetry;
pub use types::{
    CallContext, ContextSnapshot, ExceptionRecord, InvocationPhase, Severity, StackTrace,
    ToolFailure, ToolOutput,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
