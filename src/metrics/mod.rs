//! Live duration statistics and variance detection
//!
//! Keeps a fixed window of recent durations per tool and flags calls that
//! deviate from the window's mean.

pub mod stats;
pub mod variance;

pub use stats::{mean, percentile, sample_stdev, ToolStats};
pub use variance::{VarianceDetector, VarianceEvent, VarianceSettings};
