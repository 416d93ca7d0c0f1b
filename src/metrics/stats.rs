//! Summary statistics over duration samples

use serde::{Deserialize, Serialize};

/// Statistics for one tool's recent durations, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub stdev: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
}

impl ToolStats {
    /// Compute statistics; `None` for an empty sample set
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        Some(Self {
            count: sorted.len(),
            mean: mean(&sorted),
            median: percentile(&sorted, 50.0),
            stdev: sample_stdev(&sorted),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        })
    }
}

pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Sample standard deviation (n - 1); zero below two samples
pub fn sample_stdev(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let m = mean(samples);
    let sum_sq: f64 = samples.iter().map(|x| (x - m).powi(2)).sum();
    (sum_sq / (samples.len() - 1) as f64).sqrt()
}

/// Linear-interpolated percentile of an ascending slice, `pct` in 0..=100
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (pct.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_empty() {
        assert!(ToolStats::from_samples(&[]).is_none());
        assert_eq!(sample_stdev(&[5.0]), 0.0);
    }

    #[test]
    fn test_basic_stats() {
        let stats = ToolStats::from_samples(&[4.0, 1.0, 3.0, 2.0, 5.0]).unwrap();
        assert_eq!(stats.count, 5);
        assert!(approx(stats.mean, 3.0));
        assert!(approx(stats.median, 3.0));
        assert!(approx(stats.min, 1.0));
        assert!(approx(stats.max, 5.0));
        // sqrt(10 / 4)
        assert!(approx(stats.stdev, 2.5_f64.sqrt()));
        assert!(approx(stats.p95, 4.8));
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted: Vec<f64> = (1..=100).map(f64::from).collect();
        assert!(approx(percentile(&sorted, 50.0), 50.5));
        assert!(approx(percentile(&sorted, 99.0), 99.01));
        assert!(approx(percentile(&sorted, 0.0), 1.0));
        assert!(approx(percentile(&sorted, 100.0), 100.0));
    }
}
