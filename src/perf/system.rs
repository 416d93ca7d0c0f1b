//! Process resource sampling for detailed performance samples

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

/// Memory and CPU of the current process at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub memory_mb: Option<f64>,
    pub cpu_pct: Option<f32>,
}

/// Reads the current process from the OS process table
pub struct SystemSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                debug!("Process sampling unavailable: {}", e);
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }

    /// Current usage; fields are `None` when the platform does not report them.
    ///
    /// CPU usage is relative to the previous sample, so the first reading is 0.
    pub fn sample(&self) -> ResourceUsage {
        let Some(pid) = self.pid else {
            return ResourceUsage::default();
        };

        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) => ResourceUsage {
                memory_mb: Some(process.memory() as f64 / (1024.0 * 1024.0)),
                cpu_pct: Some(process.cpu_usage()),
            },
            None => ResourceUsage::default(),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_reports_non_negative_values() {
        let usage = SystemSampler::new().sample();
        if let Some(memory) = usage.memory_mb {
            assert!(memory >= 0.0);
        }
        if let Some(cpu) = usage.cpu_pct {
            assert!(cpu >= 0.0);
        }
    }
}
