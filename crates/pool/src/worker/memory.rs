//! Worker memory sampling

use std::collections::HashMap;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

/// Source of memory usage samples for a worker, in bytes
///
/// Implemented for any `Fn(&str) -> u64` taking the worker id, which
/// makes it easy to simulate memory pressure.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self, worker_id: &str) -> u64;

    /// Forget any state kept for a worker that has exited
    fn release(&self, _worker_id: &str) {}
}

impl<F> MemoryProbe for F
where
    F: Fn(&str) -> u64 + Send + Sync,
{
    fn sample(&self, worker_id: &str) -> u64 {
        self(worker_id)
    }
}

/// Process resident set size growth since a worker's first sample
///
/// Worker threads share the process address space, so the raw RSS says
/// nothing about one worker. The first sample for a worker id records
/// the RSS as its baseline and reports 0; later samples report how far
/// the process has grown past that baseline.
pub struct ProcessMemoryProbe {
    pid: Pid,
    state: Mutex<ProbeState>,
}

struct ProbeState {
    system: System,
    baselines: HashMap<String, u64>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
        );

        Self {
            pid,
            state: Mutex::new(ProbeState {
                system,
                baselines: HashMap::new(),
            }),
        }
    }

    fn resident(&self, system: &mut System) -> u64 {
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        system.process(self.pid).map(|p| p.memory()).unwrap_or(0)
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn sample(&self, worker_id: &str) -> u64 {
        let mut state = self.state.lock();
        let rss = self.resident(&mut state.system);
        let baseline = *state.baselines.entry(worker_id.to_string()).or_insert(rss);
        rss.saturating_sub(baseline)
    }

    fn release(&self, worker_id: &str) {
        self.state.lock().baselines.remove(worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_probe() {
        let probe = |worker_id: &str| if worker_id == "worker-1" { 42 } else { 0 };
        assert_eq!(probe.sample("worker-1"), 42);
        assert_eq!(probe.sample("worker-2"), 0);
    }

    #[test]
    fn test_first_sample_sets_baseline() {
        let probe = ProcessMemoryProbe::new();
        assert_eq!(probe.sample("worker-1"), 0);
        assert_eq!(probe.state.lock().baselines.len(), 1);
        assert!(probe.state.lock().baselines["worker-1"] > 0);
    }

    #[test]
    fn test_growth_is_measured_from_each_baseline() {
        const MIB: usize = 1024 * 1024;
        let probe = ProcessMemoryProbe::new();
        probe.sample("worker-1");

        let block = vec![1u8; 64 * MIB];
        std::hint::black_box(&block);

        assert_eq!(probe.sample("worker-2"), 0);
        assert!(probe.sample("worker-1") > 16 * MIB as u64);
        drop(block);
    }

    #[test]
    fn test_release_forgets_baseline() {
        let probe = ProcessMemoryProbe::new();
        probe.sample("worker-1");
        probe.release("worker-1");
        assert!(probe.state.lock().baselines.is_empty());
        probe.release("worker-unknown");
    }
}
