use crate::workers::cpu::{Cpu, CpuState};
use parking_lot::Mutex;
use std::sync::Arc;

struct IdleInner {
    /// Idle CPU ids grouped by NUMA node, so resumption can stay local.
    per_node: Vec<Vec<usize>>,
    idle: Vec<bool>,
}

/// The idle-CPU set. One lock guards both the bitmap and the idle-admission
/// decision: a CPU only marks itself idle after re-checking for work under
/// this lock, which closes the window where an enqueue could be missed.
pub(crate) struct IdleCpus {
    cpus: Vec<Arc<Cpu>>,
    inner: Mutex<IdleInner>,
}

impl IdleCpus {
    pub(crate) fn new(cpus: Vec<Arc<Cpu>>, numa_nodes: usize) -> Self {
        let idle = vec![false; cpus.len()];
        Self {
            cpus,
            inner: Mutex::new(IdleInner {
                per_node: vec![Vec::new(); numa_nodes.max(1)],
                idle,
            }),
        }
    }

    pub(crate) fn cpu(&self, index: usize) -> &Arc<Cpu> {
        &self.cpus[index]
    }

    pub(crate) fn cpus(&self) -> &[Arc<Cpu>] {
        &self.cpus
    }

    /// Try to mark `cpu` idle. `has_work` is evaluated under the idle lock;
    /// if it reports pending work the CPU stays running and the caller loops
    /// again instead of parking.
    pub(crate) fn cpu_becomes_idle(&self, index: usize, has_work: impl Fn() -> bool) -> bool {
        let mut inner = self.inner.lock();
        if has_work() {
            return false;
        }
        let cpu = &self.cpus[index];
        inner.idle[index] = true;
        inner.per_node[cpu.numa_node].push(index);
        cpu.set_state(CpuState::AcquiredIdle);
        true
    }

    /// Wake one idle CPU, preferring `preferred_node`. Returns false when
    /// nobody is idle (every worker is already running).
    pub(crate) fn resume_one(&self, preferred_node: Option<usize>) -> bool {
        let mut inner = self.inner.lock();

        let index = preferred_node
            .and_then(|node| inner.per_node.get_mut(node).and_then(|v| v.pop()))
            .or_else(|| {
                inner
                    .per_node
                    .iter_mut()
                    .find_map(|node| node.pop())
            });

        match index {
            Some(index) => {
                inner.idle[index] = false;
                let cpu = &self.cpus[index];
                cpu.set_state(CpuState::AcquiredRunning);
                cpu.resume();
                true
            }
            None => false,
        }
    }

    /// Wake everyone; used at shutdown so workers observe the flag.
    pub(crate) fn resume_all(&self) {
        let mut inner = self.inner.lock();
        for node in inner.per_node.iter_mut() {
            node.clear();
        }
        for (index, idle) in inner.idle.iter_mut().enumerate() {
            if *idle {
                *idle = false;
                self.cpus[index].set_state(CpuState::AcquiredRunning);
            }
        }
        for cpu in &self.cpus {
            cpu.resume();
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.inner.lock().idle.iter().filter(|i| **i).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_set(n: usize) -> IdleCpus {
        let cpus = (0..n).map(|id| Arc::new(Cpu::new(id, id, 0))).collect();
        IdleCpus::new(cpus, 1)
    }

    #[test]
    fn idle_admission_rechecks_for_work() {
        let set = idle_set(2);
        assert!(!set.cpu_becomes_idle(0, || true), "work visible: stay running");
        assert!(set.cpu_becomes_idle(0, || false));
        assert_eq!(set.idle_count(), 1);
    }

    #[test]
    fn resume_clears_the_bitmap() {
        let set = idle_set(2);
        assert!(set.cpu_becomes_idle(0, || false));
        assert!(set.cpu_becomes_idle(1, || false));

        assert!(set.resume_one(None));
        assert_eq!(set.idle_count(), 1);
        assert!(set.resume_one(None));
        assert!(!set.resume_one(None), "no idle CPUs left");
    }
}
