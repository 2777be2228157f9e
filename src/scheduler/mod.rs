use crate::task::Task;
use crate::workers::idle::IdleCpus;
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) mod cluster;
pub(crate) mod queue;
pub(crate) mod unsync;

use unsync::UnsyncScheduler;

/// Why a task is being enqueued; the inner scheduler uses it to pick a
/// queue position or a per-CPU slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyTaskHint {
    None,
    /// Unique successor of a task that just completed on the hinted CPU.
    ImmediateSuccessor,
    /// Was blocked and is resuming; runs ahead of waiting work.
    Unblocked,
    /// Freshly submitted child task.
    Child,
    /// The hinted compute place is busy; no placement preference.
    BusyComputePlace,
}

/// The synchronized scheduler façade. One lock guards the inner queues;
/// tasks are copied into them under that lock and idle CPUs are resumed
/// after it drops, so the lock is never held across the idle set.
pub(crate) struct SyncScheduler {
    inner: Mutex<UnsyncScheduler>,
    idle: Arc<IdleCpus>,
}

impl SyncScheduler {
    pub(crate) fn new(
        cpu_count: usize,
        enable_priority: bool,
        enable_immediate: bool,
        idle: Arc<IdleCpus>,
    ) -> Self {
        Self {
            inner: Mutex::new(UnsyncScheduler::new(
                cpu_count,
                enable_priority,
                enable_immediate,
            )),
            idle,
        }
    }

    pub(crate) fn add_ready_task(
        &self,
        task: Arc<Task>,
        cpu_hint: Option<usize>,
        hint: ReadyTaskHint,
    ) {
        let preferred_node = cpu_hint.map(|cpu| self.idle.cpu(cpu).numa_node);
        self.inner.lock().add(task, cpu_hint, hint);
        self.idle.resume_one(preferred_node);
    }

    pub(crate) fn add_ready_tasks(
        &self,
        tasks: impl IntoIterator<Item = Arc<Task>>,
        cpu_hint: Option<usize>,
        hint: ReadyTaskHint,
    ) {
        let preferred_node = cpu_hint.map(|cpu| self.idle.cpu(cpu).numa_node);
        let mut count = 0;
        {
            let mut inner = self.inner.lock();
            for task in tasks {
                inner.add(task, cpu_hint, hint);
                count += 1;
            }
        }
        for _ in 0..count {
            if !self.idle.resume_one(preferred_node) {
                break;
            }
        }
    }

    pub(crate) fn get_ready_task(&self, cpu: usize) -> Option<Arc<Task>> {
        self.inner.lock().get(cpu)
    }

    /// True iff `get_ready_task(cpu)` would currently return a task. Used
    /// by the idle-admission check, under the idle-set lock.
    pub(crate) fn has_available_work(&self, cpu: usize) -> bool {
        self.inner.lock().has_work(cpu)
    }
}
