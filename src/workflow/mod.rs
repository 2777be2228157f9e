use crate::runtime::RuntimeInner;
use crate::task::Task;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

pub(crate) mod cluster;

/// Step lifetime. A step only ever advances Live → Releasing → Done, and is
/// freed by the last Arc that drops it; no callback can outlive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum StepState {
    Live = 0,
    Releasing = 1,
    Done = 2,
}

/// What a step does when it starts.
pub(crate) enum StepWork {
    /// Completes immediately; anchors the DAG.
    Start,
    /// Stands in for remote execution: completes when the offloadee's
    /// TaskFinished message arrives.
    ClusterExecute,
    /// Unregisters the accesses of an offloaded task's local
    /// representation, releasing its successors.
    Release(Weak<Task>),
}

/// A node of the per-task execution DAG. Completion releases the successors
/// by decrementing their predecessor counts; a successor whose count reaches
/// zero starts.
pub(crate) struct Step {
    work: StepWork,
    state: AtomicU8,
    pending_predecessors: AtomicU32,
    successors: Mutex<SmallVec<[Arc<Step>; 2]>>,
}

impl Step {
    pub(crate) fn new(work: StepWork, pending_predecessors: u32) -> Arc<Self> {
        Arc::new(Self {
            work,
            state: AtomicU8::new(StepState::Live as u8),
            pending_predecessors: AtomicU32::new(pending_predecessors),
            successors: Mutex::new(SmallVec::new()),
        })
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> StepState {
        match self.state.load(Ordering::Acquire) {
            0 => StepState::Live,
            1 => StepState::Releasing,
            _ => StepState::Done,
        }
    }

    pub(crate) fn add_successor(&self, successor: Arc<Step>) {
        self.successors.lock().push(successor);
    }

    /// Run the step's work. Steps whose work completes synchronously release
    /// their successors before returning; the others complete later through
    /// [`complete`](Self::complete).
    pub(crate) fn start(self: &Arc<Self>, runtime: &Arc<RuntimeInner>) {
        match &self.work {
            StepWork::Start => self.complete(runtime),
            StepWork::ClusterExecute => { /* completed by the TaskFinished handler */ }
            StepWork::Release(task) => {
                if let Some(task) = task.upgrade() {
                    runtime.finish_offloaded_representation(&task);
                }
                self.complete(runtime);
            }
        }
    }

    /// The step's work is done: release every successor, then retire.
    pub(crate) fn complete(self: &Arc<Self>, runtime: &Arc<RuntimeInner>) {
        let was = self.state.compare_exchange(
            StepState::Live as u8,
            StepState::Releasing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if was.is_err() {
            return; // already releasing or done
        }

        let successors = std::mem::take(&mut *self.successors.lock());
        for successor in successors {
            successor.predecessor_done(runtime);
        }

        self.state.store(StepState::Done as u8, Ordering::Release);
    }

    fn predecessor_done(self: &Arc<Self>, runtime: &Arc<RuntimeInner>) {
        if self.pending_predecessors.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.start(runtime);
        }
    }
}

/// The execution DAG of a task offloaded from this node:
/// `[start] → [cluster-execute] → [release]`, with the data-link steps
/// running alongside, hooked directly into the accesses.
pub(crate) struct TaskWorkflow {
    start: Arc<Step>,
    execute: Arc<Step>,
}

impl TaskWorkflow {
    pub(crate) fn new_offloaded(task: &Arc<Task>) -> Arc<Self> {
        let start = Step::new(StepWork::Start, 1);
        let execute = Step::new(StepWork::ClusterExecute, 1);
        let release = Step::new(StepWork::Release(Arc::downgrade(task)), 1);

        start.add_successor(execute.clone());
        execute.add_successor(release);

        Arc::new(Self { start, execute })
    }

    /// The offload message went out; let the DAG run.
    pub(crate) fn begin(&self, runtime: &Arc<RuntimeInner>) {
        self.start.predecessor_done(runtime);
    }

    /// TaskFinished arrived from the offloadee.
    pub(crate) fn remote_finished(&self, runtime: &Arc<RuntimeInner>) {
        self.execute.complete(runtime);
    }
}

#[cfg(test)]
mod tests;
