use crate::runtime::{RuntimeInner, context};
use crate::task::Task;
use std::sync::Arc;

/// Opaque handle onto a task's release counter, for external events (device
/// completions, I/O callbacks, anything outside the worker loop). The task
/// is not released until every registered event is fulfilled.
pub struct EventCounter {
    pub(crate) task: Arc<Task>,
    pub(crate) runtime: Arc<RuntimeInner>,
}

impl EventCounter {
    pub fn increase(&self, amount: u32) {
        self.task.increase_release_count(amount);
    }

    /// Fulfil events; the last one triggers access unregistration exactly
    /// as if the body had just finished.
    pub fn decrease(&self, amount: u32) {
        if self.task.decrease_release_count(amount) {
            self.runtime.release_task(&self.task, context::current_cpu());
        }
    }
}
