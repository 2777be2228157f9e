use crate::scheduler::queue::ReadyQueue;
use crate::scheduler::ReadyTaskHint;
use crate::task::Task;
use std::sync::Arc;

/// The inner, unsynchronized host scheduler. The synchronized façade owns it
/// behind its lock; nothing here synchronizes.
pub(crate) struct UnsyncScheduler {
    ready: ReadyQueue,
    /// Per-CPU immediate-successor slots: a task that became ready as the
    /// unique successor of a just-completed task stays on that CPU and is
    /// picked with no queue traffic.
    immediate: Vec<Option<Arc<Task>>>,
    enable_immediate: bool,
}

impl UnsyncScheduler {
    pub(crate) fn new(cpu_count: usize, enable_priority: bool, enable_immediate: bool) -> Self {
        Self {
            ready: ReadyQueue::new(enable_priority),
            immediate: vec![None; cpu_count],
            enable_immediate,
        }
    }

    pub(crate) fn add(&mut self, task: Arc<Task>, cpu_hint: Option<usize>, hint: ReadyTaskHint) {
        match hint {
            ReadyTaskHint::ImmediateSuccessor if self.enable_immediate => {
                if let Some(cpu) = cpu_hint {
                    let slot = &mut self.immediate[cpu];
                    if slot.is_none() {
                        *slot = Some(task);
                        return;
                    }
                }
                self.ready.push(task);
            }
            ReadyTaskHint::Unblocked => self.ready.push_front(task),
            _ => self.ready.push(task),
        }
    }

    pub(crate) fn get(&mut self, cpu: usize) -> Option<Arc<Task>> {
        if let Some(task) = self.immediate.get_mut(cpu).and_then(|slot| slot.take()) {
            return Some(task);
        }
        self.ready.pop()
    }

    /// True iff a subsequent `get(cpu)` would return a task in this state.
    pub(crate) fn has_work(&self, cpu: usize) -> bool {
        self.immediate.get(cpu).is_some_and(|s| s.is_some()) || !self.ready.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn queued_len(&self) -> usize {
        self.ready.len() + self.immediate.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskFlags, TaskId};

    fn task(id: u64) -> Arc<Task> {
        Task::new(TaskId(id), None, None, TaskFlags::empty(), None, 0)
    }

    #[test]
    fn immediate_successor_slot_is_per_cpu() {
        let mut s = UnsyncScheduler::new(2, false, true);
        s.add(task(1), Some(1), ReadyTaskHint::ImmediateSuccessor);
        s.add(task(2), None, ReadyTaskHint::None);

        // CPU 0 skips the slot of CPU 1.
        assert_eq!(s.get(0).unwrap().id().0, 2);
        assert_eq!(s.get(1).unwrap().id().0, 1);
        assert!(s.get(0).is_none());
    }

    #[test]
    fn occupied_slot_falls_back_to_the_queue() {
        let mut s = UnsyncScheduler::new(1, false, true);
        s.add(task(1), Some(0), ReadyTaskHint::ImmediateSuccessor);
        s.add(task(2), Some(0), ReadyTaskHint::ImmediateSuccessor);

        assert!(s.has_work(0));
        assert_eq!(s.queued_len(), 2);
        assert_eq!(s.get(0).unwrap().id().0, 1);
        assert_eq!(s.get(0).unwrap().id().0, 2);
    }

    #[test]
    fn has_work_matches_get() {
        let mut s = UnsyncScheduler::new(2, true, true);
        assert!(!s.has_work(0));
        s.add(task(1), None, ReadyTaskHint::None);
        assert!(s.has_work(0));
        assert!(s.has_work(1));
        let _ = s.get(0);
        assert!(!s.has_work(1));
    }
}
