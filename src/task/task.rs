use crate::cluster::offload::ClusterTaskContext;
use crate::deps::bottom_map::TaskDataAccesses;
use crate::deps::registration::AccessSpec;
use crate::workflow::TaskWorkflow;
use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

/// Node-local task identity. Cluster messages pair it with the sender rank,
/// which makes it unique across the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// Fire-and-forget top-level task; never offloaded.
        const SPAWNED           = 1 << 0;
        /// Wrapper representing a task offloaded *to* this node.
        const REMOTE            = 1 << 1;
        /// Inlined into the parent once its dependencies allow; never
        /// offloaded.
        const IF0               = 1 << 2;
        /// The runtime's root task.
        const MAIN              = 1 << 3;
        /// Local representation of a task offloaded *from* this node.
        const OFFLOADED         = 1 << 4;
        /// Body returned.
        const FINISHED          = 1 << 8;
        /// Every child task has been disposed.
        const CHILDREN_FINISHED = 1 << 9;
        /// `mark_as_released` succeeded; disposal may proceed.
        const RELEASED          = 1 << 10;
        /// Parked in `block_current_task`.
        const BLOCKED           = 1 << 11;
    }
}

/// What runs when the task executes. Typed bodies reference a task type
/// registered on every node and carry a plain argument block, which is what
/// makes them offloadable; closures stay local.
pub enum TaskBody {
    Closure(Box<dyn FnOnce() + Send>),
    Typed {
        info: Arc<TaskTypeInfo>,
        args: Vec<u8>,
    },
}

/// A task type known under the same label on every node.
pub struct TaskTypeInfo {
    pub label: String,
    pub run: fn(&mut [u8]),
}

struct WaitState {
    taskwait_pending: usize,
    blocked: bool,
}

/// A unit of work with declared region accesses. Created, registered,
/// submitted, executed by a worker, unregistered and finally disposed; the
/// two counters gate the transitions (predecessors for readiness, releases
/// for unregistration).
pub struct Task {
    id: TaskId,
    label: Option<String>,
    flags: AtomicU32,
    parent: Option<Arc<Task>>,
    priority: AtomicI64,

    body: Mutex<Option<TaskBody>>,
    completion: Mutex<Option<Box<dyn FnOnce() + Send>>>,

    /// Strong access fragments not yet satisfied, plus a registration guard
    /// of one so the task cannot turn ready mid-registration.
    remaining_predecessors: AtomicU32,
    /// One for the body, plus one per external event and one per live child.
    /// Zero means the accesses can be unregistered.
    release_count: AtomicU32,
    pending_children: AtomicU32,

    pub(crate) accesses: TaskDataAccesses,
    pub(crate) declared: Mutex<Vec<AccessSpec>>,
    pub(crate) workflow: Mutex<Option<Arc<TaskWorkflow>>>,
    pub(crate) cluster: Mutex<Option<ClusterTaskContext>>,

    wait: Mutex<WaitState>,
    wait_cv: Condvar,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        label: Option<String>,
        body: Option<TaskBody>,
        flags: TaskFlags,
        parent: Option<Arc<Task>>,
        priority: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            label,
            flags: AtomicU32::new(flags.bits()),
            parent,
            priority: AtomicI64::new(priority),
            body: Mutex::new(body),
            completion: Mutex::new(None),
            remaining_predecessors: AtomicU32::new(1),
            release_count: AtomicU32::new(1),
            pending_children: AtomicU32::new(0),
            accesses: TaskDataAccesses::new(),
            declared: Mutex::new(Vec::new()),
            workflow: Mutex::new(None),
            cluster: Mutex::new(None),
            wait: Mutex::new(WaitState {
                taskwait_pending: 0,
                blocked: false,
            }),
            wait_cv: Condvar::new(),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn parent(&self) -> Option<Arc<Task>> {
        self.parent.clone()
    }

    pub fn priority(&self) -> i64 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: i64) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flag(&self, flag: TaskFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn is_spawned(&self) -> bool {
        self.flags().contains(TaskFlags::SPAWNED)
    }

    pub fn is_remote(&self) -> bool {
        self.flags().contains(TaskFlags::REMOTE)
    }

    pub fn is_if0(&self) -> bool {
        self.flags().contains(TaskFlags::IF0)
    }

    pub fn is_main(&self) -> bool {
        self.flags().contains(TaskFlags::MAIN)
    }

    pub fn has_finished(&self) -> bool {
        self.flags().contains(TaskFlags::FINISHED)
    }

    pub(crate) fn set_completion(&self, callback: Box<dyn FnOnce() + Send>) {
        *self.completion.lock() = Some(callback);
    }

    pub(crate) fn take_completion(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.completion.lock().take()
    }

    pub(crate) fn take_body(&self) -> Option<TaskBody> {
        self.body.lock().take()
    }

    pub(crate) fn has_typed_body(&self) -> bool {
        matches!(&*self.body.lock(), Some(TaskBody::Typed { .. }))
    }

    /// Label and argument block of a typed body, for the offload message.
    pub(crate) fn typed_body_parts(&self) -> Option<(String, Vec<u8>)> {
        match &*self.body.lock() {
            Some(TaskBody::Typed { info, args }) => Some((info.label.clone(), args.clone())),
            _ => None,
        }
    }

    pub(crate) fn take_declared_accesses(&self) -> Vec<AccessSpec> {
        std::mem::take(&mut *self.declared.lock())
    }

    // --- readiness countdown ---

    pub(crate) fn add_predecessor(&self) {
        self.remaining_predecessors.fetch_add(1, Ordering::AcqRel);
    }

    /// True when the countdown reached zero and the task turned ready.
    pub(crate) fn decrement_predecessors(&self) -> bool {
        let previous = self.remaining_predecessors.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "predecessor countdown underflow");
        previous == 1
    }

    /// Drop the registration guard; true when the task is ready right away.
    pub(crate) fn finish_registration(&self) -> bool {
        self.decrement_predecessors()
    }

    // --- release counter ---

    pub(crate) fn increase_release_count(&self, amount: u32) {
        self.release_count.fetch_add(amount, Ordering::AcqRel);
    }

    /// True when the counter reached zero: no events pending, all children
    /// disposed, dependencies unregisterable.
    pub(crate) fn decrease_release_count(&self, amount: u32) -> bool {
        let previous = self.release_count.fetch_sub(amount, Ordering::AcqRel);
        debug_assert!(previous >= amount, "release counter underflow");
        previous == amount
    }

    /// Separates unregistration from disposal: only the caller that wins
    /// this CAS disposes the task.
    pub(crate) fn mark_as_released(&self) -> bool {
        let released = TaskFlags::RELEASED.bits();
        self.flags.fetch_or(released, Ordering::AcqRel) & released == 0
    }

    // --- children ---

    pub(crate) fn child_created(&self) {
        self.pending_children.fetch_add(1, Ordering::AcqRel);
        self.increase_release_count(1);
    }

    /// Called when a child is disposed; true when the parent's release
    /// counter reached zero as a result.
    pub(crate) fn child_disposed(&self) -> bool {
        if self.pending_children.fetch_sub(1, Ordering::AcqRel) == 1 && self.has_finished() {
            self.set_flag(TaskFlags::CHILDREN_FINISHED);
        }
        self.decrease_release_count(1)
    }

    // --- taskwait / blocking ---

    pub(crate) fn arm_taskwait(&self, fragments: usize) {
        self.wait.lock().taskwait_pending += fragments;
    }

    pub(crate) fn taskwait_fragment_done(&self) {
        let mut wait = self.wait.lock();
        debug_assert!(wait.taskwait_pending > 0);
        wait.taskwait_pending -= 1;
        if wait.taskwait_pending == 0 {
            self.wait_cv.notify_all();
        }
    }

    pub(crate) fn taskwait_pending(&self) -> bool {
        self.wait.lock().taskwait_pending > 0
    }

    pub(crate) fn mark_blocked(&self) {
        self.set_flag(TaskFlags::BLOCKED);
        self.wait.lock().blocked = true;
    }

    pub(crate) fn unblock(&self) {
        self.flags
            .fetch_and(!TaskFlags::BLOCKED.bits(), Ordering::AcqRel);
        self.wait.lock().blocked = false;
        self.wait_cv.notify_all();
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.wait.lock().blocked
    }

    /// Park briefly on the wait condvar; used by the cooperative wait loops
    /// between attempts to run other ready work.
    pub(crate) fn park_wait(&self, timeout: std::time::Duration) {
        let mut wait = self.wait.lock();
        if wait.taskwait_pending == 0 && !wait.blocked {
            return;
        }
        self.wait_cv.wait_for(&mut wait, timeout);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Task: Send, Sync);

    #[test]
    fn release_counter_guards_unregistration() {
        let task = Task::new(TaskId(1), None, None, TaskFlags::empty(), None, 0);

        task.increase_release_count(2); // two events
        assert!(!task.decrease_release_count(1)); // body done
        assert!(!task.decrease_release_count(1)); // first event
        assert!(task.decrease_release_count(1)); // second event: now zero
    }

    #[test]
    fn released_cas_wins_once() {
        let task = Task::new(TaskId(2), None, None, TaskFlags::empty(), None, 0);
        assert!(task.mark_as_released());
        assert!(!task.mark_as_released());
    }

    #[test]
    fn children_keep_the_parent_alive() {
        let parent = Task::new(TaskId(3), None, None, TaskFlags::empty(), None, 0);
        parent.child_created();
        parent.set_flag(TaskFlags::FINISHED);

        assert!(!parent.decrease_release_count(1)); // body
        assert!(parent.child_disposed());
        assert!(parent.flags().contains(TaskFlags::CHILDREN_FINISHED));
    }
}
