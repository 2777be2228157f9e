//! # taskweave
//!
//! A task-parallel runtime with data-flow dependencies.
//!
//! Applications submit tasks annotated with memory-region accesses (read /
//! write / read-write / concurrent / commutative / reduction, optionally
//! weak); the runtime discovers concurrency from the per-region access
//! chains, enforces the implied ordering, and schedules ready tasks onto
//! worker threads pinned to CPUs. With a cluster transport plugged in, it
//! transparently offloads tasks to the node holding their data and keeps
//! satisfiability flowing across nodes.
//!
//! ## Quick start
//!
//! ```ignore
//! use taskweave::{AccessType, Builder, DataRegion};
//!
//! let runtime = Builder::new().worker_threads(4).try_build()?;
//!
//! let mut x = 0u64;
//! let region = DataRegion::of(&x);
//! let ptr = &mut x as *mut u64 as usize;
//!
//! runtime
//!     .task("producer")
//!     .access(AccessType::Out, false, region)
//!     .body(move || unsafe { *(ptr as *mut u64) = 41 })
//!     .submit();
//! runtime
//!     .task("consumer")
//!     .access(AccessType::InOut, false, region)
//!     .body(move || unsafe { *(ptr as *mut u64) += 1 })
//!     .submit();
//!
//! runtime.wait_quiescent();
//! assert_eq!(x, 42);
//! ```

use crate::deps::registration::AccessSpec;
use crate::error::fatal;
use crate::runtime::RuntimeInner;
use crate::runtime::context;
use crate::task::{Task, TaskBody, TaskFlags, TaskTypeInfo};
use crate::workers::worker::cooperative_wait;
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub mod cluster;
pub mod deps;
mod error;
pub mod numa;
pub mod runtime;
pub mod scheduler;
pub mod system;
pub mod task;
pub(crate) mod workers;
pub(crate) mod workflow;

#[cfg(test)]
pub(crate) mod test_utils;
#[cfg(test)]
mod tests;

pub use cluster::dsm::{Dsm, SpanDsm};
pub use cluster::messenger::{LoopbackFabric, LoopbackMessenger, Messenger, PendingHandle};
pub use deps::{AccessType, DataRegion, ReductionSpec};
pub use numa::{CpuDescriptor, FlatTopology, MemoryPlace, Topology};
pub use runtime::{Builder, ClusterSetup};
pub use scheduler::ReadyTaskHint;
pub use scheduler::cluster::ClusterPolicy;
pub use task::{EventCounter, TaskId};

/// Handle to a running runtime instance. Dropping it shuts the runtime
/// down; clones share the same instance.
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Register a task type under a label known on every node; required for
    /// offloadable (typed) tasks.
    pub fn register_task_type(&self, label: impl Into<String>, run: fn(&mut [u8])) {
        let label = label.into();
        self.inner.task_types.insert(
            label.clone(),
            Arc::new(TaskTypeInfo { label, run }),
        );
    }

    /// Start building a task.
    pub fn task(&self, label: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(self.inner.clone(), label.into())
    }

    /// Fire-and-forget top-level task with an optional completion callback.
    pub fn spawn_function(
        &self,
        body: impl FnOnce() + Send + 'static,
        completion: Option<Box<dyn FnOnce() + Send>>,
        label: impl Into<String>,
    ) {
        let task = self.inner.create_task(
            Some(label.into()),
            Some(TaskBody::Closure(Box::new(body))),
            TaskFlags::SPAWNED,
            0,
            Some(self.inner.main_task().clone()),
        );
        if let Some(completion) = completion {
            task.set_completion(completion);
        }
        self.inner.submit_task(&task);
    }

    /// Wait until every submitted task has been disposed.
    pub fn wait_quiescent(&self) {
        self.inner.wait_quiescent();
    }

    /// Structural join with the current task's children (or with every task
    /// when called from outside a task body).
    pub fn taskwait(&self) {
        self.inner.taskwait();
    }

    /// Suspend the current task; its worker keeps running other ready work.
    pub fn block_current_task(&self) {
        self.inner.block_current_task();
    }

    pub fn unblock_task(&self, handle: &TaskHandle) {
        self.inner.unblock_task(&handle.0);
    }

    /// Opaque event counter of the current task; see [`EventCounter`].
    pub fn current_event_counter(&self) -> Option<EventCounter> {
        let task = context::current_task()?;
        Some(EventCounter {
            task,
            runtime: self.inner.clone(),
        })
    }

    /// Record a first-touch home for `region` in the NUMA directory; feeds
    /// the cluster locality policy.
    pub fn register_first_touch(&self, region: DataRegion, node: usize) {
        self.inner.directory.register_home(region, node);
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

/// Handle to a submitted task.
pub struct TaskHandle(pub(crate) Arc<Task>);

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.0.id()
    }

    pub fn has_finished(&self) -> bool {
        self.0.has_finished()
    }
}

enum BodyKind {
    None,
    Closure(Box<dyn FnOnce() + Send>),
    Typed { label: String, args: Vec<u8> },
}

/// Builder for one task: label, priority, flags, accesses and body, then
/// `submit`. Obtained from [`Runtime::task`], or from [`task`] inside a
/// running body.
pub struct TaskBuilder {
    inner: Arc<RuntimeInner>,
    label: Option<String>,
    priority: i64,
    flags: TaskFlags,
    body: BodyKind,
    completion: Option<Box<dyn FnOnce() + Send>>,
    accesses: Vec<AccessSpec>,
}

impl TaskBuilder {
    fn new(inner: Arc<RuntimeInner>, label: String) -> Self {
        TaskBuilder {
            inner,
            label: Some(label),
            priority: 0,
            flags: TaskFlags::empty(),
            body: BodyKind::None,
            completion: None,
            accesses: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// The task is inlined: submission returns only once it has run.
    pub fn if0(mut self) -> Self {
        self.flags |= TaskFlags::IF0;
        self
    }

    pub fn body(mut self, body: impl FnOnce() + Send + 'static) -> Self {
        self.body = BodyKind::Closure(Box::new(body));
        self
    }

    /// Use a registered task type; this is what makes a task offloadable.
    pub fn typed(mut self, label: impl Into<String>, args: Vec<u8>) -> Self {
        self.body = BodyKind::Typed {
            label: label.into(),
            args,
        };
        self
    }

    pub fn on_completion(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.completion = Some(Box::new(callback));
        self
    }

    /// Declare a region access.
    pub fn access(mut self, ty: AccessType, weak: bool, region: DataRegion) -> Self {
        self.accesses.push(AccessSpec {
            ty,
            weak,
            region,
            reduction: None,
        });
        self
    }

    pub fn reads(self, region: DataRegion) -> Self {
        self.access(AccessType::In, false, region)
    }

    pub fn writes(self, region: DataRegion) -> Self {
        self.access(AccessType::Out, false, region)
    }

    pub fn readwrites(self, region: DataRegion) -> Self {
        self.access(AccessType::InOut, false, region)
    }

    pub fn concurrent(self, region: DataRegion) -> Self {
        self.access(AccessType::Concurrent, false, region)
    }

    pub fn commutative(self, region: DataRegion) -> Self {
        self.access(AccessType::Commutative, false, region)
    }

    pub fn reduction(mut self, region: DataRegion, spec: ReductionSpec) -> Self {
        self.accesses.push(AccessSpec {
            ty: AccessType::Reduction,
            weak: false,
            region,
            reduction: Some(spec),
        });
        self
    }

    pub fn submit(self) -> TaskHandle {
        let inner = &self.inner;

        let mut priority = self.priority;
        if inner.cfg.priority_from_cost
            && priority == 0
            && let Some(label) = &self.label
            && let Some(cost) = inner.wisdom.predicted_cost(label)
        {
            priority = (cost * 1e6) as i64;
        }

        let body = match self.body {
            BodyKind::None => None,
            BodyKind::Closure(body) => Some(TaskBody::Closure(body)),
            BodyKind::Typed { label, args } => {
                let Some(info) = inner.task_types.get(&label).map(|e| e.value().clone()) else {
                    fatal("task", format_args!("unknown task type {label:?}"));
                };
                Some(TaskBody::Typed { info, args })
            }
        };

        let task = inner.create_task(self.label, body, self.flags, priority, None);
        if let Some(completion) = self.completion {
            task.set_completion(completion);
        }
        *task.declared.lock() = self.accesses;
        inner.submit_task(&task);

        if task.flags().contains(TaskFlags::IF0) {
            let waited = task.clone();
            cooperative_wait(inner, None, || waited.has_finished());
        }
        TaskHandle(task)
    }
}

/// Accumulate into the calling task's private reduction slot for `region`.
/// Returns `None` when the current task has no reduction access covering
/// the region.
pub fn reduction_contribution<R>(
    region: DataRegion,
    f: impl FnOnce(&mut [u8]) -> R,
) -> Option<R> {
    let task = context::current_task()?;
    let access = {
        let inner = task.accesses.lock();
        inner
            .arena
            .iter()
            .find(|(_, a)| {
                a.access_type() == AccessType::Reduction && a.region().contains(&region)
            })
            .map(|(_, a)| a.clone())?
    };
    let slot = access.reduction_slot.load(Ordering::Acquire);
    if slot == crate::deps::access::NO_REDUCTION_SLOT {
        return None;
    }
    let info = access.reduction.lock().clone()?;
    Some(info.with_slot(slot, f))
}

/// Build a task from inside a running body, parented to the current task.
///
/// # Panics
///
/// Panics when called outside a worker thread.
pub fn task(label: impl Into<String>) -> TaskBuilder {
    match context::current_runtime() {
        Some(inner) => TaskBuilder::new(inner, label.into()),
        None => fatal("task", format_args!("task() outside a runtime context")),
    }
}

/// Event counter of the task currently executing on this thread.
pub fn current_event_counter() -> Option<EventCounter> {
    let runtime = context::current_runtime()?;
    let task = context::current_task()?;
    Some(EventCounter { task, runtime })
}

/// Taskwait from anywhere inside a worker-run body.
pub fn taskwait() {
    if let Some(runtime) = context::current_runtime() {
        runtime.taskwait();
    }
}

/// Block the current task; see [`Runtime::block_current_task`].
pub fn block_current_task() {
    match context::current_runtime() {
        Some(runtime) => runtime.block_current_task(),
        None => fatal("blocking", format_args!("block_current_task outside a runtime")),
    }
}
