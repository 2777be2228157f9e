use crate::deps::access::{AccessFlags, DataAccess};
use crate::deps::region::DataRegion;
use crate::numa::MemoryPlace;
use crate::task::Task;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;

/// A satisfiability delta in flight towards one access.
pub(crate) struct UpdateOperation {
    pub(crate) target: Arc<DataAccess>,
    pub(crate) flags: AccessFlags,
    pub(crate) location: Option<MemoryPlace>,
    pub(crate) write_id: u64,
}

impl UpdateOperation {
    pub(crate) fn new(target: Arc<DataAccess>, flags: AccessFlags) -> Self {
        Self {
            target,
            flags,
            location: None,
            write_id: 0,
        }
    }

    pub(crate) fn with_data(
        target: Arc<DataAccess>,
        flags: AccessFlags,
        location: Option<MemoryPlace>,
        write_id: u64,
    ) -> Self {
        Self {
            target,
            flags,
            location,
            write_id,
        }
    }
}

/// Side effects of a dependency-engine walk, batched per worker so the access
/// locks are released before any of them touch the scheduler. The worker
/// drains this after every registration/unregistration.
#[derive(Default)]
pub(crate) struct CpuDependencyData {
    /// Pending satisfiability messages; processed as a worklist so deep
    /// chains never recurse.
    pub(crate) delayed: VecDeque<UpdateOperation>,
    /// Tasks whose last predecessor was just satisfied; to be posted to the
    /// scheduler.
    pub(crate) satisfied_originators: SmallVec<[Arc<Task>; 8]>,
    /// Tasks that finished unregistration and can be disposed.
    pub(crate) removable_tasks: SmallVec<[Arc<Task>; 4]>,
    /// Commutative regions released by completed accesses; the engine walks
    /// the scoreboard waiters before control returns to the worker.
    pub(crate) released_commutative: SmallVec<[DataRegion; 4]>,
}

impl CpuDependencyData {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.delayed.is_empty()
            && self.satisfied_originators.is_empty()
            && self.removable_tasks.is_empty()
            && self.released_commutative.is_empty()
    }
}
