use crate::deps::access::{AccessFlags, AccessType, DataAccess, NO_REDUCTION_SLOT};
use crate::deps::batch::{CpuDependencyData, UpdateOperation};
use crate::deps::bottom_map::{AccessesInner, BottomMapEntry};
use crate::deps::commutative::CommutativeScoreboard;
use crate::deps::reduction::{ReductionInfo, ReductionSpec};
use crate::deps::region::DataRegion;
use crate::deps::write_id::WriteIdRegistry;
use crate::task::Task;
use smallvec::{SmallVec, smallvec};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// One declared access, as collected by `register_data_access` before the
/// task is submitted. Registration may fragment it into several records.
pub(crate) struct AccessSpec {
    pub(crate) ty: AccessType,
    pub(crate) weak: bool,
    pub(crate) region: DataRegion,
    pub(crate) reduction: Option<ReductionSpec>,
}

/// Where a new fragment hooks into the dependency graph.
enum Hook {
    /// Behind the last access of an existing chain; the entry's scope-owner
    /// access (if any) rides along unchanged.
    Predecessor {
        pred: Arc<DataAccess>,
        parent_access: Option<Arc<DataAccess>>,
    },
    /// First access of a fresh chain under a covering access of the scope
    /// owner; inherits whatever the owner has received so far.
    ParentAccess(Arc<DataAccess>),
    /// No predecessor anywhere in sight: born fully satisfied.
    Unconstrained,
}

/// The dependency engine: region-fragmented access chains with
/// satisfiability propagation. Registration and unregistration touch only
/// the affected scope's lock; every downstream effect is batched into
/// [`CpuDependencyData`] and applied by [`process_delayed`]
/// (DependencyEngine::process_delayed) after the lock drops, which keeps the
/// critical sections short and the lock order acyclic.
pub(crate) struct DependencyEngine {
    pub(crate) scoreboard: CommutativeScoreboard,
    pub(crate) write_ids: WriteIdRegistry,
}

impl DependencyEngine {
    pub(crate) fn new(rank: usize) -> Self {
        Self {
            scoreboard: CommutativeScoreboard::new(),
            write_ids: WriteIdRegistry::new(rank),
        }
    }

    /// Wire every declared access of `task` into its parent scope's bottom
    /// map, fragmenting on partial overlap. Initial satisfiability is seeded
    /// from the predecessor's propagated state, or from the parent access's
    /// received state when the chain is fresh.
    pub(crate) fn register_task_accesses(&self, task: &Arc<Task>, batch: &mut CpuDependencyData) {
        let specs = task.take_declared_accesses();

        for spec in specs {
            match task.parent() {
                Some(parent) => self.register_one(task, &parent, &spec, batch),
                // Root scope: no chains above it. The access is recorded so
                // unregistration stays uniform, and is born satisfied.
                None => {
                    let access = Arc::new(DataAccess::new(
                        spec.ty,
                        spec.region,
                        task,
                        spec.weak,
                        false,
                    ));
                    self.attach_reduction(&access, None, &spec);
                    task.accesses.lock().arena.insert(access.clone());
                    if !spec.weak {
                        task.add_predecessor();
                    }
                    batch
                        .delayed
                        .push_back(UpdateOperation::new(access, full_satisfiability()));
                }
            }
        }

        if task.finish_registration() {
            batch.satisfied_originators.push(task.clone());
        }
    }

    fn register_one(
        &self,
        task: &Arc<Task>,
        parent: &Arc<Task>,
        spec: &AccessSpec,
        batch: &mut CpuDependencyData,
    ) {
        let mut scope = parent.accesses.lock();

        // Build the fragment plan: disjoint (region, hook) pairs whose union
        // is exactly spec.region.
        let mut plan: SmallVec<[(DataRegion, Hook); 4]> = SmallVec::new();
        let mut cursor = spec.region.start();

        for key in scope.overlapping_keys(&spec.region) {
            let entry = scope.bottom_map.remove(&key).expect("key just collected");
            let overlap = entry
                .region
                .intersect(&spec.region)
                .expect("collected entries overlap");

            if cursor < overlap.start() {
                plan_gap(
                    &scope,
                    DataRegion::new(cursor, overlap.start() - cursor),
                    &mut plan,
                );
            }

            // Entry pieces outside the new access keep their chain. Each
            // piece becomes its own chain for the scope owner's accounting.
            let (before, after) = entry.region.subtract(&spec.region);
            for piece in [before, after].into_iter().flatten() {
                if let Some(pa) = &entry.parent_access {
                    pa.open_child_chain();
                }
                scope.insert_entry(BottomMapEntry {
                    region: piece,
                    last: entry.last.clone(),
                    parent_access: entry.parent_access.clone(),
                });
            }

            // A task redeclaring a region it already covers would chain
            // behind itself and never start; merge into the earlier record.
            let same_task = entry
                .last
                .originator()
                .is_some_and(|o| Arc::ptr_eq(&o, task));
            if same_task {
                scope.insert_entry(BottomMapEntry {
                    region: overlap,
                    last: entry.last.clone(),
                    parent_access: entry.parent_access.clone(),
                });
            } else {
                plan.push((
                    overlap,
                    Hook::Predecessor {
                        pred: entry.last.clone(),
                        parent_access: entry.parent_access.clone(),
                    },
                ));
            }

            cursor = overlap.end();
        }

        if cursor < spec.region.end() {
            plan_gap(
                &scope,
                DataRegion::new(cursor, spec.region.end() - cursor),
                &mut plan,
            );
        }

        // Materialize the fragments while still holding the scope lock, so
        // linking is atomic with respect to chain drains.
        for (region, hook) in plan {
            let access = Arc::new(DataAccess::new(spec.ty, region, task, spec.weak, false));
            let pred_for_reduction = match &hook {
                Hook::Predecessor { pred, .. } => Some(pred.clone()),
                _ => None,
            };
            self.attach_reduction(&access, pred_for_reduction.as_ref(), spec);

            task.accesses.lock().arena.insert(access.clone());
            if !spec.weak {
                task.add_predecessor();
            }

            let (initial, location, write_id, parent_access) = match &hook {
                Hook::Predecessor {
                    pred,
                    parent_access,
                } => {
                    pred.links.lock().successors.push((region, access.clone()));
                    pred.mark_has_successor();
                    (
                        pred.propagated_snapshot(),
                        pred.location(),
                        pred.write_id(),
                        parent_access.clone(),
                    )
                }
                Hook::ParentAccess(pa) => {
                    pa.links.lock().children.push((region, access.clone()));
                    pa.open_child_chain();
                    (
                        pa.received_snapshot(),
                        pa.location(),
                        pa.write_id(),
                        Some(pa.clone()),
                    )
                }
                Hook::Unconstrained => (full_satisfiability(), None, 0, None),
            };

            scope.insert_entry(BottomMapEntry {
                region,
                last: access.clone(),
                parent_access,
            });

            if !initial.is_empty() {
                batch.delayed.push_back(UpdateOperation::with_data(
                    access, initial, location, write_id,
                ));
            }
        }
    }

    /// Link a taskwait sink over the task's own scope: one fragment behind
    /// every bottom-map entry. Returns the number of fragments created; the
    /// caller arms the task's taskwait countdown with it *before* processing
    /// the batch.
    pub(crate) fn register_taskwait_fragments(
        &self,
        task: &Arc<Task>,
        batch: &mut CpuDependencyData,
    ) -> usize {
        let mut inner = task.accesses.lock();
        let keys: Vec<usize> = inner.bottom_map.keys().copied().collect();
        let mut count = 0;

        for key in keys {
            let entry = inner.bottom_map.get(&key).expect("key just collected");
            let region = entry.region;
            let last = entry.last.clone();

            let fragment = Arc::new(DataAccess::new(AccessType::NoAccess, region, task, false, true));
            last.links.lock().successors.push((region, fragment.clone()));
            last.mark_has_successor();
            let initial = last.propagated_snapshot();
            let location = last.location();
            let write_id = last.write_id();

            inner.arena.insert(fragment.clone());
            inner.bottom_map.get_mut(&key).expect("still there").last = fragment.clone();

            if !initial.is_empty() {
                batch.delayed.push_back(UpdateOperation::with_data(
                    fragment, initial, location, write_id,
                ));
            }
            count += 1;
        }
        count
    }

    /// The task finished all its uses: complete every access and let the
    /// held satisfiability flow to the successors. Side effects land in
    /// `batch`; the caller drains them after this returns.
    pub(crate) fn unregister_task_accesses(&self, task: &Arc<Task>, batch: &mut CpuDependencyData) {
        let accesses: SmallVec<[Arc<DataAccess>; 8]> = task
            .accesses
            .lock()
            .arena
            .iter()
            .map(|(_, a)| a.clone())
            .collect();

        for access in accesses {
            let mut flags = AccessFlags::COMPLETE | AccessFlags::UNREGISTERED;
            if !access.has_open_child_chains() {
                flags |= AccessFlags::CHILDREN_DONE;
            }
            batch.delayed.push_back(UpdateOperation::with_data(
                access.clone(),
                flags,
                access.location(),
                access.write_id(),
            ));
        }
    }

    /// Drain the worklist: apply every pending update, then walk the
    /// commutative waiters for any released regions, repeating until both
    /// are empty. Runs with no scope lock held.
    pub(crate) fn process_delayed(&self, batch: &mut CpuDependencyData) {
        loop {
            while let Some(op) = batch.delayed.pop_front() {
                self.apply_update(op, batch);
            }
            if batch.released_commutative.is_empty() {
                break;
            }
            let regions = std::mem::take(&mut batch.released_commutative);
            for access in self.scoreboard.release_all(regions) {
                batch.delayed.push_back(UpdateOperation::new(
                    access,
                    AccessFlags::COMMUTATIVE_GRANTED,
                ));
            }
        }
    }

    /// Apply one satisfiability delta and fan out its consequences.
    fn apply_update(&self, op: UpdateOperation, batch: &mut CpuDependencyData) {
        let access = op.target;
        let t = access.receive(op.flags);

        if !t.received_delta.is_empty() {
            if let Some(location) = op.location {
                access.set_location(location);
            }
            if op.write_id != 0
                && t.received_delta.contains(AccessFlags::WRITE_SATISFIED)
            {
                access.set_write_id(op.write_id);
            }

            // Child chains see what the parent sees, as soon as it sees it.
            {
                let links = access.links.lock();
                for (_, child) in links.children.iter() {
                    batch.delayed.push_back(UpdateOperation::with_data(
                        child.clone(),
                        t.received_delta,
                        op.location,
                        op.write_id,
                    ));
                }
            }

            // Late satisfiability travels to the offloadee.
            let link = access.data_link.lock().clone();
            if let Some(link) = link {
                let kinds = t.received_delta
                    & (AccessFlags::READ_SATISFIED | AccessFlags::WRITE_SATISFIED);
                if !kinds.is_empty() {
                    link.link_updated(kinds, access.location(), access.write_id());
                }
            }
        }

        if t.claim_reduction {
            let info = access.reduction.lock().clone();
            if let Some(info) = info {
                access
                    .reduction_slot
                    .store(info.claim_slot(), Ordering::Release);
            }
        }

        if t.enqueue_commutative && self.scoreboard.try_acquire(access.region(), access.clone()) {
            batch.delayed.push_back(UpdateOperation::new(
                access.clone(),
                AccessFlags::COMMUTATIVE_GRANTED,
            ));
        }

        if t.newly_satisfied {
            if access.is_taskwait_fragment() {
                // The sink has no body: complete it on the spot so held
                // satisfiability keeps flowing to anything linked later.
                batch.delayed.push_back(UpdateOperation::new(
                    access.clone(),
                    AccessFlags::COMPLETE | AccessFlags::CHILDREN_DONE,
                ));
                if let Some(task) = access.originator() {
                    task.taskwait_fragment_done();
                }
            } else if let Some(task) = access.originator()
                && task.decrement_predecessors()
            {
                batch.satisfied_originators.push(task);
            }
        }

        if t.completed_now {
            if access.access_type() == AccessType::Reduction && !access.is_weak() {
                let slot = access.reduction_slot.load(Ordering::Acquire);
                if slot != NO_REDUCTION_SLOT {
                    let info = access.reduction.lock().clone();
                    if let Some(info) = info {
                        info.release_slot(slot);
                    }
                }
            }
            if t.new_flags.contains(AccessFlags::COMMUTATIVE_GRANTED) {
                batch.released_commutative.push(access.region());
            }
        }

        if !t.forward.is_empty() {
            let location = access.location();
            let write_id = access.write_id();
            let successors: SmallVec<[Arc<DataAccess>; 2]> = access
                .links
                .lock()
                .successors
                .iter()
                .map(|(_, s)| s.clone())
                .collect();
            for succ in successors {
                if t.forward.contains(AccessFlags::WRITE_SATISFIED) {
                    self.maybe_combine_reduction(&access, Some(&succ));
                }
                batch.delayed.push_back(UpdateOperation::with_data(
                    succ,
                    t.forward,
                    location,
                    write_id,
                ));
            }
        }

        if t.new_flags.effectively_complete() {
            self.drain_chain_tail(&access, batch);
        }
    }

    /// An effectively complete access with no successors is the tail of its
    /// chain: retire the bottom-map entries it heads and report the drained
    /// chains to the scope owner's access. A chain only counts as drained
    /// once the tail has forwarded both read and write satisfiability; a
    /// weak access that completes before its predecessors must keep its
    /// entry so later registrations still chain behind it.
    fn drain_chain_tail(&self, access: &Arc<DataAccess>, batch: &mut CpuDependencyData) {
        let flags = access.flags();
        if !flags.contains(AccessFlags::PROPAGATED_READ | AccessFlags::PROPAGATED_WRITE) {
            return;
        }
        let Some(task) = access.originator() else {
            return;
        };
        // Taskwait fragments live in the waiting task's own scope; ordinary
        // accesses live in the parent's.
        let scope_task = if access.is_taskwait_fragment() {
            task
        } else {
            match task.parent() {
                Some(parent) => parent,
                None => return,
            }
        };

        let mut scope = scope_task.accesses.lock();
        // Linking happens under this same lock, so the emptiness check is
        // atomic with any concurrent registration.
        if !access.links.lock().successors.is_empty() {
            return;
        }

        let keys: Vec<usize> = scope
            .bottom_map
            .iter()
            .filter(|(_, e)| Arc::ptr_eq(&e.last, access))
            .map(|(k, _)| *k)
            .collect();

        for key in keys {
            let entry = scope.bottom_map.remove(&key).expect("key just collected");
            self.maybe_combine_reduction(access, None);
            if let Some(pa) = entry.parent_access {
                if pa.close_child_chain() {
                    batch
                        .delayed
                        .push_back(UpdateOperation::new(pa, AccessFlags::CHILDREN_DONE));
                }
            }
        }
    }

    /// A reduction chain combines when write satisfiability leaves the
    /// chain: either towards a successor that does not share the reduction,
    /// or when the chain drains with no successor at all.
    fn maybe_combine_reduction(&self, access: &Arc<DataAccess>, succ: Option<&Arc<DataAccess>>) {
        if access.access_type() != AccessType::Reduction {
            return;
        }
        let info = access.reduction.lock().clone();
        let Some(info) = info else { return };
        let shares_info = succ.is_some_and(|s| {
            s.access_type() == AccessType::Reduction
                && s.reduction
                    .lock()
                    .as_ref()
                    .is_some_and(|other| Arc::ptr_eq(other, &info))
        });
        if !shares_info {
            info.combine();
        }
    }

    fn attach_reduction(
        &self,
        access: &Arc<DataAccess>,
        pred: Option<&Arc<DataAccess>>,
        spec: &AccessSpec,
    ) {
        if spec.ty != AccessType::Reduction {
            return;
        }
        let spec_red = spec
            .reduction
            .expect("reduction access declared without a reduction spec");

        let inherited = pred
            .filter(|p| p.access_type() == AccessType::Reduction)
            .and_then(|p| p.reduction.lock().clone())
            .filter(|info| info.op_index() == spec_red.op_index && !info.is_combined());

        let info = inherited
            .unwrap_or_else(|| Arc::new(ReductionInfo::new(access.region(), spec_red)));
        if !spec.weak {
            info.register_participant();
        }
        *access.reduction.lock() = Some(info);
    }
}

/// Cover `gap` with fresh chains: pieces under a scope-owner access inherit
/// from it, leftovers are unconstrained.
fn plan_gap(
    scope: &AccessesInner,
    gap: DataRegion,
    plan: &mut SmallVec<[(DataRegion, Hook); 4]>,
) {
    let mut pieces: SmallVec<[DataRegion; 4]> = smallvec![gap];

    for (_, pa) in scope.arena.iter() {
        if pa.is_taskwait_fragment() {
            continue;
        }
        if pieces.is_empty() {
            break;
        }
        let mut next: SmallVec<[DataRegion; 4]> = SmallVec::new();
        for piece in pieces.drain(..) {
            match piece.intersect(&pa.region()) {
                Some(overlap) => {
                    plan.push((overlap, Hook::ParentAccess(pa.clone())));
                    let (before, after) = piece.subtract(&pa.region());
                    next.extend(before);
                    next.extend(after);
                }
                None => next.push(piece),
            }
        }
        pieces = next;
    }

    for piece in pieces {
        plan.push((piece, Hook::Unconstrained));
    }
}

fn full_satisfiability() -> AccessFlags {
    AccessFlags::READ_SATISFIED | AccessFlags::WRITE_SATISFIED
}
