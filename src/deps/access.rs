use crate::deps::reduction::ReductionInfo;
use crate::deps::region::DataRegion;
use crate::numa::MemoryPlace;
use crate::task::Task;
use bitflags::bitflags;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// How a task declares it will use a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    In,
    Out,
    InOut,
    Concurrent,
    Commutative,
    Reduction,
    /// Placeholder access that never touches the data. Taskwait fragments use
    /// this type: they are satisfied when the whole predecessor chain has
    /// completed.
    NoAccess,
}

bitflags! {
    /// The atomic word every access carries. Satisfiability bits are
    /// monotonically non-decreasing; the one-shot bits guard side effects
    /// that must fire exactly once per access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        // Satisfiability received from predecessors (or inherited).
        const READ_SATISFIED       = 1 << 0;
        const WRITE_SATISFIED      = 1 << 1;
        const CONCURRENT_SATISFIED = 1 << 2;
        const COMMUTATIVE_ELIGIBLE = 1 << 3;
        const REDUCTION_SATISFIED  = 1 << 4;
        /// Granted by the commutative scoreboard, not by a predecessor.
        const COMMUTATIVE_GRANTED  = 1 << 5;

        // Lifecycle.
        const COMPLETE             = 1 << 6;
        const CHILDREN_DONE        = 1 << 7;
        const UNREGISTERED         = 1 << 8;

        // Structure.
        const IS_WEAK              = 1 << 9;
        const HAS_SUCCESSOR        = 1 << 10;
        const IS_TASKWAIT          = 1 << 11;

        // One-shot side effects.
        const SATISFIED_NOTIFIED   = 1 << 12;
        const COMMUTATIVE_QUEUED   = 1 << 13;
        const REDUCTION_CLAIMED    = 1 << 14;

        // Per-kind propagation dedup: a kind is forwarded to the successor
        // links at most once, so duplicate deliveries count once.
        const PROPAGATED_READ      = 1 << 16;
        const PROPAGATED_WRITE     = 1 << 17;
        const PROPAGATED_CLASS     = 1 << 18;
    }
}

impl AccessFlags {
    /// The subset that travels between accesses.
    pub const MESSAGE_MASK: AccessFlags = AccessFlags::READ_SATISFIED
        .union(AccessFlags::WRITE_SATISFIED)
        .union(AccessFlags::CONCURRENT_SATISFIED)
        .union(AccessFlags::COMMUTATIVE_ELIGIBLE)
        .union(AccessFlags::REDUCTION_SATISFIED);
}

/// One edge of the chain: the linked access only covers `region`, which is a
/// sub-range of the owner's region. Satisfiability is uniform across the
/// owner's region, so region-wide broadcasts to every link preserve the
/// one-chain-per-byte invariant.
pub(crate) type RegionLink = (DataRegion, Arc<DataAccess>);

#[derive(Default)]
pub(crate) struct AccessLinks {
    /// Next accesses in the same scope, over disjoint sub-regions.
    pub(crate) successors: SmallVec<[RegionLink; 1]>,
    /// First accesses of child-task chains hanging off this access.
    pub(crate) children: SmallVec<[RegionLink; 1]>,
}

/// Installed by the cluster data-link step so late satisfiability reaches the
/// offloadee. Byte accounting behind this trait must be idempotent per kind.
pub(crate) trait SatisfiabilityLink: Send + Sync {
    fn link_updated(&self, kinds: AccessFlags, location: Option<MemoryPlace>, write_id: u64);
}

pub(crate) const NO_REDUCTION_SLOT: usize = usize::MAX;

/// A declared use of a memory region by one task. Accesses of the same region
/// form a chain (predecessor to successor) along which satisfiability flows;
/// the automata in [`transition`] decide what each arrival unlocks.
pub struct DataAccess {
    ty: AccessType,
    region: DataRegion,
    originator: Weak<Task>,
    flags: AtomicU32,
    /// Live child-task chains registered under this access's region. The
    /// access is not effectively complete until this drops to zero.
    child_chains: AtomicU32,
    pub(crate) links: Mutex<AccessLinks>,
    pub(crate) reduction: Mutex<Option<Arc<ReductionInfo>>>,
    pub(crate) reduction_slot: AtomicUsize,
    location: Mutex<Option<MemoryPlace>>,
    write_id: AtomicU64,
    pub(crate) data_link: Mutex<Option<Arc<dyn SatisfiabilityLink>>>,
}

impl DataAccess {
    pub(crate) fn new(
        ty: AccessType,
        region: DataRegion,
        originator: &Arc<Task>,
        weak: bool,
        taskwait: bool,
    ) -> Self {
        let mut flags = AccessFlags::empty();
        if weak {
            flags |= AccessFlags::IS_WEAK;
        }
        if taskwait {
            flags |= AccessFlags::IS_TASKWAIT;
        }

        Self {
            ty,
            region,
            originator: Arc::downgrade(originator),
            flags: AtomicU32::new(flags.bits()),
            child_chains: AtomicU32::new(0),
            links: Mutex::new(AccessLinks::default()),
            reduction: Mutex::new(None),
            reduction_slot: AtomicUsize::new(NO_REDUCTION_SLOT),
            location: Mutex::new(None),
            write_id: AtomicU64::new(0),
            data_link: Mutex::new(None),
        }
    }

    pub fn access_type(&self) -> AccessType {
        self.ty
    }

    pub fn region(&self) -> DataRegion {
        self.region
    }

    pub(crate) fn originator(&self) -> Option<Arc<Task>> {
        self.originator.upgrade()
    }

    pub fn flags(&self) -> AccessFlags {
        AccessFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn is_weak(&self) -> bool {
        self.flags().contains(AccessFlags::IS_WEAK)
    }

    pub fn is_taskwait_fragment(&self) -> bool {
        self.flags().contains(AccessFlags::IS_TASKWAIT)
    }

    pub fn read_satisfied(&self) -> bool {
        self.flags().contains(AccessFlags::READ_SATISFIED)
    }

    pub fn write_satisfied(&self) -> bool {
        self.flags().contains(AccessFlags::WRITE_SATISFIED)
    }

    pub fn location(&self) -> Option<MemoryPlace> {
        *self.location.lock()
    }

    pub(crate) fn set_location(&self, location: MemoryPlace) {
        *self.location.lock() = Some(location);
    }

    pub fn write_id(&self) -> u64 {
        self.write_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_write_id(&self, id: u64) {
        self.write_id.store(id, Ordering::Release);
    }

    /// A new child-task chain was hung off this access's region.
    pub(crate) fn open_child_chain(&self) {
        self.child_chains.fetch_add(1, Ordering::AcqRel);
    }

    /// A child chain fully drained; true when it was the last one.
    pub(crate) fn close_child_chain(&self) -> bool {
        self.child_chains.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn has_open_child_chains(&self) -> bool {
        self.child_chains.load(Ordering::Acquire) > 0
    }

    pub(crate) fn mark_has_successor(&self) {
        self.flags
            .fetch_or(AccessFlags::HAS_SUCCESSOR.bits(), Ordering::AcqRel);
    }

    /// What this access has already forwarded to its successors, expressed as
    /// a message. A successor linked late inherits exactly this as its
    /// initial satisfiability.
    pub(crate) fn propagated_snapshot(&self) -> AccessFlags {
        let flags = self.flags();
        let mut out = AccessFlags::empty();
        if flags.contains(AccessFlags::PROPAGATED_READ) {
            out |= AccessFlags::READ_SATISFIED;
        }
        if flags.contains(AccessFlags::PROPAGATED_WRITE) {
            out |= AccessFlags::WRITE_SATISFIED;
        }
        if flags.contains(AccessFlags::PROPAGATED_CLASS) {
            out |= match self.ty {
                AccessType::Concurrent => AccessFlags::CONCURRENT_SATISFIED,
                AccessType::Commutative => AccessFlags::COMMUTATIVE_ELIGIBLE,
                AccessType::Reduction => AccessFlags::REDUCTION_SATISFIED,
                _ => AccessFlags::empty(),
            };
        }
        out
    }

    /// What this access has received, expressed as a message. Child-scope
    /// accesses inherit exactly this when no in-scope predecessor exists.
    pub(crate) fn received_snapshot(&self) -> AccessFlags {
        self.flags() & AccessFlags::MESSAGE_MASK
    }

    /// Apply `incoming` to the flag word, returning what the arrival unlocked.
    /// This is the only mutation path for satisfiability; the CAS loop commits
    /// the one-shot bits together with the satisfiability bits so every side
    /// effect fires exactly once.
    pub(crate) fn receive(&self, incoming: AccessFlags) -> Transition {
        let mut old = self.flags.load(Ordering::Acquire);
        loop {
            let t = transition(self.ty, AccessFlags::from_bits_retain(old), incoming);
            if t.new_flags.bits() == old {
                // Nothing changed; duplicate deliveries unlock nothing.
                return Transition {
                    forward: AccessFlags::empty(),
                    received_delta: AccessFlags::empty(),
                    newly_satisfied: false,
                    completed_now: false,
                    enqueue_commutative: false,
                    claim_reduction: false,
                    ..t
                };
            }
            match self.flags.compare_exchange_weak(
                old,
                t.new_flags.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return t,
                Err(actual) => old = actual,
            }
        }
    }
}

/// Outcome of one automaton step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transition {
    pub(crate) new_flags: AccessFlags,
    /// Kinds to forward to every successor link, already deduplicated.
    pub(crate) forward: AccessFlags,
    /// Satisfiability kinds newly absorbed by this access; broadcast to child
    /// chains and to the cluster data-link step.
    pub(crate) received_delta: AccessFlags,
    /// The access's readiness contribution fires now (strong accesses only).
    pub(crate) newly_satisfied: bool,
    /// COMPLETE was set by this step.
    pub(crate) completed_now: bool,
    /// Join the commutative scoreboard waiter list now.
    pub(crate) enqueue_commutative: bool,
    /// Claim a reduction slot now.
    pub(crate) claim_reduction: bool,
}

impl AccessFlags {
    pub(crate) fn effectively_complete(self) -> bool {
        self.contains(AccessFlags::COMPLETE | AccessFlags::CHILDREN_DONE)
    }
}

/// The per-type satisfiability automaton, as a pure function so the state
/// machine is unit-testable without any task plumbing.
///
/// Rules, per spec of the access chains:
/// - Read satisfiability passes through IN accesses immediately; every other
///   type holds it until the access is effectively complete.
/// - Write satisfiability is only ever forwarded by an effectively complete
///   access.
/// - The class flags (concurrent / commutative-eligible / reduction) pass
///   immediately between same-type neighbors and are dropped by any other
///   type, which will instead receive read/write through chain completion.
/// - "Effectively complete" means the task finished its use AND every child
///   chain under the access has drained.
pub(crate) fn transition(ty: AccessType, old: AccessFlags, incoming: AccessFlags) -> Transition {
    let mut flags = old | absorb(ty, incoming);

    // Derive class satisfiability when full read+write reaches the head of a
    // concurrent / commutative / reduction chain.
    if flags.contains(AccessFlags::READ_SATISFIED | AccessFlags::WRITE_SATISFIED) {
        match ty {
            AccessType::Concurrent => flags |= AccessFlags::CONCURRENT_SATISFIED,
            AccessType::Commutative => flags |= AccessFlags::COMMUTATIVE_ELIGIBLE,
            AccessType::Reduction => flags |= AccessFlags::REDUCTION_SATISFIED,
            _ => {}
        }
    }

    let complete = flags.contains(AccessFlags::COMPLETE | AccessFlags::CHILDREN_DONE);

    let mut forward = AccessFlags::empty();
    if flags.contains(AccessFlags::READ_SATISFIED)
        && (matches!(ty, AccessType::In) || complete)
        && !flags.contains(AccessFlags::PROPAGATED_READ)
    {
        flags |= AccessFlags::PROPAGATED_READ;
        forward |= AccessFlags::READ_SATISFIED;
    }
    if flags.contains(AccessFlags::WRITE_SATISFIED)
        && complete
        && !flags.contains(AccessFlags::PROPAGATED_WRITE)
    {
        flags |= AccessFlags::PROPAGATED_WRITE;
        forward |= AccessFlags::WRITE_SATISFIED;
    }
    if let Some(class) = class_flag(ty) {
        if flags.contains(class) && !flags.contains(AccessFlags::PROPAGATED_CLASS) {
            flags |= AccessFlags::PROPAGATED_CLASS;
            forward |= class;
        }
    }

    let weak = flags.contains(AccessFlags::IS_WEAK);

    let mut enqueue_commutative = false;
    if matches!(ty, AccessType::Commutative)
        && !weak
        && flags.contains(AccessFlags::COMMUTATIVE_ELIGIBLE)
        && !flags.contains(AccessFlags::COMMUTATIVE_QUEUED)
    {
        flags |= AccessFlags::COMMUTATIVE_QUEUED;
        enqueue_commutative = true;
    }

    let mut claim_reduction = false;
    if matches!(ty, AccessType::Reduction)
        && !weak
        && flags.contains(AccessFlags::REDUCTION_SATISFIED)
        && !flags.contains(AccessFlags::REDUCTION_CLAIMED)
    {
        flags |= AccessFlags::REDUCTION_CLAIMED;
        claim_reduction = true;
    }

    let mut newly_satisfied = false;
    if !weak && satisfied(ty, flags) && !flags.contains(AccessFlags::SATISFIED_NOTIFIED) {
        flags |= AccessFlags::SATISFIED_NOTIFIED;
        newly_satisfied = true;
    }

    Transition {
        new_flags: flags,
        forward,
        received_delta: (flags ^ old) & AccessFlags::MESSAGE_MASK,
        newly_satisfied,
        completed_now: flags.contains(AccessFlags::COMPLETE)
            && !old.contains(AccessFlags::COMPLETE),
        enqueue_commutative,
        claim_reduction,
    }
}

/// Which of the incoming bits this access type absorbs. Class flags from a
/// different access class are dropped; the chain-completion path delivers the
/// equivalent read/write later.
fn absorb(ty: AccessType, incoming: AccessFlags) -> AccessFlags {
    let mut keep = incoming
        & (AccessFlags::READ_SATISFIED
            | AccessFlags::WRITE_SATISFIED
            | AccessFlags::COMMUTATIVE_GRANTED
            | AccessFlags::COMPLETE
            | AccessFlags::CHILDREN_DONE
            | AccessFlags::UNREGISTERED);
    if let Some(class) = class_flag(ty) {
        keep |= incoming & class;
    }
    keep
}

fn class_flag(ty: AccessType) -> Option<AccessFlags> {
    match ty {
        AccessType::Concurrent => Some(AccessFlags::CONCURRENT_SATISFIED),
        AccessType::Commutative => Some(AccessFlags::COMMUTATIVE_ELIGIBLE),
        AccessType::Reduction => Some(AccessFlags::REDUCTION_SATISFIED),
        _ => None,
    }
}

/// Readiness condition per access type.
fn satisfied(ty: AccessType, flags: AccessFlags) -> bool {
    match ty {
        AccessType::In => flags.contains(AccessFlags::READ_SATISFIED),
        AccessType::Out | AccessType::InOut | AccessType::NoAccess => {
            flags.contains(AccessFlags::READ_SATISFIED | AccessFlags::WRITE_SATISFIED)
        }
        AccessType::Concurrent => flags.contains(AccessFlags::CONCURRENT_SATISFIED),
        AccessType::Commutative => flags.contains(AccessFlags::COMMUTATIVE_GRANTED),
        AccessType::Reduction => flags.contains(AccessFlags::REDUCTION_SATISFIED),
    }
}
