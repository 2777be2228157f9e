use crate::deps::region::DataRegion;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// User-supplied reduction behavior. The initializer seeds a private slot
/// with the operator's identity; the combiner folds a slot into the target.
#[derive(Clone, Copy)]
pub struct ReductionSpec {
    /// Operator-and-type index; two chained reductions merge only when their
    /// indices match.
    pub op_index: u32,
    pub initializer: fn(&mut [u8]),
    pub combiner: fn(&mut [u8], &[u8]),
}

impl std::fmt::Debug for ReductionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReductionSpec")
            .field("op_index", &self.op_index)
            .finish()
    }
}

struct SlotPool {
    /// Slot storage lives until the combine runs; the bitmap only tracks
    /// which initialized slots are free for another claimant.
    slots: Vec<Box<[u8]>>,
    free: u64,
}

/// Coordinates the private accumulation slots of one reduction chain. The
/// first eligible access creates it, same-operator successors share it, and
/// the combine folds every slot into the target region exactly once.
pub struct ReductionInfo {
    region: DataRegion,
    spec: ReductionSpec,
    pool: Mutex<SlotPool>,
    registered: AtomicU32,
    completed: AtomicU32,
    combined: AtomicBool,
}

impl ReductionInfo {
    pub(crate) fn new(region: DataRegion, spec: ReductionSpec) -> Self {
        Self {
            region,
            spec,
            pool: Mutex::new(SlotPool {
                slots: Vec::new(),
                free: 0,
            }),
            registered: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            combined: AtomicBool::new(false),
        }
    }

    pub(crate) fn region(&self) -> DataRegion {
        self.region
    }

    pub(crate) fn op_index(&self) -> u32 {
        self.spec.op_index
    }

    pub(crate) fn is_combined(&self) -> bool {
        self.combined.load(Ordering::Acquire)
    }

    pub(crate) fn register_participant(&self) {
        self.registered.fetch_add(1, Ordering::AcqRel);
    }

    /// Hand out a private slot: reuse a free initialized one, otherwise
    /// allocate and initialize a new one.
    pub(crate) fn claim_slot(&self) -> usize {
        let mut pool = self.pool.lock();
        if pool.free != 0 {
            let idx = pool.free.trailing_zeros() as usize;
            pool.free &= !(1 << idx);
            return idx;
        }
        let mut storage = vec![0u8; self.region.len()].into_boxed_slice();
        (self.spec.initializer)(&mut storage);
        pool.slots.push(storage);
        pool.slots.len() - 1
    }

    /// The participant finished accumulating; its slot becomes reusable but
    /// its contents stay put for the combine.
    pub(crate) fn release_slot(&self, idx: usize) {
        self.completed.fetch_add(1, Ordering::AcqRel);
        if idx < 64 {
            self.pool.lock().free |= 1 << idx;
        }
    }

    /// Mutable view of a claimed slot's storage, for the task body.
    pub(crate) fn with_slot<R>(&self, idx: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut pool = self.pool.lock();
        f(&mut pool.slots[idx])
    }

    /// Fold every slot into the target region. Runs at most once, when the
    /// chain hands read/write satisfiability to a non-matching successor.
    pub(crate) fn combine(&self) {
        if self.combined.swap(true, Ordering::AcqRel) {
            return;
        }
        debug_assert_eq!(
            self.registered.load(Ordering::Acquire),
            self.completed.load(Ordering::Acquire),
            "combining with participants still accumulating"
        );

        let pool = self.pool.lock();
        // Safety: the dependency chain guarantees exclusive ownership of the
        // target region here: every contributing access has completed and no
        // successor has received write satisfiability yet.
        let target = unsafe {
            std::slice::from_raw_parts_mut(self.region.start() as *mut u8, self.region.len())
        };
        for slot in pool.slots.iter() {
            (self.spec.combiner)(target, slot);
        }
    }
}
