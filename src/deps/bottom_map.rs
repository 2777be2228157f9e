use crate::deps::access::DataAccess;
use crate::deps::region::DataRegion;
use parking_lot::Mutex;
use slab::Slab;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One fragment of a scope's bottom map: the last access registered over
/// `region`, plus the scope-owner access (if any) that the chain reports back
/// to when it drains.
pub(crate) struct BottomMapEntry {
    pub(crate) region: DataRegion,
    pub(crate) last: Arc<DataAccess>,
    pub(crate) parent_access: Option<Arc<DataAccess>>,
}

/// The access bookkeeping of one task: an arena of the task's own access
/// records (handles, no intrusive pointers) plus the bottom map of the scope
/// its children register into. Entries are disjoint and keyed by region
/// start; fragmentation keeps them that way.
pub(crate) struct TaskDataAccesses {
    inner: Mutex<AccessesInner>,
}

pub(crate) struct AccessesInner {
    pub(crate) arena: Slab<Arc<DataAccess>>,
    pub(crate) bottom_map: BTreeMap<usize, BottomMapEntry>,
}

impl TaskDataAccesses {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(AccessesInner {
                arena: Slab::new(),
                bottom_map: BTreeMap::new(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, AccessesInner> {
        self.inner.lock()
    }
}

impl AccessesInner {
    /// Keys of the bottom-map entries overlapping `region`, ascending.
    /// Entries are disjoint and sorted, so both starts and ends are ordered
    /// and the backwards take-while finds exactly the overlap set.
    pub(crate) fn overlapping_keys(&self, region: &DataRegion) -> Vec<usize> {
        let mut keys: Vec<usize> = self
            .bottom_map
            .range(..region.end())
            .rev()
            .take_while(|(_, e)| e.region.end() > region.start())
            .map(|(k, _)| *k)
            .collect();
        keys.reverse();
        keys
    }

    pub(crate) fn insert_entry(&mut self, entry: BottomMapEntry) {
        let start = entry.region.start();
        debug_assert!(!self.bottom_map.contains_key(&start));
        self.bottom_map.insert(start, entry);
    }
}
