use crate::deps::region::DataRegion;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Rank bits occupy the top of the id so write ids never collide across
/// nodes.
const RANK_SHIFT: u32 = 48;

/// Logical versions for region contents. Equality of write ids means the
/// holder already has the current bytes, which lets the data-fetch step skip
/// a transfer entirely.
pub(crate) struct WriteIdRegistry {
    next: AtomicU64,
    rank_tag: u64,
    /// Versions this node is known to hold locally.
    known: RwLock<HashMap<DataRegion, u64>>,
}

impl WriteIdRegistry {
    pub(crate) fn new(rank: usize) -> Self {
        Self {
            next: AtomicU64::new(1),
            rank_tag: (rank as u64) << RANK_SHIFT,
            known: RwLock::new(HashMap::new()),
        }
    }

    /// A fresh, globally unique version tag.
    pub(crate) fn fresh(&self) -> u64 {
        self.rank_tag | self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Record that this node holds `write_id` for `region`.
    pub(crate) fn record_local(&self, region: DataRegion, write_id: u64) {
        if write_id != 0 {
            self.known.write().insert(region, write_id);
        }
    }

    /// True when the local copy of `region` is already at `write_id`.
    pub(crate) fn is_local(&self, region: &DataRegion, write_id: u64) -> bool {
        if write_id == 0 {
            return false;
        }
        self.known
            .read()
            .get(region)
            .is_some_and(|known| *known == write_id)
    }

    /// Drop all knowledge intersecting `region` (distributed free).
    pub(crate) fn forget(&self, region: &DataRegion) {
        self.known.write().retain(|r, _| !r.overlaps(region));
    }
}
