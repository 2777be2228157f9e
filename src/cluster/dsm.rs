use crate::deps::region::DataRegion;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The distributed shared-memory layer is an external collaborator; the
/// core only needs these four questions answered.
pub trait Dsm: Send + Sync {
    fn is_dsm_address(&self, addr: usize) -> bool;
    /// Home node of the page holding `addr`; `None` when not first-touched
    /// yet.
    fn home_node_of(&self, addr: usize) -> Option<usize>;
    fn block_size(&self) -> usize;
    fn acquire(&self);
    fn selective_acquire(&self, addr: usize, len: usize);
    fn release(&self);
}

/// Test/loopback DSM: statically declared spans with a configured home
/// each, plus a first-touch overlay.
pub struct SpanDsm {
    spans: RwLock<Vec<(DataRegion, Option<usize>)>>,
    first_touch: RwLock<HashMap<usize, usize>>,
    block: usize,
    acquires: AtomicUsize,
}

impl SpanDsm {
    pub fn new(block_size: usize) -> Self {
        Self {
            spans: RwLock::new(Vec::new()),
            first_touch: RwLock::new(HashMap::new()),
            block: block_size,
            acquires: AtomicUsize::new(0),
        }
    }

    /// Declare a DSM span homed on `home`, or with no home yet (`None`).
    pub fn add_span(&self, region: DataRegion, home: Option<usize>) {
        self.spans.write().push((region, home));
    }

    pub fn touch(&self, addr: usize, node: usize) {
        let block_start = addr - (addr % self.block);
        self.first_touch.write().insert(block_start, node);
    }

    pub fn acquire_count(&self) -> usize {
        self.acquires.load(Ordering::Relaxed)
    }
}

impl Dsm for SpanDsm {
    fn is_dsm_address(&self, addr: usize) -> bool {
        self.spans
            .read()
            .iter()
            .any(|(region, _)| region.contains_address(addr))
    }

    fn home_node_of(&self, addr: usize) -> Option<usize> {
        let block_start = addr - (addr % self.block);
        if let Some(node) = self.first_touch.read().get(&block_start) {
            return Some(*node);
        }
        self.spans
            .read()
            .iter()
            .find(|(region, _)| region.contains_address(addr))
            .and_then(|(_, home)| *home)
    }

    fn block_size(&self) -> usize {
        self.block
    }

    fn acquire(&self) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
    }

    fn selective_acquire(&self, _addr: usize, _len: usize) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_answer_membership_and_homes() {
        let dsm = SpanDsm::new(64);
        dsm.add_span(DataRegion::new(0x1000, 0x1000), Some(1));
        dsm.add_span(DataRegion::new(0x8000, 0x1000), None);

        assert!(dsm.is_dsm_address(0x1800));
        assert!(!dsm.is_dsm_address(0x4000));
        assert_eq!(dsm.home_node_of(0x1800), Some(1));
        assert_eq!(dsm.home_node_of(0x8000), None, "untouched span has no home");

        dsm.touch(0x8040, 0);
        assert_eq!(dsm.home_node_of(0x8050), Some(0));
    }
}
