use crate::deps::access::DataAccess;
use crate::deps::region::DataRegion;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;

struct Waiter {
    region: DataRegion,
    access: Arc<DataAccess>,
}

#[derive(Default)]
struct ScoreboardInner {
    /// Regions currently held exclusively by an executing task.
    in_use: Vec<DataRegion>,
    /// FIFO of eligible accesses that found their region busy.
    waiters: VecDeque<Waiter>,
}

/// Arbitration for commutative accesses: at most one holder per region at a
/// time, waiters granted in arrival order, but no ordering between tasks that
/// never contend.
#[derive(Default)]
pub(crate) struct CommutativeScoreboard {
    inner: Mutex<ScoreboardInner>,
}

impl CommutativeScoreboard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Try to take the region. On failure the access joins the FIFO and will
    /// be granted by a later [`release_all`](Self::release_all).
    pub(crate) fn try_acquire(&self, region: DataRegion, access: Arc<DataAccess>) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_use.iter().any(|r| r.overlaps(&region)) {
            inner.waiters.push_back(Waiter { region, access });
            return false;
        }
        inner.in_use.push(region);
        true
    }

    /// Give back a batch of regions and grant as many waiters as now fit, in
    /// FIFO order. Returns the accesses that obtained the grant.
    pub(crate) fn release_all(
        &self,
        released: impl IntoIterator<Item = DataRegion>,
    ) -> SmallVec<[Arc<DataAccess>; 2]> {
        let mut inner = self.inner.lock();
        for region in released {
            inner.in_use.retain(|r| *r != region);
        }

        let mut granted = SmallVec::new();
        let mut still_waiting = VecDeque::with_capacity(inner.waiters.len());
        let waiters = std::mem::take(&mut inner.waiters);
        for waiter in waiters {
            if inner.in_use.iter().any(|r| r.overlaps(&waiter.region)) {
                still_waiting.push_back(waiter);
            } else {
                inner.in_use.push(waiter.region);
                granted.push(waiter.access);
            }
        }
        inner.waiters = still_waiting;
        granted
    }

    #[cfg(test)]
    pub(crate) fn held_regions(&self) -> usize {
        self.inner.lock().in_use.len()
    }
}
