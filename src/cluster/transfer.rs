use crate::cluster::messenger::{Messenger, PendingHandle};
use crate::deps::region::DataRegion;
use parking_lot::Mutex;
use slab::Slab;

type Callback = Box<dyn FnOnce() + Send>;

struct PendingTransfer {
    region: DataRegion,
    handle: PendingHandle,
    callbacks: Vec<Callback>,
}

/// In-flight data transfers. A fetch whose region is fully contained in an
/// already-pending transfer attaches a completion callback instead of
/// issuing a duplicate; completions are discovered by polling the
/// messenger.
pub(crate) struct PendingTransfers {
    inner: Mutex<Slab<PendingTransfer>>,
}

impl PendingTransfers {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Slab::new()),
        }
    }

    /// Attach `callback` to a pending transfer that fully contains
    /// `region`. Returns false (callback handed back) when no such transfer
    /// is in flight.
    pub(crate) fn attach_if_contained(
        &self,
        region: &DataRegion,
        callback: Callback,
    ) -> Result<(), Callback> {
        let mut inner = self.inner.lock();
        match inner
            .iter_mut()
            .find(|(_, t)| t.region.contains(region))
        {
            Some((_, transfer)) => {
                transfer.callbacks.push(callback);
                Ok(())
            }
            None => Err(callback),
        }
    }

    pub(crate) fn track(&self, region: DataRegion, handle: PendingHandle, callback: Callback) {
        self.inner.lock().insert(PendingTransfer {
            region,
            handle,
            callbacks: vec![callback],
        });
    }

    /// Poll the messenger for completions and run their callbacks.
    pub(crate) fn poll(&self, messenger: &dyn Messenger) {
        let handles: Vec<PendingHandle> = {
            let inner = self.inner.lock();
            inner.iter().map(|(_, t)| t.handle).collect()
        };
        if handles.is_empty() {
            return;
        }

        let done = messenger.test_completion(&handles);
        if done.is_empty() {
            return;
        }

        let mut ready: Vec<Callback> = Vec::new();
        {
            let mut inner = self.inner.lock();
            let keys: Vec<usize> = inner
                .iter()
                .filter(|(_, t)| done.contains(&t.handle))
                .map(|(k, _)| k)
                .collect();
            for key in keys {
                ready.append(&mut inner.remove(key).callbacks);
            }
        }
        // Callbacks run outside the lock; they may re-enter the scheduler.
        for callback in ready {
            callback();
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.inner.lock().len()
    }
}
