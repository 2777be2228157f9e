use crate::cluster::message::{Message, SatisfiabilityMsg};
use crate::cluster::messenger::Messenger;
use crate::deps::access::{AccessFlags, DataAccess, SatisfiabilityLink};
use crate::deps::region::DataRegion;
use crate::numa::MemoryPlace;
use crate::task::TaskId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Forwards satisfiability that arrives after the offload to the remote
/// wrapper. Byte accounting is idempotent per kind: read and write each
/// count the region once no matter how many paths deliver them, so a
/// duplicate delivery can never double-free the step.
pub(crate) struct ClusterDataLinkStep {
    messenger: Arc<dyn Messenger>,
    target_node: usize,
    offloader_task: TaskId,
    region: DataRegion,
    /// Bytes still to be linked; read and write count separately.
    bytes_outstanding: AtomicUsize,
    read_linked: AtomicBool,
    write_linked: AtomicBool,
    started: AtomicBool,
    access: Weak<DataAccess>,
}

impl ClusterDataLinkStep {
    /// Snapshot the access's current satisfiability; whatever is already
    /// known rides in the TaskNew message and is never re-sent.
    pub(crate) fn install(
        access: &Arc<DataAccess>,
        messenger: Arc<dyn Messenger>,
        target_node: usize,
        offloader_task: TaskId,
    ) -> Arc<Self> {
        let region = access.region();
        let read = access.read_satisfied();
        let write = access.write_satisfied();
        let kinds_pending = 2 - usize::from(read) - usize::from(write);

        let step = Arc::new(Self {
            messenger,
            target_node,
            offloader_task,
            region,
            bytes_outstanding: AtomicUsize::new(region.len() * kinds_pending),
            read_linked: AtomicBool::new(read),
            write_linked: AtomicBool::new(write),
            started: AtomicBool::new(false),
            access: Arc::downgrade(access),
        });
        *access.data_link.lock() = Some(step.clone());
        step
    }

    pub(crate) fn start(&self) {
        self.started.store(true, Ordering::Release);
        self.maybe_retire();
    }

    #[cfg(test)]
    pub(crate) fn bytes_outstanding(&self) -> usize {
        self.bytes_outstanding.load(Ordering::Acquire)
    }

    fn send(&self, read: bool, write: bool, location: Option<MemoryPlace>, write_id: u64) {
        let location = match location {
            Some(MemoryPlace::ClusterNode(node)) => node as i32,
            _ => -1,
        };
        self.messenger.send_message(
            Message::Satisfiability(SatisfiabilityMsg {
                offloader_node: self.messenger.rank() as u32,
                offloader_task: self.offloader_task.0,
                start: self.region.start() as u64,
                len: self.region.len() as u64,
                read,
                write,
                write_id,
                location,
            }),
            self.target_node,
            false,
        );
    }

    /// Deletes itself once the byte count reached zero and it has started:
    /// the access drops its reference and the last Arc frees the step.
    fn maybe_retire(&self) {
        if self.started.load(Ordering::Acquire)
            && self.bytes_outstanding.load(Ordering::Acquire) == 0
            && let Some(access) = self.access.upgrade()
        {
            *access.data_link.lock() = None;
        }
    }
}

impl SatisfiabilityLink for ClusterDataLinkStep {
    fn link_updated(&self, kinds: AccessFlags, location: Option<MemoryPlace>, write_id: u64) {
        if kinds.contains(AccessFlags::READ_SATISFIED)
            && !self.read_linked.swap(true, Ordering::AcqRel)
        {
            self.send(true, false, location, write_id);
            self.bytes_outstanding
                .fetch_sub(self.region.len(), Ordering::AcqRel);
        }
        if kinds.contains(AccessFlags::WRITE_SATISFIED)
            && !self.write_linked.swap(true, Ordering::AcqRel)
        {
            self.send(false, true, location, write_id);
            self.bytes_outstanding
                .fetch_sub(self.region.len(), Ordering::AcqRel);
        }
        self.maybe_retire();
    }
}
