use crate::cluster::message::{Message, MessageIdAllocator};
use crate::deps::region::DataRegion;
use crossbeam_queue::SegQueue;
use std::sync::{Arc, Barrier};

/// Handle for an in-flight data transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingHandle(pub u64);

/// The wire transport is an external collaborator; the core only consumes
/// this interface. Delivery between a (sender, receiver) pair is ordered.
pub trait Messenger: Send + Sync {
    fn rank(&self) -> usize;
    fn num_ranks(&self) -> usize;

    /// Send a control message; returns the assigned message id.
    fn send_message(&self, message: Message, target: usize, blocking: bool) -> u32;

    /// Push region bytes to `target`. `None` means the transfer completed
    /// synchronously.
    fn send_data(
        &self,
        region: DataRegion,
        target: usize,
        message_id: u32,
        blocking: bool,
    ) -> Option<PendingHandle>;

    /// Pull region bytes from `source`. `None` means the transfer completed
    /// synchronously.
    fn fetch_data(
        &self,
        region: DataRegion,
        source: usize,
        message_id: u32,
        blocking: bool,
    ) -> Option<PendingHandle>;

    /// Dequeue the next incoming control message, if any. Raw data streams
    /// never show up here.
    fn check_mail(&self) -> Option<Message>;

    /// Synchronize all ranks.
    fn barrier(&self);

    /// Mark completed transfers among `pending`, returning the done ones.
    fn test_completion(&self, pending: &[PendingHandle]) -> Vec<PendingHandle>;
}

struct Mailbox {
    control: SegQueue<Message>,
}

/// Shared state of an in-process cluster: one mailbox per rank plus a
/// reusable barrier.
pub struct LoopbackFabric {
    mailboxes: Vec<Mailbox>,
    barrier: Barrier,
}

impl LoopbackFabric {
    pub fn new(ranks: usize) -> Arc<Self> {
        Arc::new(Self {
            mailboxes: (0..ranks)
                .map(|_| Mailbox {
                    control: SegQueue::new(),
                })
                .collect(),
            barrier: Barrier::new(ranks),
        })
    }

    /// One messenger per rank, all over the same fabric.
    pub fn messengers(self: &Arc<Self>) -> Vec<Arc<LoopbackMessenger>> {
        (0..self.mailboxes.len())
            .map(|rank| {
                Arc::new(LoopbackMessenger {
                    fabric: self.clone(),
                    rank,
                    ids: MessageIdAllocator::new(rank),
                })
            })
            .collect()
    }
}

/// In-process messenger for tests and single-host multi-node runs. All
/// ranks share one address space, so data transfers complete synchronously;
/// control messages flow through per-rank FIFO mailboxes, which preserves
/// pairwise ordering.
pub struct LoopbackMessenger {
    fabric: Arc<LoopbackFabric>,
    rank: usize,
    ids: MessageIdAllocator,
}

impl Messenger for LoopbackMessenger {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.fabric.mailboxes.len()
    }

    fn send_message(&self, message: Message, target: usize, _blocking: bool) -> u32 {
        let id = self.ids.next();
        self.fabric.mailboxes[target].control.push(message);
        id
    }

    fn send_data(
        &self,
        _region: DataRegion,
        _target: usize,
        _message_id: u32,
        _blocking: bool,
    ) -> Option<PendingHandle> {
        // Shared address space: the bytes are already there.
        None
    }

    fn fetch_data(
        &self,
        _region: DataRegion,
        _source: usize,
        _message_id: u32,
        _blocking: bool,
    ) -> Option<PendingHandle> {
        None
    }

    fn check_mail(&self) -> Option<Message> {
        self.fabric.mailboxes[self.rank].control.pop()
    }

    fn barrier(&self) {
        self.fabric.barrier.wait();
    }

    fn test_completion(&self, _pending: &[PendingHandle]) -> Vec<PendingHandle> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(LoopbackMessenger: Send, Sync);

    #[test]
    fn mailboxes_preserve_sender_order() {
        let fabric = LoopbackFabric::new(2);
        let m = fabric.messengers();

        m[0].send_message(Message::TaskFinished { offloader_task: 1 }, 1, false);
        m[0].send_message(Message::TaskFinished { offloader_task: 2 }, 1, false);

        assert!(matches!(
            m[1].check_mail(),
            Some(Message::TaskFinished { offloader_task: 1 })
        ));
        assert!(matches!(
            m[1].check_mail(),
            Some(Message::TaskFinished { offloader_task: 2 })
        ));
        assert!(m[1].check_mail().is_none());
        assert!(m[0].check_mail().is_none(), "no cross-delivery");
    }
}
