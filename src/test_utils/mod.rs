//! Shared fixtures for the test suites: small runtimes, an ordered event
//! log, leaked regions whose addresses stay valid for the whole run, and a
//! message spy for the cluster paths.

use crate::cluster::message::Message;
use crate::cluster::messenger::{LoopbackFabric, Messenger, PendingHandle};
use crate::deps::region::DataRegion;
use crate::runtime::{Builder, ClusterSetup};
use crate::scheduler::cluster::ClusterPolicy;
use crate::{Runtime, SpanDsm};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) fn small_runtime(workers: usize) -> Runtime {
    Builder::new()
        .worker_threads(workers)
        .try_build()
        .expect("failed to build test runtime")
}

/// Ordered record of body executions, for dependency-order assertions.
#[derive(Clone, Default)]
pub(crate) struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub(crate) fn index_of(&self, entry: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e == entry)
    }

    pub(crate) fn assert_before(&self, first: &str, second: &str) {
        let entries = self.snapshot();
        let a = self.index_of(first);
        let b = self.index_of(second);
        assert!(
            matches!((a, b), (Some(a), Some(b)) if a < b),
            "expected {first:?} before {second:?} in {entries:?}"
        );
    }
}

/// A `u64` whose address stays valid for the whole test run; regions over
/// it can safely outlive the creating scope.
pub(crate) fn leaked_u64(value: u64) -> (&'static mut u64, DataRegion) {
    let leaked: &'static mut u64 = Box::leak(Box::new(value));
    let region = DataRegion::of(leaked);
    (leaked, region)
}

/// Messenger decorator recording every control message sent, for protocol
/// assertions.
pub(crate) struct SpyMessenger {
    inner: Arc<dyn Messenger>,
    sent: Mutex<Vec<(Message, usize)>>,
}

impl SpyMessenger {
    pub(crate) fn new(inner: Arc<dyn Messenger>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn sent_messages(&self) -> Vec<(Message, usize)> {
        self.sent.lock().clone()
    }
}

impl Messenger for SpyMessenger {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn num_ranks(&self) -> usize {
        self.inner.num_ranks()
    }

    fn send_message(&self, message: Message, target: usize, blocking: bool) -> u32 {
        self.sent.lock().push((message.clone(), target));
        self.inner.send_message(message, target, blocking)
    }

    fn send_data(
        &self,
        region: DataRegion,
        target: usize,
        message_id: u32,
        blocking: bool,
    ) -> Option<PendingHandle> {
        self.inner.send_data(region, target, message_id, blocking)
    }

    fn fetch_data(
        &self,
        region: DataRegion,
        source: usize,
        message_id: u32,
        blocking: bool,
    ) -> Option<PendingHandle> {
        self.inner.fetch_data(region, source, message_id, blocking)
    }

    fn check_mail(&self) -> Option<Message> {
        self.inner.check_mail()
    }

    fn barrier(&self) {
        self.inner.barrier()
    }

    fn test_completion(&self, pending: &[PendingHandle]) -> Vec<PendingHandle> {
        self.inner.test_completion(pending)
    }
}

pub(crate) struct ClusterPair {
    pub(crate) node0: Runtime,
    pub(crate) node1: Runtime,
    pub(crate) dsm: Arc<SpanDsm>,
    pub(crate) spy0: Arc<SpyMessenger>,
    pub(crate) spy1: Arc<SpyMessenger>,
}

/// Two single-host nodes over the loopback fabric, sharing one DSM.
pub(crate) fn cluster_pair(policy: ClusterPolicy, dsm_block: usize) -> ClusterPair {
    let fabric = LoopbackFabric::new(2);
    let messengers = fabric.messengers();
    let dsm = Arc::new(SpanDsm::new(dsm_block));

    let spy0 = SpyMessenger::new(messengers[0].clone());
    let spy1 = SpyMessenger::new(messengers[1].clone());

    let node0 = Builder::new()
        .worker_threads(2)
        .thread_name_prefix("node0")
        .cluster(ClusterSetup {
            messenger: spy0.clone(),
            dsm: dsm.clone(),
            policy,
        })
        .try_build()
        .expect("failed to build node 0");
    let node1 = Builder::new()
        .worker_threads(2)
        .thread_name_prefix("node1")
        .cluster(ClusterSetup {
            messenger: spy1.clone(),
            dsm: dsm.clone(),
            policy,
        })
        .try_build()
        .expect("failed to build node 1");

    ClusterPair {
        node0,
        node1,
        dsm,
        spy0,
        spy1,
    }
}
