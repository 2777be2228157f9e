use crate::cluster::dsm::Dsm;
use crate::cluster::messenger::Messenger;
use crate::cluster::namespace::NodeNamespace;
use crate::cluster::transfer::PendingTransfers;
use crate::deps::region::DataRegion;
use crate::scheduler::cluster::{ClusterPolicy, OffloadPolicy};
use crate::task::{Task, TaskFlags, TaskId};
use dashmap::DashMap;
use std::sync::Arc;

pub mod dsm;
pub mod message;
pub mod messenger;
pub(crate) mod namespace;
pub(crate) mod offload;
pub(crate) mod transfer;


/// Everything a clustered node needs beyond the host runtime: the transport
/// and DSM collaborators, the offload bookkeeping, and the namespace
/// service.
pub(crate) struct ClusterServices {
    pub(crate) node_id: usize,
    pub(crate) cluster_size: usize,
    pub(crate) messenger: Arc<dyn Messenger>,
    pub(crate) dsm: Arc<dyn Dsm>,
    pub(crate) policy: OffloadPolicy,
    /// Local id → local representation of a task offloaded from here.
    pub(crate) offloaded: DashMap<u64, Arc<Task>>,
    /// (offloader node, offloader task id) → wrapper running here.
    pub(crate) remote_wrappers: DashMap<(usize, u64), Arc<Task>>,
    /// Last offload per region start, for namespace-predecessor hints.
    recent_offloads: DashMap<usize, (DataRegion, usize, u64)>,
    pub(crate) namespace: NodeNamespace,
    pub(crate) namespace_scope: Arc<Task>,
    pub(crate) transfers: PendingTransfers,
}

impl ClusterServices {
    pub(crate) fn new(
        messenger: Arc<dyn Messenger>,
        dsm: Arc<dyn Dsm>,
        policy: ClusterPolicy,
        namespace_scope_id: TaskId,
    ) -> Arc<Self> {
        let node_id = messenger.rank();
        let cluster_size = messenger.num_ranks();
        let namespace_scope = Task::new(
            namespace_scope_id,
            Some("node-namespace".into()),
            None,
            TaskFlags::empty(),
            None,
            0,
        );

        Arc::new(Self {
            node_id,
            cluster_size,
            messenger,
            dsm,
            policy: OffloadPolicy::new(policy),
            offloaded: DashMap::new(),
            remote_wrappers: DashMap::new(),
            recent_offloads: DashMap::new(),
            namespace: NodeNamespace::new(),
            namespace_scope,
            transfers: PendingTransfers::new(),
        })
    }

    /// Remember that `region` last went to (`node`, `task`), so the next
    /// offload of a dependent region can name its namespace predecessor.
    pub(crate) fn record_offload(&self, region: DataRegion, node: usize, task: u64) {
        self.recent_offloads
            .insert(region.start(), (region, node, task));
    }

    /// Offloader task id of the last task this node sent `region` to, when
    /// that target matches; 0 otherwise.
    pub(crate) fn namespace_predecessor_for(&self, region: &DataRegion, target: usize) -> u64 {
        self.recent_offloads
            .iter()
            .find(|entry| {
                let (r, node, _) = entry.value();
                *node == target && r.contains(region)
            })
            .map(|entry| entry.value().2)
            .unwrap_or(0)
    }
}
