use crate::cluster::dsm::Dsm;
use crate::deps::region::DataRegion;
use crate::numa::{MemoryPlace, NumaDirectory};
use crate::task::{Task, TaskFlags};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How offload targets are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterPolicy {
    /// Node with the most touched bytes wins; ties and first-touch-heavy
    /// tasks fall back to round-robin.
    #[default]
    Locality,
    /// Uniformly random target.
    Random,
}

/// When untouched bytes exceed this multiple of the best node's bytes, the
/// byte counts say too little and a round-robin target balances the
/// first-touch cost instead.
const FIRST_TOUCH_DEFICIT_FACTOR: usize = 2;

/// Offload target selection. Stateless apart from the round-robin cursor,
/// which doubles as the tie-breaker so node 0 never becomes a hot spot.
pub(crate) struct OffloadPolicy {
    policy: ClusterPolicy,
    round_robin: AtomicUsize,
}

impl OffloadPolicy {
    pub(crate) fn new(policy: ClusterPolicy) -> Self {
        Self {
            policy,
            // Seeded randomly so many offloaders do not march in step.
            round_robin: AtomicUsize::new(fastrand::usize(..)),
        }
    }

    /// Pick the node the task should run on, or `None` to keep it local.
    /// Tasks that are spawned, if0, remote, already offloaded, carrying a
    /// workflow, closure-bodied, or touching non-DSM memory are pinned
    /// local.
    ///
    /// Per-node touched bytes come from the access's known location when it
    /// has one, then from the NUMA directory, then from the DSM home-node
    /// function; bytes with no home anywhere count towards the first-touch
    /// deficit.
    pub(crate) fn pick_target(
        &self,
        task: &Arc<Task>,
        dsm: &dyn Dsm,
        directory: &NumaDirectory,
        cluster_size: usize,
        this_node: usize,
    ) -> Option<usize> {
        if cluster_size < 2 || !self.is_offloadable(task) {
            return None;
        }

        let mut bytes = vec![0usize; cluster_size];
        let mut deficit = 0usize;

        {
            let inner = task.accesses.lock();
            for (_, access) in inner.arena.iter() {
                if access.is_taskwait_fragment() {
                    continue;
                }
                let region = access.region();
                if !dsm.is_dsm_address(region.start()) {
                    return None;
                }
                match access.location() {
                    Some(MemoryPlace::ClusterNode(node)) if node < cluster_size => {
                        bytes[node] += region.len();
                    }
                    Some(_) => bytes[this_node] += region.len(),
                    None => {
                        // The directory answers for first-touched pieces;
                        // the DSM fills in the rest.
                        for (piece, home) in directory.homes_in(region) {
                            match home {
                                Some(node) if node < cluster_size => bytes[node] += piece.len(),
                                Some(_) => deficit += piece.len(),
                                None => count_dsm_homes(
                                    dsm,
                                    piece,
                                    cluster_size,
                                    &mut bytes,
                                    &mut deficit,
                                ),
                            }
                        }
                    }
                }
            }
        }

        let target = match self.policy {
            ClusterPolicy::Random => fastrand::usize(0..cluster_size),
            ClusterPolicy::Locality => {
                let best = *bytes.iter().max().expect("cluster_size >= 2");
                if deficit > FIRST_TOUCH_DEFICIT_FACTOR.saturating_mul(best) {
                    self.next_round_robin(cluster_size)
                } else {
                    let tied: Vec<usize> = (0..cluster_size)
                        .filter(|&n| bytes[n] == best)
                        .collect();
                    if tied.len() == 1 {
                        tied[0]
                    } else {
                        tied[self.next_round_robin(tied.len())]
                    }
                }
            }
        };

        (target != this_node).then_some(target)
    }

    fn is_offloadable(&self, task: &Arc<Task>) -> bool {
        let flags = task.flags();
        if flags.intersects(
            TaskFlags::SPAWNED | TaskFlags::IF0 | TaskFlags::REMOTE | TaskFlags::OFFLOADED,
        ) {
            return false;
        }
        if task.workflow.lock().is_some() {
            return false;
        }
        task.has_typed_body()
    }

    fn next_round_robin(&self, modulo: usize) -> usize {
        self.round_robin.fetch_add(1, Ordering::Relaxed) % modulo
    }
}

/// Walk `region` in DSM blocks; untouched blocks count towards the
/// first-touch deficit.
fn count_dsm_homes(
    dsm: &dyn Dsm,
    region: DataRegion,
    cluster_size: usize,
    bytes: &mut [usize],
    deficit: &mut usize,
) {
    let block = dsm.block_size().max(1);
    let mut addr = region.start();
    while addr < region.end() {
        let chunk = block.min(region.end() - addr);
        match dsm.home_node_of(addr) {
            Some(node) if node < cluster_size => bytes[node] += chunk,
            Some(_) | None => *deficit += chunk,
        }
        addr += chunk;
    }
}
