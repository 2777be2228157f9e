use crate::deps::region::DataRegion;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Where a region's current value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPlace {
    /// Plain host memory of this node.
    Host,
    /// Memory homed on a cluster node.
    ClusterNode(usize),
}

/// One usable CPU as reported by topology discovery.
#[derive(Debug, Clone, Copy)]
pub struct CpuDescriptor {
    pub id: usize,
    pub numa_node: usize,
}

/// Topology discovery is an external collaborator; the runtime only needs
/// the CPU list, per-CPU NUMA node and the page size.
pub trait Topology: Send + Sync {
    fn cpus(&self) -> &[CpuDescriptor];
    fn numa_node_count(&self) -> usize;
    fn page_size(&self) -> usize;
}

/// Default topology: every available CPU on a single NUMA node.
pub struct FlatTopology {
    cpus: Vec<CpuDescriptor>,
}

impl FlatTopology {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            cpus: (0..cpu_count)
                .map(|id| CpuDescriptor { id, numa_node: 0 })
                .collect(),
        }
    }

    pub fn detect() -> Self {
        let count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(count)
    }
}

impl Topology for FlatTopology {
    fn cpus(&self) -> &[CpuDescriptor] {
        &self.cpus
    }

    fn numa_node_count(&self) -> usize {
        1
    }

    fn page_size(&self) -> usize {
        4096
    }
}

struct HomeEntry {
    region: DataRegion,
    node: usize,
}

/// Address-to-home-node map used by the locality policy. Read-mostly: homes
/// are registered at first touch and queried on every offload decision.
pub struct NumaDirectory {
    entries: RwLock<BTreeMap<usize, HomeEntry>>,
}

impl NumaDirectory {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record the home of a freshly touched region. Overlapping earlier
    /// entries are trimmed; first touch wins for the bytes it claimed.
    pub fn register_home(&self, region: DataRegion, node: usize) {
        let mut entries = self.entries.write();
        let covered = Self::collect_overlaps(&entries, &region);
        for key in covered {
            let old = entries.remove(&key).expect("key just collected");
            let (before, after) = old.region.subtract(&region);
            for piece in [before, after].into_iter().flatten() {
                entries.insert(
                    piece.start(),
                    HomeEntry {
                        region: piece,
                        node: old.node,
                    },
                );
            }
        }
        entries.insert(region.start(), HomeEntry { region, node });
    }

    /// Split `region` into (sub-region, home) pieces; `None` marks bytes
    /// with no home yet (first-touch deficit). This is what the cluster
    /// locality policy votes with.
    pub fn homes_in(&self, region: DataRegion) -> SmallVec<[(DataRegion, Option<usize>); 4]> {
        let entries = self.entries.read();
        let mut out: SmallVec<[(DataRegion, Option<usize>); 4]> = SmallVec::new();
        let mut cursor = region.start();

        for (_, entry) in entries.range(..region.end()) {
            let Some(overlap) = entry.region.intersect(&region) else {
                continue;
            };
            if cursor < overlap.start() {
                out.push((DataRegion::new(cursor, overlap.start() - cursor), None));
            }
            out.push((overlap, Some(entry.node)));
            cursor = overlap.end();
        }
        if cursor < region.end() {
            out.push((DataRegion::new(cursor, region.end() - cursor), None));
        }
        out
    }

    /// Distributed free: drop every entry intersecting `region`.
    pub fn forget(&self, region: DataRegion) {
        let mut entries = self.entries.write();
        let covered = Self::collect_overlaps(&entries, &region);
        for key in covered {
            let old = entries.remove(&key).expect("key just collected");
            let (before, after) = old.region.subtract(&region);
            for piece in [before, after].into_iter().flatten() {
                entries.insert(
                    piece.start(),
                    HomeEntry {
                        region: piece,
                        node: old.node,
                    },
                );
            }
        }
    }

    fn collect_overlaps(entries: &BTreeMap<usize, HomeEntry>, region: &DataRegion) -> Vec<usize> {
        entries
            .range(..region.end())
            .rev()
            .take_while(|(_, e)| e.region.end() > region.start())
            .map(|(k, _)| *k)
            .collect()
    }
}

impl Default for NumaDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn home_at(dir: &NumaDirectory, addr: usize) -> Option<usize> {
        dir.homes_in(DataRegion::new(addr, 1))[0].1
    }

    #[test]
    fn first_touch_and_lookup() {
        let dir = NumaDirectory::new();
        dir.register_home(DataRegion::new(0x1000, 0x1000), 1);
        dir.register_home(DataRegion::new(0x2000, 0x1000), 2);

        assert_eq!(home_at(&dir, 0x1800), Some(1));
        assert_eq!(home_at(&dir, 0x2000), Some(2));
        assert_eq!(home_at(&dir, 0x3000), None);
    }

    #[test]
    fn homes_in_reports_deficit() {
        let dir = NumaDirectory::new();
        dir.register_home(DataRegion::new(0x1000, 0x100), 0);

        let pieces = dir.homes_in(DataRegion::new(0x0f80, 0x200));
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0], (DataRegion::new(0x0f80, 0x80), None));
        assert_eq!(pieces[1], (DataRegion::new(0x1000, 0x100), Some(0)));
        assert_eq!(pieces[2], (DataRegion::new(0x1100, 0x80), None));
    }

    #[test]
    fn forget_trims_partial_overlap() {
        let dir = NumaDirectory::new();
        dir.register_home(DataRegion::new(0x1000, 0x100), 3);
        dir.forget(DataRegion::new(0x1040, 0x40));

        assert_eq!(home_at(&dir, 0x1000), Some(3));
        assert_eq!(home_at(&dir, 0x1050), None);
        assert_eq!(home_at(&dir, 0x10c0), Some(3));
    }
}
