//! A file archived in the simulator

use crate::coding::Policy;
use crate::simulation::stats::FileStats;
use crate::storage::{CodingTree, FileId, Status};

/// Simulated archived file: its coding tree plus run statistics
#[derive(Debug, Clone)]
pub struct SimFile {
    pub id: FileId,
    pub name: String,
    pub tree: CodingTree,
    pub stats: FileStats,
    /// Initial downloads not yet finished
    pub pending_init_downloads: usize,
    /// Still distributing the first replicas
    pub initializing: bool,
    /// The root has been unrecoverable at least once
    pub lost: bool,
    /// Recovery passes run so far
    pub recovery_passes: usize,
}

impl SimFile {
    /// Encode a file of `size` bytes; every chunk starts on the server
    pub fn new(id: FileId, name: &str, policy: &Policy, size: f64, now: f64) -> Self {
        let mut policy = policy.clone();
        policy.compute_chunk_sizes(size);
        let mut tree = CodingTree::build(policy);
        for chunk_id in tree.chunk_ids() {
            if let Some(chunk) = tree.unit_mut(chunk_id).as_chunk_mut() {
                chunk.present_on_server = true;
            }
        }

        let mut stats = FileStats::new();
        stats.disk_usage.sample(tree.server_bytes(), now);
        stats.upload_rate.sample(0.0, now);
        stats.download_rate.sample(0.0, now);

        Self {
            id,
            name: name.to_string(),
            tree,
            stats,
            pending_init_downloads: 0,
            initializing: true,
            lost: false,
            recovery_passes: 0,
        }
    }

    pub fn status(&self) -> Status {
        self.tree.status()
    }

    /// Further host failures the file survives, `None` while unbounded
    pub fn fault_tolerance(&self) -> Option<u32> {
        let root = self.tree.root();
        self.tree.unit(root).state.fault_tolerance()
    }

    /// Record the current fault tolerance if it is finite
    pub fn sample_fault_tolerance(&mut self, now: f64) {
        if let Some(ft) = self.fault_tolerance() {
            self.stats.fault_tolerance.sample(ft as f64, now);
        }
    }

    /// Replicas on hosts and chunks on the server
    pub fn replica_counts(&self) -> (usize, usize) {
        self.tree
            .chunk_ids()
            .into_iter()
            .filter_map(|id| self.tree.unit(id).as_chunk())
            .fold((0, 0), |(hosts, server), c| {
                (hosts + c.host_copies(), server + c.present_on_server as usize)
            })
    }

    /// Chunks below the replication target
    pub fn under_replicated(&self) -> usize {
        let target = self.tree.policy().replication;
        self.tree
            .chunk_ids()
            .into_iter()
            .filter_map(|id| self.tree.unit(id).as_chunk())
            .filter(|c| c.host_copies() < target)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_file_is_on_server() {
        let file = SimFile::new(1, "f", &Policy::default(), 1e7, 0.0);
        // 16 chunks of 1e6 bytes
        assert_eq!(file.stats.disk_usage.value(), Some(16e6));
        assert_eq!(file.replica_counts(), (0, 16));
        assert_eq!(file.under_replicated(), 16);
        assert!(file.initializing);
    }
}
