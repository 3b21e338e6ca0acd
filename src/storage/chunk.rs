//! Bottom-level chunks and their host placements
//!
//! A chunk is the unit stored on volunteer hosts. Each host holding (or
//! receiving) a copy is recorded as a placement.

use crate::host::HostId;
use serde::{Deserialize, Serialize};

/// A chunk replica on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub host_id: HostId,
    /// The host holds a complete copy
    pub present_on_host: bool,
    /// Bytes are moving between server and host
    pub transfer_in_progress: bool,
    /// A transfer was requested and waits for the host to connect
    pub transfer_wait: bool,
}

impl Placement {
    /// A new replica whose download has been requested
    pub fn downloading(host_id: HostId) -> Self {
        Self {
            host_id,
            present_on_host: false,
            transfer_in_progress: false,
            transfer_wait: true,
        }
    }

    /// A replica already stored on its host
    pub fn stored(host_id: HostId) -> Self {
        Self {
            host_id,
            present_on_host: true,
            transfer_in_progress: false,
            transfer_wait: false,
        }
    }

    /// Server-to-host transfer pending or running
    pub fn is_downloading(&self) -> bool {
        !self.present_on_host
    }

    /// Host-to-server transfer pending or running
    pub fn is_uploading(&self) -> bool {
        self.present_on_host && (self.transfer_wait || self.transfer_in_progress)
    }

    /// Record a completed transfer
    pub fn finish_transfer(&mut self) {
        self.present_on_host = true;
        self.transfer_in_progress = false;
        self.transfer_wait = false;
    }
}

/// Leaf data unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Size in bytes
    pub size: f64,
    /// A copy is currently stored on the server
    pub present_on_server: bool,
    /// Hosts holding or receiving a copy
    pub placements: Vec<Placement>,
}

impl Chunk {
    /// Create a chunk not yet on the server and with no replicas
    pub fn new(size: f64) -> Self {
        Self {
            size,
            present_on_server: false,
            placements: Vec::new(),
        }
    }

    /// Replicas held or in flight; this is what replication targets count
    pub fn replica_count(&self) -> usize {
        self.placements.len()
    }

    /// Complete copies on hosts
    pub fn host_copies(&self) -> usize {
        self.placements.iter().filter(|p| p.present_on_host).count()
    }

    /// Any replica still being sent to its host
    pub fn download_in_progress(&self) -> bool {
        self.placements.iter().any(|p| p.is_downloading())
    }

    /// Any replica being sent back to the server
    pub fn upload_in_progress(&self) -> bool {
        self.placements.iter().any(|p| p.is_uploading())
    }

    /// Host a reconstruction upload can be taken from
    pub fn upload_source(&self) -> Option<HostId> {
        self.placements
            .iter()
            .find(|p| p.present_on_host)
            .map(|p| p.host_id)
    }

    /// Check if `host_id` holds or receives a copy
    pub fn is_on_host(&self, host_id: HostId) -> bool {
        self.placements.iter().any(|p| p.host_id == host_id)
    }

    /// Mutable access to the placement on `host_id`
    pub fn placement_mut(&mut self, host_id: HostId) -> Option<&mut Placement> {
        self.placements.iter_mut().find(|p| p.host_id == host_id)
    }

    /// Add a placement; a host holds at most one copy
    pub fn add_placement(&mut self, placement: Placement) -> bool {
        if self.is_on_host(placement.host_id) {
            return false;
        }
        self.placements.push(placement);
        true
    }

    /// Drop the placement on `host_id`
    pub fn remove_placement(&mut self, host_id: HostId) -> Option<Placement> {
        let idx = self.placements.iter().position(|p| p.host_id == host_id)?;
        Some(self.placements.remove(idx))
    }
}
