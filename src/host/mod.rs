//! Volunteer hosts as seen by the archival core
//!
//! Host records live in an external registry. The core only needs to look
//! hosts up, enumerate live ones by id range, and count how many chunks
//! of a file each host already holds.

pub mod chooser;

pub use chooser::HostChooser;

use crate::storage::FileId;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Identifier of a volunteer host; 0 is never a valid host
pub type HostId = u64;

/// A host is alive while it contacted us within this many seconds (4 days)
pub const VDA_HOST_TIMEOUT: f64 = 4.0 * 86400.0;

/// `cpu_efficiency` value marking a dead host whose chunks were released
pub const DEAD_HOST_MARKER: f64 = 1e9;

/// Host registry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    /// Last contact time, seconds since the epoch
    pub rpc_time: f64,
    /// Reused as the "dead and handled" marker
    pub cpu_efficiency: f64,
}

impl Host {
    pub fn new(id: HostId, rpc_time: f64) -> Self {
        Self {
            id,
            rpc_time,
            cpu_efficiency: 0.0,
        }
    }

    /// Check if the host contacted us recently enough
    pub fn alive(&self, now: f64, timeout: f64) -> bool {
        now - self.rpc_time < timeout
    }

    /// Whether its death has already been processed
    pub fn death_handled(&self) -> bool {
        self.cpu_efficiency >= DEAD_HOST_MARKER
    }
}

/// Id range clause for host enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRange {
    /// `id >= start`
    From(HostId),
    /// `id < end`
    Below(HostId),
}

impl HostRange {
    pub fn contains(&self, id: HostId) -> bool {
        match *self {
            HostRange::From(start) => id >= start,
            HostRange::Below(end) => id < end,
        }
    }
}

/// Host lookups the chooser needs from the registry
pub trait HostStore {
    /// Fetch one host record
    fn lookup_host(&self, id: HostId) -> Result<Option<Host>>;

    /// One past the largest host id in use (0 when there are no hosts)
    fn max_host_id(&self) -> Result<HostId>;

    /// Live hosts in `range`, ascending by id, at most `limit` of them
    fn enumerate_live_hosts(
        &self,
        now: f64,
        timeout: f64,
        range: HostRange,
        limit: usize,
    ) -> Result<Vec<Host>>;

    /// Chunks of `file_id` placed on `host_id`
    fn count_file_chunks(&self, file_id: FileId, host_id: HostId) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_liveness() {
        let host = Host::new(1, 1000.0);
        assert!(host.alive(1000.0 + VDA_HOST_TIMEOUT - 1.0, VDA_HOST_TIMEOUT));
        assert!(!host.alive(1000.0 + VDA_HOST_TIMEOUT, VDA_HOST_TIMEOUT));
        assert!(!host.death_handled());
    }

    #[test]
    fn test_range_clause() {
        assert!(HostRange::From(5).contains(5));
        assert!(!HostRange::From(5).contains(4));
        assert!(HostRange::Below(5).contains(4));
        assert!(!HostRange::Below(5).contains(5));
    }
}
