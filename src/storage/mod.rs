//! Data model for archived files
//!
//! An archived file is a tree of data units. Interior nodes are
//! meta-chunks (one level of erasure coding over their children); leaves
//! are chunks, the pieces actually placed on volunteer hosts. The tree
//! lives in an arena and nodes refer to each other by index.

pub mod chunk;
pub mod tree;

pub use chunk::{Chunk, Placement};
pub use tree::{CodingTree, DataUnit, MetaChunk, UnitKind};

use serde::{Deserialize, Serialize};

/// Identifier of an archived file
pub type FileId = u64;

/// Index of a data unit within its file's arena
pub type UnitId = usize;

/// `min_failures` of a unit no host failure can threaten
pub const INFINITE_FAILURES: u32 = u32::MAX;

/// Availability of a data unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Fully available on the server
    Present,
    /// Not on the server but rebuildable from host copies
    Recoverable,
    /// Lost
    Unrecoverable,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Present => write!(f, "PRESENT"),
            Status::Recoverable => write!(f, "RECOVERABLE"),
            Status::Unrecoverable => write!(f, "UNRECOVERABLE"),
        }
    }
}

/// State shared by chunks and meta-chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitState {
    pub status: Status,
    /// Network bytes needed to make this unit present
    pub cost: f64,
    /// Additional host failures that would make this unit unrecoverable
    pub min_failures: u32,
    /// Chosen among siblings to rebuild the parent
    pub in_recovery_set: bool,
    /// Recovery should make this unit present on the server
    pub data_needed: bool,
    /// An ancestor just became present, so this unit can be materialized
    pub data_now_present: bool,
}

impl Default for UnitState {
    fn default() -> Self {
        Self {
            status: Status::Unrecoverable,
            cost: 0.0,
            min_failures: 0,
            in_recovery_set: false,
            data_needed: false,
            data_now_present: false,
        }
    }
}

impl UnitState {
    /// Mark present on the server
    pub fn set_present(&mut self) {
        self.status = Status::Present;
        self.min_failures = INFINITE_FAILURES;
    }

    /// Mark lost
    pub fn set_unrecoverable(&mut self) {
        self.status = Status::Unrecoverable;
        self.min_failures = 0;
    }

    /// Clear the per-pass flags before planning
    pub fn reset_flags(&mut self) {
        self.in_recovery_set = false;
        self.data_needed = false;
        self.data_now_present = false;
    }

    /// Fault tolerance in the "failures survivable" sense, `None` if unbounded
    pub fn fault_tolerance(&self) -> Option<u32> {
        if self.min_failures == INFINITE_FAILURES {
            None
        } else {
            Some(self.min_failures.saturating_sub(1))
        }
    }
}

/// Render a dotted name from an index path (`[3, 1, 0]` -> `"3.1.0"`)
pub fn path_to_name(path: &[usize]) -> String {
    path.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Parse a dotted name back into an index path
pub fn name_to_path(name: &str) -> Option<Vec<usize>> {
    if name.is_empty() {
        return Some(Vec::new());
    }
    name.split('.').map(|part| part.parse().ok()).collect()
}
