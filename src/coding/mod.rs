//! Redundancy parameters for archived files
//!
//! A file is protected by one or more levels of erasure coding plus
//! replication of the bottom-level chunks. This module describes those
//! parameters; the actual encoding is done by an external tool.

pub mod policy;

pub use policy::Policy;

use crate::error::VdaError;
use crate::Result;
use serde::{Deserialize, Serialize};

/// One level of erasure coding.
///
/// `n` pieces out of `m = n + k` are enough to rebuild the unit above.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coding {
    /// Data pieces needed to reconstruct
    pub n: usize,
    /// Redundant pieces
    pub k: usize,
    /// Total pieces
    pub m: usize,
    /// Pieces fetched back to the server when reconstructing
    pub n_upload: usize,
}

impl Coding {
    /// Create a coding level, checking its arithmetic
    pub fn new(n: usize, k: usize, n_upload: usize) -> Result<Self> {
        if n == 0 {
            return Err(VdaError::Parse("coding needs n >= 1".into()));
        }
        let m = n + k;
        if n_upload < n || n_upload > m {
            return Err(VdaError::Parse(format!(
                "n_upload {} must be in [{}, {}]",
                n_upload, n, m
            )));
        }
        Ok(Self { n, k, m, n_upload })
    }

    /// Check if a unit is rebuildable from `available` pieces
    pub fn can_recover(&self, available: usize) -> bool {
        available >= self.n
    }

    /// How many pieces can be lost without losing the unit
    pub fn max_losses(&self) -> usize {
        self.k
    }

    /// Size in bytes of one piece produced from a unit of `unit_size` bytes
    pub fn piece_size(&self, unit_size: f64) -> f64 {
        unit_size / self.n as f64
    }
}

impl std::fmt::Display for Coding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} {} {})", self.n, self.k, self.n_upload)
    }
}
