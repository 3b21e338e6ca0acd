//! Volunteer Data Archival
//!
//! Long-term storage of large files on unreliable volunteer hosts. Each file
//! is split by a multi-level erasure code into a tree of chunks; the chunks
//! are replicated across hosts, and a recovery engine keeps every file
//! recoverable as hosts come and go. A discrete-event simulator drives the
//! same engine against a synthetic host population.

pub mod coding;
pub mod daemon;
pub mod error;
pub mod host;
pub mod logging;
pub mod recovery;
pub mod simulation;
pub mod storage;
pub mod ui;

pub use coding::{Coding, Policy};
pub use daemon::{Daemon, DaemonConfig};
pub use error::VdaError;
pub use host::{Host, HostChooser, HostId};
pub use recovery::{recover, TransferAgent};
pub use simulation::{SimConfig, Simulation};
pub use storage::{CodingTree, FileId, Status};
pub use ui::TerminalUI;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, VdaError>;
