//! Archive persistence
//!
//! The daemon keeps three tables: hosts (written by the scheduler, read
//! here), archived files and chunk placements. `MemoryStore` holds them in
//! memory and, when opened on a path, persists them as one JSON document
//! replaced atomically on every `commit()`.

use crate::error::VdaError;
use crate::host::{Host, HostId, HostRange, HostStore, DEAD_HOST_MARKER};
use crate::storage::{FileId, Placement};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// An archived file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedFileRecord {
    pub id: FileId,
    pub name: String,
    /// Directory holding the payload and its encoded tree
    pub dir: PathBuf,
    /// Recovery must be re-run
    pub need_update: bool,
    /// The encoded tree exists on disk
    pub initialized: bool,
    /// The whole file should be brought back to the server
    #[serde(default)]
    pub retrieving: bool,
}

impl ArchivedFileRecord {
    pub fn new(name: &str, dir: &Path) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            dir: dir.to_path_buf(),
            need_update: true,
            initialized: false,
            retrieving: false,
        }
    }
}

/// A chunk replica on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub file_id: FileId,
    pub host_id: HostId,
    /// Dotted chunk name
    pub name: String,
    pub present_on_host: bool,
    pub transfer_in_progress: bool,
    pub transfer_wait: bool,
}

impl PlacementRecord {
    /// Record for a replica whose download was just requested
    pub fn downloading(file_id: FileId, host_id: HostId, name: &str) -> Self {
        Self {
            file_id,
            host_id,
            name: name.to_string(),
            present_on_host: false,
            transfer_in_progress: false,
            transfer_wait: true,
        }
    }

    fn same_slot(&self, file_id: FileId, host_id: HostId, name: &str) -> bool {
        self.file_id == file_id && self.host_id == host_id && self.name == name
    }

    /// In-tree form of this record
    pub fn to_placement(&self) -> Placement {
        Placement {
            host_id: self.host_id,
            present_on_host: self.present_on_host,
            transfer_in_progress: self.transfer_in_progress,
            transfer_wait: self.transfer_wait,
        }
    }
}

/// File and placement half of the persistence layer
pub trait ArchiveStore: HostStore {
    /// Files whose recovery must be re-run
    fn files_needing_update(&self) -> Result<Vec<ArchivedFileRecord>>;

    fn files(&self) -> Result<Vec<ArchivedFileRecord>>;

    fn lookup_file(&self, id: FileId) -> Result<Option<ArchivedFileRecord>>;

    fn lookup_file_by_name(&self, name: &str) -> Result<Option<ArchivedFileRecord>>;

    /// Register a file, returning its new id
    fn insert_file(&mut self, record: ArchivedFileRecord) -> Result<FileId>;

    /// Drop a file and all its placements
    fn remove_file(&mut self, id: FileId) -> Result<bool>;

    fn set_need_update(&mut self, id: FileId, value: bool) -> Result<()>;

    fn set_initialized(&mut self, id: FileId, value: bool) -> Result<()>;

    fn set_retrieving(&mut self, id: FileId, value: bool) -> Result<()>;

    fn placements_for_file(&self, file_id: FileId) -> Result<Vec<PlacementRecord>>;

    fn placements_for_host(&self, host_id: HostId) -> Result<Vec<PlacementRecord>>;

    fn insert_placement(&mut self, record: PlacementRecord) -> Result<()>;

    /// Overwrite the transfer flags of an existing placement
    fn update_placement(&mut self, record: &PlacementRecord) -> Result<()>;

    fn delete_placement(&mut self, file_id: FileId, host_id: HostId, name: &str) -> Result<bool>;

    /// Add or refresh a host record; a newer `rpc_time` clears the dead marker
    fn upsert_host(&mut self, host: Host) -> Result<()>;

    /// Hosts past the timeout whose death has not been handled yet
    fn dead_hosts(&self, now: f64, timeout: f64) -> Result<Vec<Host>>;

    /// Flag a dead host as handled
    fn mark_host_handled(&mut self, host_id: HostId) -> Result<()>;

    /// Make everything written so far durable
    fn commit(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ArchiveState {
    hosts: BTreeMap<HostId, Host>,
    files: BTreeMap<FileId, ArchivedFileRecord>,
    placements: Vec<PlacementRecord>,
    next_file_id: FileId,
}

/// In-memory store, optionally backed by a JSON file
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: ArchiveState,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Store that lives only as long as the process
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the state file at `path`, or start empty if it is missing
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let text = fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        } else {
            ArchiveState::default()
        };
        Ok(Self {
            state,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn file_mut(&mut self, id: FileId) -> Result<&mut ArchivedFileRecord> {
        self.state
            .files
            .get_mut(&id)
            .ok_or_else(|| VdaError::NotFound(format!("file {}", id)))
    }
}

impl HostStore for MemoryStore {
    fn lookup_host(&self, id: HostId) -> Result<Option<Host>> {
        Ok(self.state.hosts.get(&id).cloned())
    }

    fn max_host_id(&self) -> Result<HostId> {
        Ok(self.state.hosts.keys().next_back().map_or(0, |id| id + 1))
    }

    fn enumerate_live_hosts(
        &self,
        now: f64,
        timeout: f64,
        range: HostRange,
        limit: usize,
    ) -> Result<Vec<Host>> {
        Ok(self
            .state
            .hosts
            .values()
            .filter(|h| range.contains(h.id) && h.alive(now, timeout))
            .take(limit)
            .cloned()
            .collect())
    }

    fn count_file_chunks(&self, file_id: FileId, host_id: HostId) -> Result<usize> {
        Ok(self
            .state
            .placements
            .iter()
            .filter(|p| p.file_id == file_id && p.host_id == host_id)
            .count())
    }
}

impl ArchiveStore for MemoryStore {
    fn files_needing_update(&self) -> Result<Vec<ArchivedFileRecord>> {
        Ok(self
            .state
            .files
            .values()
            .filter(|f| f.need_update)
            .cloned()
            .collect())
    }

    fn files(&self) -> Result<Vec<ArchivedFileRecord>> {
        Ok(self.state.files.values().cloned().collect())
    }

    fn lookup_file(&self, id: FileId) -> Result<Option<ArchivedFileRecord>> {
        Ok(self.state.files.get(&id).cloned())
    }

    fn lookup_file_by_name(&self, name: &str) -> Result<Option<ArchivedFileRecord>> {
        Ok(self
            .state
            .files
            .values()
            .find(|f| f.name == name)
            .cloned())
    }

    fn insert_file(&mut self, mut record: ArchivedFileRecord) -> Result<FileId> {
        if self.lookup_file_by_name(&record.name)?.is_some() {
            return Err(VdaError::Store(format!(
                "file '{}' already archived",
                record.name
            )));
        }
        self.state.next_file_id += 1;
        record.id = self.state.next_file_id;
        let id = record.id;
        self.state.files.insert(id, record);
        Ok(id)
    }

    fn remove_file(&mut self, id: FileId) -> Result<bool> {
        self.state.placements.retain(|p| p.file_id != id);
        Ok(self.state.files.remove(&id).is_some())
    }

    fn set_need_update(&mut self, id: FileId, value: bool) -> Result<()> {
        self.file_mut(id)?.need_update = value;
        Ok(())
    }

    fn set_initialized(&mut self, id: FileId, value: bool) -> Result<()> {
        self.file_mut(id)?.initialized = value;
        Ok(())
    }

    fn set_retrieving(&mut self, id: FileId, value: bool) -> Result<()> {
        self.file_mut(id)?.retrieving = value;
        Ok(())
    }

    fn placements_for_file(&self, file_id: FileId) -> Result<Vec<PlacementRecord>> {
        Ok(self
            .state
            .placements
            .iter()
            .filter(|p| p.file_id == file_id)
            .cloned()
            .collect())
    }

    fn placements_for_host(&self, host_id: HostId) -> Result<Vec<PlacementRecord>> {
        Ok(self
            .state
            .placements
            .iter()
            .filter(|p| p.host_id == host_id)
            .cloned()
            .collect())
    }

    fn insert_placement(&mut self, record: PlacementRecord) -> Result<()> {
        if self
            .state
            .placements
            .iter()
            .any(|p| p.same_slot(record.file_id, record.host_id, &record.name))
        {
            return Err(VdaError::Store(format!(
                "chunk {} of file {} already placed on host {}",
                record.name, record.file_id, record.host_id
            )));
        }
        self.state.placements.push(record);
        Ok(())
    }

    fn update_placement(&mut self, record: &PlacementRecord) -> Result<()> {
        let existing = self
            .state
            .placements
            .iter_mut()
            .find(|p| p.same_slot(record.file_id, record.host_id, &record.name))
            .ok_or_else(|| {
                VdaError::NotFound(format!(
                    "placement of chunk {} on host {}",
                    record.name, record.host_id
                ))
            })?;
        *existing = record.clone();
        Ok(())
    }

    fn delete_placement(&mut self, file_id: FileId, host_id: HostId, name: &str) -> Result<bool> {
        let before = self.state.placements.len();
        self.state
            .placements
            .retain(|p| !p.same_slot(file_id, host_id, name));
        Ok(self.state.placements.len() != before)
    }

    fn upsert_host(&mut self, mut host: Host) -> Result<()> {
        if host.death_handled() {
            if let Some(old) = self.state.hosts.get(&host.id) {
                if host.rpc_time > old.rpc_time {
                    host.cpu_efficiency = 0.0;
                }
            }
        }
        self.state.hosts.insert(host.id, host);
        Ok(())
    }

    fn dead_hosts(&self, now: f64, timeout: f64) -> Result<Vec<Host>> {
        Ok(self
            .state
            .hosts
            .values()
            .filter(|h| !h.alive(now, timeout) && !h.death_handled())
            .cloned()
            .collect())
    }

    fn mark_host_handled(&mut self, host_id: HostId) -> Result<()> {
        let host = self
            .state
            .hosts
            .get_mut(&host_id)
            .ok_or_else(|| VdaError::NotFound(format!("host {}", host_id)))?;
        host.cpu_efficiency = DEAD_HOST_MARKER;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(&self.state)?)?;
        fs::rename(&tmp_path, path)?;
        debug!(path = %path.display(), "archive state committed");
        Ok(())
    }
}
