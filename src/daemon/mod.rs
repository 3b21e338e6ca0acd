//! The archival daemon
//!
//! Polls the store for dead hosts and for files flagged `need_update`, and
//! runs a recovery pass on each such file, one at a time. Failures are
//! logged and leave the flag set, so the next poll retries.

pub mod layout;
pub mod store;

pub use layout::{Coder, ExternalCoder};
pub use store::{ArchiveStore, ArchivedFileRecord, MemoryStore, PlacementRecord};

use crate::coding::Policy;
use crate::error::VdaError;
use crate::host::{HostChooser, HostId, VDA_HOST_TIMEOUT};
use crate::recovery::{self, ActionReport, TransferAgent, UnitInfo};
use crate::storage::{FileId, Status};
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Seconds without contact before a host is declared dead
    pub host_timeout: f64,
    /// Sleep between polls that found nothing to do
    pub poll_interval: Duration,
    pub encoder_path: PathBuf,
    pub decoder_path: PathBuf,
    /// JSON state file
    pub store_path: PathBuf,
    /// Parent directory of archived file directories
    pub archive_dir: PathBuf,
    pub chooser_scan_limit: usize,
    /// Let a host hold several chunks of a file when no empty host exists
    pub allow_colocated: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host_timeout: VDA_HOST_TIMEOUT,
            poll_interval: Duration::from_secs(5),
            encoder_path: PathBuf::from("vda_encoder"),
            decoder_path: PathBuf::from("vda_decoder"),
            store_path: PathBuf::from("vda_state.json"),
            archive_dir: PathBuf::from("vda_files"),
            chooser_scan_limit: crate::host::chooser::DEFAULT_SCAN_LIMIT,
            allow_colocated: false,
        }
    }
}

impl DaemonConfig {
    pub fn with_archive_dir(mut self, dir: &Path) -> Self {
        self.archive_dir = dir.to_path_buf();
        self
    }

    pub fn with_store_path(mut self, path: &Path) -> Self {
        self.store_path = path.to_path_buf();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.host_timeout.is_nan() || self.host_timeout <= 0.0 {
            return Err(VdaError::Config("host_timeout must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(VdaError::Config("poll_interval must be non-zero".into()));
        }
        if self.chooser_scan_limit == 0 {
            return Err(VdaError::Config(
                "chooser_scan_limit must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// What one poll cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub dead_hosts: usize,
    pub files_updated: usize,
    pub files_failed: usize,
    /// I/O started across all recovery passes
    pub actions: ActionReport,
}

impl CycleReport {
    /// Nothing happened, so the daemon may sleep
    pub fn is_idle(&self) -> bool {
        self.dead_hosts == 0 && self.actions.is_idle()
    }

    fn absorb(&mut self, pass: &ActionReport) {
        self.actions.downloads_started += pass.downloads_started;
        self.actions.uploads_started += pass.uploads_started;
        self.actions.server_copies_deleted += pass.server_copies_deleted;
        self.actions.chunks_materialized += pass.chunks_materialized;
        self.actions.reconstructions += pass.reconstructions;
        self.actions.placements_skipped += pass.placements_skipped;
    }
}

/// Seconds since the Unix epoch
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Transfer agent persisting placements and touching server files
struct StoreAgent<'a, S: ArchiveStore, C: Coder> {
    store: &'a mut S,
    chooser: &'a mut HostChooser,
    coder: &'a C,
    file_id: FileId,
    dir: &'a Path,
    policy: &'a Policy,
}

impl<S: ArchiveStore, C: Coder> TransferAgent for StoreAgent<'_, S, C> {
    fn choose_host(&mut self, now: f64) -> Result<Option<HostId>> {
        self.chooser.choose_host(&*self.store, self.file_id, now)
    }

    fn start_download(&mut self, chunk: &UnitInfo, host: HostId, _now: f64) -> Result<()> {
        self.store
            .insert_placement(PlacementRecord::downloading(self.file_id, host, &chunk.name))?;
        info!(file = self.file_id, chunk = %chunk.name, host, "download requested");
        Ok(())
    }

    fn start_upload(&mut self, chunk: &UnitInfo, host: HostId, _now: f64) -> Result<()> {
        let record = self
            .store
            .placements_for_file(self.file_id)?
            .into_iter()
            .find(|p| p.host_id == host && p.name == chunk.name)
            .ok_or_else(|| {
                VdaError::NotFound(format!("placement of chunk {} on host {}", chunk.name, host))
            })?;
        self.store.update_placement(&PlacementRecord {
            transfer_wait: true,
            ..record
        })?;
        info!(file = self.file_id, chunk = %chunk.name, host, "upload requested");
        Ok(())
    }

    fn delete_server_copy(&mut self, chunk: &UnitInfo, _now: f64) -> Result<()> {
        layout::delete_server_copy(self.dir, &chunk.path)?;
        debug!(file = self.file_id, chunk = %chunk.name, "server copy deleted");
        Ok(())
    }

    fn reconstruct(&mut self, meta: &UnitInfo, _now: f64) -> Result<()> {
        let coding = &self.policy.codings[meta.path.len()];
        layout::reconstruct(self.dir, &meta.path, coding, self.coder)
    }

    fn chunk_materialized(&mut self, chunk: &UnitInfo, _now: f64) -> Result<()> {
        let path = layout::unit_dir(self.dir, &chunk.path).join(layout::DATA_FILE);
        if !path.exists() {
            warn!(chunk = %chunk.name, path = %path.display(), "rebuilt chunk missing on disk");
        }
        Ok(())
    }
}

/// The archival daemon
pub struct Daemon<S: ArchiveStore, C: Coder> {
    config: DaemonConfig,
    store: S,
    coder: C,
    chooser: HostChooser,
}

impl<S: ArchiveStore, C: Coder> Daemon<S, C> {
    pub fn new(config: DaemonConfig, store: S, coder: C) -> Result<Self> {
        config.validate()?;
        let mut chooser = HostChooser::new(config.host_timeout);
        chooser.set_scan_limit(config.chooser_scan_limit);
        chooser.set_allow_colocated(config.allow_colocated);
        Ok(Self {
            config,
            store,
            coder,
            chooser,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Register `payload` for archival under `name`
    pub fn add_file(&mut self, name: &str, payload: &Path, policy_path: &Path) -> Result<FileId> {
        let policy = Policy::from_file(policy_path)?;
        let dir = self.config.archive_dir.join(name);
        fs::create_dir_all(&dir)?;
        layout::link_payload(&dir, &fs::canonicalize(payload)?)?;
        fs::write(dir.join(layout::POLICY_FILE), policy.to_text())?;

        let id = self
            .store
            .insert_file(ArchivedFileRecord::new(name, &dir))?;
        self.store.commit()?;
        info!(file = id, name, policy = %policy.description, "file added");
        Ok(id)
    }

    /// Stop archiving a file and forget its placements
    pub fn remove_file(&mut self, name: &str) -> Result<()> {
        let record = self.file_by_name(name)?;
        self.store.remove_file(record.id)?;
        self.chooser.forget(record.id);
        self.store.commit()?;
        info!(file = record.id, name, "file removed");
        Ok(())
    }

    /// Ask for the whole file to be brought back to the server
    pub fn retrieve(&mut self, name: &str) -> Result<()> {
        let record = self.file_by_name(name)?;
        self.store.set_retrieving(record.id, true)?;
        self.store.set_need_update(record.id, true)?;
        self.store.commit()?;
        info!(file = record.id, name, "retrieval requested");
        Ok(())
    }

    /// Planned state of a file, one line per unit
    pub fn file_status(&mut self, name: &str) -> Result<Vec<String>> {
        let record = self.file_by_name(name)?;
        if !record.initialized {
            return Ok(vec![format!("{}: not yet initialized", name)]);
        }
        let policy = Policy::from_file(&record.dir.join(layout::POLICY_FILE))?;
        let placements = self.store.placements_for_file(record.id)?;
        let mut tree = layout::get_state(&record.dir, policy, &placements)?;
        recovery::recovery_plan(&mut tree);
        Ok(tree.render())
    }

    fn file_by_name(&self, name: &str) -> Result<ArchivedFileRecord> {
        self.store
            .lookup_file_by_name(name)?
            .ok_or_else(|| VdaError::NotFound(format!("file '{}'", name)))
    }

    /// One poll: handle dead hosts, then update flagged files
    pub fn run_once(&mut self, now: f64) -> Result<CycleReport> {
        let mut report = CycleReport {
            dead_hosts: self.handle_dead_hosts(now)?,
            ..CycleReport::default()
        };

        for record in self.store.files_needing_update()? {
            match self.update_file(&record, now) {
                Ok(pass) => {
                    report.files_updated += 1;
                    report.absorb(&pass);
                }
                Err(e) => {
                    report.files_failed += 1;
                    error!(file = record.id, name = %record.name, error = %e, "file update failed");
                }
            }
        }
        Ok(report)
    }

    /// Release the placements of hosts that stopped contacting us
    fn handle_dead_hosts(&mut self, now: f64) -> Result<usize> {
        let dead = self.store.dead_hosts(now, self.config.host_timeout)?;
        for host in &dead {
            let placements = self.store.placements_for_host(host.id)?;
            for p in &placements {
                self.store.delete_placement(p.file_id, p.host_id, &p.name)?;
                self.store.set_need_update(p.file_id, true)?;
            }
            self.store.mark_host_handled(host.id)?;
            info!(host = host.id, placements = placements.len(), "host declared dead");
        }
        if !dead.is_empty() {
            self.store.commit()?;
        }
        Ok(dead.len())
    }

    fn update_file(&mut self, record: &ArchivedFileRecord, now: f64) -> Result<ActionReport> {
        let dir = record.dir.as_path();
        let mut policy = Policy::from_file(&dir.join(layout::POLICY_FILE))?;

        if !record.initialized {
            layout::init_file(dir, &mut policy, &self.coder)?;
            self.store.set_initialized(record.id, true)?;
            self.store.commit()?;
        }

        let placements = self.store.placements_for_file(record.id)?;
        let mut tree = layout::get_state(dir, policy.clone(), &placements)?;
        let mut agent = StoreAgent {
            store: &mut self.store,
            chooser: &mut self.chooser,
            coder: &self.coder,
            file_id: record.id,
            dir,
            policy: &policy,
        };
        let pass = recovery::recover(&mut tree, &mut agent, now, record.retrieving)?;

        let retrieved = record.retrieving && tree.status() == Status::Present;
        if retrieved {
            self.store.set_retrieving(record.id, false)?;
            info!(file = record.id, name = %record.name, "file retrieved");
        }
        if pass.placements_skipped > 0 {
            warn!(
                file = record.id,
                skipped = pass.placements_skipped,
                "replicas not placed, retrying next poll"
            );
        } else if !record.retrieving || retrieved {
            self.store.set_need_update(record.id, false)?;
        }
        self.store.commit()?;

        debug!(
            file = record.id,
            status = %tree.status(),
            downloads = pass.downloads_started,
            uploads = pass.uploads_started,
            deleted = pass.server_copies_deleted,
            "recovery pass done"
        );
        Ok(pass)
    }

    /// Poll until `shutdown` turns true
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            poll_interval = ?self.config.poll_interval,
            host_timeout = self.config.host_timeout,
            "daemon started"
        );
        while !*shutdown.borrow() {
            let idle = match self.run_once(unix_now()) {
                Ok(report) => report.is_idle(),
                Err(e) => {
                    error!(error = %e, "poll failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!("daemon stopped");
        Ok(())
    }
}
