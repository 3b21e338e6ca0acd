//! Discrete-event simulation of an archive on churning volunteer hosts
//!
//! The simulator drives the same recovery engine the daemon uses. Hosts
//! join and leave, transfers take a connect delay plus `size / rate`
//! seconds, and every completed transfer or host departure triggers a
//! recovery pass on the affected files.

pub mod events;
pub mod failure;
pub mod file;
pub mod scenarios;
pub mod stats;

pub use events::{simulate, EventHandler, EventId, EventQueue};
pub use failure::ChurnModel;
pub use file::SimFile;
pub use stats::{FileStats, Stat};

use crate::coding::Policy;
use crate::error::VdaError;
use crate::host::{Host, HostChooser, HostId, HostRange, HostStore, VDA_HOST_TIMEOUT};
use crate::recovery::{self, TransferAgent, UnitInfo};
use crate::storage::{FileId, Status, UnitId};
use crate::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DAY: f64 = 86400.0;

/// Simulation parameters
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub policy: Policy,
    /// Mean host lifetime, seconds; infinite disables churn
    pub host_life_mean: f64,
    /// Mean delay before a host connects for a transfer
    pub connect_interval: f64,
    /// Mean host transfer rate, bytes/sec
    pub mean_xfer_rate: f64,
    /// Bytes per archived file
    pub file_size: f64,
    /// Initial (and target) host population
    pub num_hosts: usize,
    pub num_files: usize,
    /// Simulated seconds to run
    pub duration: f64,
    pub seed: u64,
    /// Where `summary.txt` and the `.dat` series go
    pub output_dir: Option<PathBuf>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            host_life_mean: 100.0 * DAY,
            connect_interval: DAY,
            mean_xfer_rate: 1e6,
            file_size: 1e12,
            num_hosts: 1000,
            num_files: 1,
            duration: 1000.0 * DAY,
            seed: 0,
            output_dir: None,
        }
    }
}

impl SimConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.host_life_mean.is_nan() || self.host_life_mean <= 0.0 {
            return Err(VdaError::Config("host_life_mean must be positive".into()));
        }
        if self.connect_interval.is_nan() || self.connect_interval < 0.0 {
            return Err(VdaError::Config("connect_interval must be >= 0".into()));
        }
        if !self.mean_xfer_rate.is_finite() || self.mean_xfer_rate <= 0.0 {
            return Err(VdaError::Config("mean_xfer_rate must be positive".into()));
        }
        if self.file_size.is_nan() || self.file_size <= 0.0 {
            return Err(VdaError::Config("file_size must be positive".into()));
        }
        if self.num_hosts == 0 {
            return Err(VdaError::Config("num_hosts must be greater than 0".into()));
        }
        if self.duration.is_nan() || self.duration < 0.0 {
            return Err(VdaError::Config("duration must be >= 0".into()));
        }
        Ok(())
    }

    pub fn churn(&self) -> ChurnModel {
        ChurnModel {
            host_life_mean: self.host_life_mean,
            connect_interval: self.connect_interval,
            mean_xfer_rate: self.mean_xfer_rate,
            num_hosts: self.num_hosts,
        }
    }
}

/// Direction of a chunk transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Server to host
    Download,
    /// Host to server
    Upload,
}

/// One chunk moving between the server and a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub file: FileId,
    pub chunk: UnitId,
    pub host: HostId,
    pub kind: TransferKind,
}

impl Transfer {
    fn key(&self) -> (FileId, UnitId, HostId) {
        (self.file, self.chunk, self.host)
    }
}

/// Events on the simulation queue
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimEvent {
    HostArrival,
    HostDeparture(HostId),
    /// The host connected; bytes start flowing
    TransferStart(Transfer),
    TransferDone(Transfer),
}

/// A simulated volunteer host
#[derive(Debug, Clone)]
pub struct SimHost {
    pub id: HostId,
    /// Bytes/sec in either direction
    pub xfer_rate: f64,
    /// (file, chunk) pairs placed here
    pub chunks: BTreeSet<(FileId, UnitId)>,
    departure: Option<EventId>,
}

/// Everything the transfer agent touches besides the file itself
struct World {
    queue: EventQueue<SimEvent>,
    rng: StdRng,
    churn: ChurnModel,
    hosts: BTreeMap<HostId, SimHost>,
    next_host_id: HostId,
    chooser: HostChooser,
    /// Scheduled start/done event of each active transfer
    pending: HashMap<(FileId, UnitId, HostId), EventId>,
    arrivals: usize,
    departures: usize,
}

impl World {
    fn add_host(&mut self) -> HostId {
        let id = self.next_host_id;
        self.next_host_id += 1;
        let xfer_rate = self.churn.sample_xfer_rate(&mut self.rng);
        let departure = self
            .churn
            .sample_lifetime(&mut self.rng)
            .map(|life| self.queue.insert_after(life, SimEvent::HostDeparture(id)));
        self.hosts.insert(
            id,
            SimHost {
                id,
                xfer_rate,
                chunks: BTreeSet::new(),
                departure,
            },
        );
        id
    }

    fn schedule_arrival(&mut self) {
        if let Some(dt) = self.churn.sample_interarrival(&mut self.rng) {
            self.queue.insert_after(dt, SimEvent::HostArrival);
        }
    }
}

/// The simulated host population as a registry; every member is alive
struct HostView<'a> {
    hosts: &'a BTreeMap<HostId, SimHost>,
    now: f64,
}

impl HostStore for HostView<'_> {
    fn lookup_host(&self, id: HostId) -> Result<Option<Host>> {
        Ok(self.hosts.get(&id).map(|_| Host::new(id, self.now)))
    }

    fn max_host_id(&self) -> Result<HostId> {
        Ok(self.hosts.keys().next_back().map_or(0, |id| id + 1))
    }

    fn enumerate_live_hosts(
        &self,
        _now: f64,
        _timeout: f64,
        range: HostRange,
        limit: usize,
    ) -> Result<Vec<Host>> {
        let ids: Vec<HostId> = match range {
            HostRange::From(start) => self
                .hosts
                .range(start..)
                .map(|(&id, _)| id)
                .take(limit)
                .collect(),
            HostRange::Below(end) => self
                .hosts
                .range(..end)
                .map(|(&id, _)| id)
                .take(limit)
                .collect(),
        };
        Ok(ids.into_iter().map(|id| Host::new(id, self.now)).collect())
    }

    fn count_file_chunks(&self, file_id: FileId, host_id: HostId) -> Result<usize> {
        Ok(self.hosts.get(&host_id).map_or(0, |h| {
            h.chunks
                .range((file_id, 0)..=(file_id, UnitId::MAX))
                .count()
        }))
    }
}

/// Transfer agent that turns recovery actions into scheduled events
struct SimAgent<'a> {
    world: &'a mut World,
    file_id: FileId,
    stats: &'a mut FileStats,
    pending_init: &'a mut usize,
    initializing: bool,
}

impl SimAgent<'_> {
    fn schedule(&mut self, chunk: &UnitInfo, host: HostId, kind: TransferKind) {
        let transfer = Transfer {
            file: self.file_id,
            chunk: chunk.id,
            host,
            kind,
        };
        let delay = self.world.churn.sample_connect_delay(&mut self.world.rng);
        let event = self
            .world
            .queue
            .insert_after(delay, SimEvent::TransferStart(transfer));
        self.world.pending.insert(transfer.key(), event);
    }
}

impl TransferAgent for SimAgent<'_> {
    fn choose_host(&mut self, now: f64) -> Result<Option<HostId>> {
        let world = &mut *self.world;
        let view = HostView {
            hosts: &world.hosts,
            now,
        };
        world.chooser.choose_host(&view, self.file_id, now)
    }

    fn start_download(&mut self, chunk: &UnitInfo, host: HostId, _now: f64) -> Result<()> {
        if let Some(h) = self.world.hosts.get_mut(&host) {
            h.chunks.insert((self.file_id, chunk.id));
        }
        self.schedule(chunk, host, TransferKind::Download);
        if self.initializing {
            *self.pending_init += 1;
        }
        Ok(())
    }

    fn start_upload(&mut self, chunk: &UnitInfo, host: HostId, _now: f64) -> Result<()> {
        self.schedule(chunk, host, TransferKind::Upload);
        Ok(())
    }

    fn delete_server_copy(&mut self, chunk: &UnitInfo, now: f64) -> Result<()> {
        self.stats.disk_usage.sample_inc(-chunk.size, now);
        Ok(())
    }

    fn reconstruct(&mut self, meta: &UnitInfo, _now: f64) -> Result<()> {
        debug!(file = self.file_id, unit = %meta.name, "decode + re-encode");
        Ok(())
    }

    fn chunk_materialized(&mut self, chunk: &UnitInfo, now: f64) -> Result<()> {
        self.stats.disk_usage.sample_inc(chunk.size, now);
        Ok(())
    }
}

/// Snapshot of a running simulation
#[derive(Debug, Clone)]
pub struct SimulationStatus {
    pub now: f64,
    pub hosts_alive: usize,
    pub host_arrivals: usize,
    pub host_departures: usize,
    pub pending_transfers: usize,
    pub files: usize,
    pub files_lost: usize,
    /// Smallest finite fault tolerance over all files
    pub min_fault_tolerance: Option<u32>,
}

impl SimulationStatus {
    /// Get a health description
    pub fn health_description(&self) -> &'static str {
        if self.files_lost > 0 {
            return "Data lost";
        }
        match self.min_fault_tolerance {
            None => "Initializing",
            Some(0) => "Critical",
            Some(1..=2) => "Poor",
            Some(3..=5) => "Fair",
            Some(_) => "Good",
        }
    }
}

/// A running simulation
pub struct Simulation {
    config: SimConfig,
    world: World,
    files: BTreeMap<FileId, SimFile>,
    next_file_id: FileId,
}

impl Simulation {
    /// Populate hosts and archive `num_files` files at time 0
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let chooser = HostChooser::with_seed(config.seed.wrapping_add(1), VDA_HOST_TIMEOUT);
        let mut world = World {
            queue: EventQueue::new(),
            rng: StdRng::seed_from_u64(config.seed),
            churn: config.churn(),
            hosts: BTreeMap::new(),
            next_host_id: 1,
            chooser,
            pending: HashMap::new(),
            arrivals: 0,
            departures: 0,
        };
        for _ in 0..config.num_hosts {
            world.add_host();
        }
        world.schedule_arrival();

        let mut sim = Self {
            config,
            world,
            files: BTreeMap::new(),
            next_file_id: 1,
        };
        for i in 0..sim.config.num_files {
            sim.add_file(&format!("file_{}", i));
        }
        info!(
            hosts = sim.config.num_hosts,
            files = sim.config.num_files,
            policy = %sim.config.policy.description,
            "simulation started"
        );
        Ok(sim)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Archive a new file and start distributing it
    pub fn add_file(&mut self, name: &str) -> FileId {
        let id = self.next_file_id;
        self.next_file_id += 1;
        let now = self.now();
        let file = SimFile::new(id, name, &self.config.policy, self.config.file_size, now);
        self.files.insert(id, file);
        self.recover_file(id);
        id
    }

    /// Simulated seconds since the start
    pub fn now(&self) -> f64 {
        self.world.queue.now()
    }

    pub fn file(&self, id: FileId) -> Option<&SimFile> {
        self.files.get(&id)
    }

    pub fn files(&self) -> impl Iterator<Item = &SimFile> {
        self.files.values()
    }

    pub fn host(&self, id: HostId) -> Option<&SimHost> {
        self.world.hosts.get(&id)
    }

    pub fn hosts_alive(&self) -> usize {
        self.world.hosts.len()
    }

    /// Transfers requested or running
    pub fn pending_transfers(&self) -> usize {
        self.world.pending.len()
    }

    /// Run to the configured duration
    pub fn run(&mut self) -> usize {
        let until = self.config.duration;
        self.run_until(until)
    }

    /// Handle every event up to `until`
    pub fn run_until(&mut self, until: f64) -> usize {
        simulate(self, until)
    }

    /// Advance the clock by `dt` seconds
    pub fn step(&mut self, dt: f64) -> usize {
        let until = self.now() + dt;
        self.run_until(until)
    }

    /// Take a host offline now; false if it is not present
    pub fn kill_host(&mut self, host_id: HostId) -> bool {
        self.remove_host(host_id)
    }

    /// Take a random host holding chunks offline
    pub fn kill_random_host(&mut self) -> Option<HostId> {
        let loaded: Vec<HostId> = self
            .world
            .hosts
            .values()
            .filter(|h| !h.chunks.is_empty())
            .map(|h| h.id)
            .collect();
        if loaded.is_empty() {
            return None;
        }
        let victim = loaded[self.world.rng.gen_range(0..loaded.len())];
        self.remove_host(victim).then_some(victim)
    }

    pub fn status(&self) -> SimulationStatus {
        SimulationStatus {
            now: self.now(),
            hosts_alive: self.world.hosts.len(),
            host_arrivals: self.world.arrivals,
            host_departures: self.world.departures,
            pending_transfers: self.world.pending.len(),
            files: self.files.len(),
            files_lost: self.files.values().filter(|f| f.lost).count(),
            min_fault_tolerance: self
                .files
                .values()
                .filter_map(|f| f.fault_tolerance())
                .min(),
        }
    }

    /// Write reports for the first file into `dir`
    pub fn write_reports(&self, dir: &Path) -> Result<()> {
        let file = self
            .files
            .values()
            .next()
            .ok_or_else(|| VdaError::NotFound("no simulated files".into()))?;
        file.stats.write_reports(dir, self.now())
    }

    fn recover_file(&mut self, file_id: FileId) {
        let now = self.world.queue.now();
        let Some(file) = self.files.get_mut(&file_id) else {
            return;
        };
        let initializing = file.initializing;
        let mut agent = SimAgent {
            world: &mut self.world,
            file_id,
            stats: &mut file.stats,
            pending_init: &mut file.pending_init_downloads,
            initializing,
        };
        match recovery::recover(&mut file.tree, &mut agent, now, false) {
            Ok(report) if !report.is_idle() => debug!(file = file_id, ?report, "recovery pass"),
            Ok(_) => {}
            Err(e) => warn!(file = file_id, error = %e, "recovery pass failed"),
        }
        file.recovery_passes += 1;
        file.sample_fault_tolerance(now);

        if file.status() == Status::Unrecoverable && !file.lost && !file.initializing {
            file.lost = true;
            warn!(file = file_id, time = now, "file lost");
        }
    }

    fn begin_transfer(&mut self, transfer: Transfer) {
        let now = self.now();
        let key = transfer.key();
        let Some(rate) = self.world.hosts.get(&transfer.host).map(|h| h.xfer_rate) else {
            self.world.pending.remove(&key);
            return;
        };
        let Some(file) = self.files.get_mut(&transfer.file) else {
            self.world.pending.remove(&key);
            return;
        };
        let Ok(chunk) = file.tree.chunk_mut(transfer.chunk) else {
            self.world.pending.remove(&key);
            return;
        };
        let size = chunk.size;
        let Some(placement) = chunk.placement_mut(transfer.host) else {
            self.world.pending.remove(&key);
            return;
        };
        placement.transfer_wait = false;
        placement.transfer_in_progress = true;

        match transfer.kind {
            TransferKind::Download => file.stats.download_rate.sample_inc(rate, now),
            TransferKind::Upload => file.stats.upload_rate.sample_inc(rate, now),
        }
        let done = self
            .world
            .queue
            .insert_after(size / rate, SimEvent::TransferDone(transfer));
        self.world.pending.insert(key, done);
    }

    fn finish_transfer(&mut self, transfer: Transfer) {
        let now = self.now();
        self.world.pending.remove(&transfer.key());
        let rate = self
            .world
            .hosts
            .get(&transfer.host)
            .map_or(0.0, |h| h.xfer_rate);
        let Some(file) = self.files.get_mut(&transfer.file) else {
            return;
        };
        let Ok(chunk) = file.tree.chunk_mut(transfer.chunk) else {
            return;
        };
        if let Some(placement) = chunk.placement_mut(transfer.host) {
            placement.finish_transfer();
        }

        match transfer.kind {
            TransferKind::Download => {
                file.stats.download_rate.sample_inc(-rate, now);
                if file.initializing {
                    file.pending_init_downloads = file.pending_init_downloads.saturating_sub(1);
                    if file.pending_init_downloads == 0 {
                        file.initializing = false;
                        info!(file = transfer.file, time = now, "initial distribution done");
                    }
                }
            }
            TransferKind::Upload => {
                chunk.present_on_server = true;
                let size = chunk.size;
                file.stats.upload_rate.sample_inc(-rate, now);
                file.stats.disk_usage.sample_inc(size, now);
            }
        }
        self.recover_file(transfer.file);
    }

    fn remove_host(&mut self, host_id: HostId) -> bool {
        let now = self.now();
        let Some(host) = self.world.hosts.remove(&host_id) else {
            return false;
        };
        if let Some(event) = host.departure {
            self.world.queue.remove(event);
        }
        self.world.departures += 1;

        let mut affected = BTreeSet::new();
        for &(file_id, chunk_id) in &host.chunks {
            if let Some(event) = self.world.pending.remove(&(file_id, chunk_id, host_id)) {
                self.world.queue.remove(event);
            }
            let Some(file) = self.files.get_mut(&file_id) else {
                continue;
            };
            let Ok(chunk) = file.tree.chunk_mut(chunk_id) else {
                continue;
            };
            if let Some(placement) = chunk.remove_placement(host_id) {
                if placement.transfer_in_progress {
                    let stat = if placement.present_on_host {
                        &mut file.stats.upload_rate
                    } else {
                        &mut file.stats.download_rate
                    };
                    stat.sample_inc(-host.xfer_rate, now);
                }
                if !placement.present_on_host && file.initializing {
                    file.pending_init_downloads = file.pending_init_downloads.saturating_sub(1);
                }
            }
            affected.insert(file_id);
        }

        info!(
            host = host_id,
            chunks = host.chunks.len(),
            time = now,
            "host departed"
        );
        for file_id in affected {
            self.recover_file(file_id);
        }
        true
    }

    fn host_arrives(&mut self) {
        let id = self.world.add_host();
        self.world.arrivals += 1;
        self.world.schedule_arrival();
        debug!(host = id, "host joined");

        // new capacity may unblock placements that found no host
        let starved: Vec<FileId> = self
            .files
            .values()
            .filter(|f| f.under_replicated() > 0)
            .map(|f| f.id)
            .collect();
        for file_id in starved {
            self.recover_file(file_id);
        }
    }
}

impl EventHandler for Simulation {
    type Event = SimEvent;

    fn queue(&mut self) -> &mut EventQueue<SimEvent> {
        &mut self.world.queue
    }

    fn handle(&mut self, _now: f64, event: SimEvent) {
        match event {
            SimEvent::HostArrival => self.host_arrives(),
            SimEvent::HostDeparture(id) => {
                self.remove_host(id);
            }
            SimEvent::TransferStart(t) => self.begin_transfer(t),
            SimEvent::TransferDone(t) => self.finish_transfer(t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> SimConfig {
        SimConfig {
            host_life_mean: f64::INFINITY,
            connect_interval: 10.0,
            mean_xfer_rate: 1e6,
            file_size: 1e7,
            num_hosts: 40,
            duration: 1000.0,
            seed: 42,
            ..SimConfig::default()
        }
    }

    fn first_file(sim: &Simulation) -> &SimFile {
        sim.files().next().unwrap()
    }

    fn holder_of(sim: &Simulation, name: &str) -> HostId {
        let file = first_file(sim);
        let id = file.tree.find(name).unwrap();
        file.tree.chunk(id).unwrap().placements[0].host_id
    }

    #[test]
    fn test_config_validation() {
        assert!(SimConfig::default().validate().is_ok());
        let bad = SimConfig {
            num_hosts: 0,
            ..SimConfig::default()
        };
        assert!(matches!(bad.validate(), Err(VdaError::Config(_))));
        let bad = SimConfig {
            mean_xfer_rate: 0.0,
            ..SimConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_initial_distribution_requested() {
        let sim = Simulation::new(quiet_config()).unwrap();
        let file = first_file(&sim);
        assert_eq!(file.pending_init_downloads, 32);
        assert_eq!(sim.pending_transfers(), 32);
        assert_eq!(file.status(), Status::Present);
    }

    #[test]
    fn test_replication_converges_without_churn() {
        let mut sim = Simulation::new(quiet_config()).unwrap();
        sim.run();

        let file = first_file(&sim);
        assert_eq!(file.pending_init_downloads, 0);
        assert!(!file.initializing);
        assert_eq!(file.replica_counts(), (32, 0));
        assert_eq!(file.under_replicated(), 0);
        assert_eq!(file.status(), Status::Recoverable);
        assert_eq!(file.fault_tolerance(), Some(13));
        assert_eq!(file.stats.disk_usage.value(), Some(0.0));
        assert_eq!(sim.pending_transfers(), 0);

        // no host holds two chunks of the file
        for id in 1..=40 {
            assert!(sim.host(id).unwrap().chunks.len() <= 1);
        }
    }

    #[test]
    fn test_single_host_failure_is_repaired() {
        let mut sim = Simulation::new(quiet_config()).unwrap();
        sim.run();

        let victim = holder_of(&sim, "0");
        assert!(sim.kill_host(victim));
        assert!(!sim.kill_host(victim));

        let file = first_file(&sim);
        let chunk_id = file.tree.find("0").unwrap();
        let chunk = file.tree.chunk(chunk_id).unwrap();
        assert_eq!(chunk.host_copies(), 1);
        assert!(chunk.upload_in_progress());
        assert_eq!(file.tree.unit(chunk_id).state.status, Status::Recoverable);
        assert_eq!(file.status(), Status::Recoverable);
        assert_eq!(file.fault_tolerance(), Some(12));

        sim.run_until(2000.0);
        let file = first_file(&sim);
        assert_eq!(file.replica_counts(), (32, 0));
        assert_eq!(file.fault_tolerance(), Some(13));
        assert_eq!(file.stats.fault_tolerance.extreme().map(|(v, _)| v), Some(12.0));
        assert!(file.stats.upload_rate.extreme().unwrap().0 > 0.0);
    }

    #[test]
    fn test_host_death_cancels_its_transfers() {
        let mut sim = Simulation::new(quiet_config()).unwrap();
        let victim = holder_of(&sim, "3");

        assert!(sim.kill_host(victim));
        // the cancelled download was replaced on another host
        let file = first_file(&sim);
        assert_eq!(file.pending_init_downloads, 32);
        assert_eq!(sim.pending_transfers(), 32);
        assert!(!file
            .tree
            .chunk(file.tree.find("3").unwrap())
            .unwrap()
            .is_on_host(victim));

        sim.run();
        assert_eq!(first_file(&sim).replica_counts(), (32, 0));
    }

    #[test]
    fn test_churn_keeps_population_stable() {
        let config = SimConfig {
            host_life_mean: 1e5,
            num_hosts: 50,
            duration: 1e6,
            ..quiet_config()
        };
        let mut sim = Simulation::new(config).unwrap();
        sim.run();

        let status = sim.status();
        assert!(status.host_departures > 0);
        assert!(status.host_arrivals > 0);
        assert!((20..=90).contains(&status.hosts_alive), "{:?}", status);
        assert_eq!(sim.now(), 1e6);
    }

    #[test]
    fn test_reports_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut sim = Simulation::new(quiet_config()).unwrap();
        sim.run();
        sim.write_reports(dir.path()).unwrap();

        let summary = std::fs::read_to_string(dir.path().join("summary.txt")).unwrap();
        assert_eq!(summary.lines().count(), 4);
        assert!(dir.path().join("disk_usage.dat").exists());
    }
}
