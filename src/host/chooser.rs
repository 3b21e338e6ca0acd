//! Picking hosts for new chunk replicas
//!
//! A host should hold at most one chunk of any file, so a single host
//! failure costs each file at most one piece. Finding such hosts means
//! scanning the registry; the scan remembers every extra zero-chunk host it
//! sees so later placements for the same file can skip the scan.

use crate::host::{HostId, HostRange, HostStore};
use crate::storage::FileId;
use crate::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Hosts examined per scan
pub const DEFAULT_SCAN_LIMIT: usize = 100;

/// Host chooser with a per-file cache of candidate hosts
pub struct HostChooser {
    rng: StdRng,
    /// Hosts that held no chunks of the file as of the last scan
    available_hosts: HashMap<FileId, VecDeque<HostId>>,
    scan_limit: usize,
    host_timeout: f64,
    /// Fall back to the least-loaded host (`best_host_id`) when no empty
    /// one exists. Off by default, so a host never gets two chunks of one
    /// file and the caller skips the placement instead.
    allow_colocated: bool,
}

impl HostChooser {
    /// Create a chooser seeded from the OS
    pub fn new(host_timeout: f64) -> Self {
        Self::with_rng(StdRng::from_entropy(), host_timeout)
    }

    /// Create a chooser with a fixed seed
    pub fn with_seed(seed: u64, host_timeout: f64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), host_timeout)
    }

    fn with_rng(rng: StdRng, host_timeout: f64) -> Self {
        Self {
            rng,
            available_hosts: HashMap::new(),
            scan_limit: DEFAULT_SCAN_LIMIT,
            host_timeout,
            allow_colocated: false,
        }
    }

    /// Set how many hosts one scan examines
    pub fn set_scan_limit(&mut self, limit: usize) {
        self.scan_limit = limit.max(1);
    }

    /// Allow returning a host that already holds chunks of the file,
    /// the least-loaded one, when the scan finds no empty host
    pub fn set_allow_colocated(&mut self, allow: bool) {
        self.allow_colocated = allow;
    }

    /// Cached candidates for a file
    pub fn cached(&self, file_id: FileId) -> usize {
        self.available_hosts.get(&file_id).map_or(0, |q| q.len())
    }

    /// Forget cached candidates, e.g. when the file is removed
    pub fn forget(&mut self, file_id: FileId) {
        self.available_hosts.remove(&file_id);
    }

    /// Choose a host to receive a new replica of a chunk of `file_id`
    ///
    /// `Ok(None)` means no suitable host right now; the caller skips this
    /// placement and the next recovery pass tries again. Registry errors
    /// abort the search and are returned as `Err`.
    pub fn choose_host<S: HostStore + ?Sized>(
        &mut self,
        store: &S,
        file_id: FileId,
        now: f64,
    ) -> Result<Option<HostId>> {
        if let Some(id) = self.pop_cached(store, file_id, now)? {
            return Ok(Some(id));
        }
        self.scan(store, file_id, now)
    }

    fn pop_cached<S: HostStore + ?Sized>(
        &mut self,
        store: &S,
        file_id: FileId,
        now: f64,
    ) -> Result<Option<HostId>> {
        let Some(queue) = self.available_hosts.get_mut(&file_id) else {
            return Ok(None);
        };
        while let Some(id) = queue.pop_front() {
            let Some(host) = store.lookup_host(id)? else {
                continue;
            };
            if !host.alive(now, self.host_timeout) {
                debug!(host = id, "cached host no longer alive");
                continue;
            }
            if store.count_file_chunks(file_id, id)? > 0 {
                continue;
            }
            return Ok(Some(id));
        }
        Ok(None)
    }

    fn scan<S: HostStore + ?Sized>(
        &mut self,
        store: &S,
        file_id: FileId,
        now: f64,
    ) -> Result<Option<HostId>> {
        let max_id = store.max_host_id()?;
        if max_id == 0 {
            return Ok(None);
        }
        let start = self.rng.gen_range(0..max_id);

        let mut hosts = store.enumerate_live_hosts(
            now,
            self.host_timeout,
            HostRange::From(start),
            self.scan_limit,
        )?;
        if hosts.len() < self.scan_limit {
            let rest = self.scan_limit - hosts.len();
            hosts.extend(store.enumerate_live_hosts(
                now,
                self.host_timeout,
                HostRange::Below(start),
                rest,
            )?);
        }

        let mut host0_id = None;
        let mut best: Option<(HostId, usize)> = None;
        let queue = self.available_hosts.entry(file_id).or_default();

        for host in &hosts {
            let n = store.count_file_chunks(file_id, host.id)?;
            if n == 0 {
                if host0_id.is_none() {
                    host0_id = Some(host.id);
                } else {
                    queue.push_back(host.id);
                }
            } else if best.map_or(true, |(_, best_n)| n < best_n) {
                best = Some((host.id, n));
            }
        }

        debug!(
            file = file_id,
            start,
            scanned = hosts.len(),
            cached = queue.len(),
            "host scan finished"
        );

        if host0_id.is_some() {
            return Ok(host0_id);
        }
        if self.allow_colocated {
            return Ok(best.map(|(id, _)| id));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VdaError;
    use crate::host::Host;
    use std::cell::Cell;
    use std::collections::BTreeMap;

    const NOW: f64 = 1_000_000.0;
    const TIMEOUT: f64 = 100.0;

    struct TableStore {
        hosts: BTreeMap<HostId, (Host, usize)>,
        scans: Cell<usize>,
        fail: bool,
    }

    impl TableStore {
        fn new(table: &[(HostId, usize)]) -> Self {
            Self {
                hosts: table
                    .iter()
                    .map(|&(id, n)| (id, (Host::new(id, NOW), n)))
                    .collect(),
                scans: Cell::new(0),
                fail: false,
            }
        }
    }

    impl HostStore for TableStore {
        fn lookup_host(&self, id: HostId) -> Result<Option<Host>> {
            Ok(self.hosts.get(&id).map(|(h, _)| h.clone()))
        }

        fn max_host_id(&self) -> Result<HostId> {
            Ok(self.hosts.keys().next_back().map_or(0, |id| id + 1))
        }

        fn enumerate_live_hosts(
            &self,
            now: f64,
            timeout: f64,
            range: HostRange,
            limit: usize,
        ) -> Result<Vec<Host>> {
            if self.fail {
                return Err(VdaError::Store("connection lost".into()));
            }
            self.scans.set(self.scans.get() + 1);
            Ok(self
                .hosts
                .values()
                .map(|(h, _)| h)
                .filter(|h| range.contains(h.id) && h.alive(now, timeout))
                .take(limit)
                .cloned()
                .collect())
        }

        fn count_file_chunks(&self, _file_id: FileId, host_id: HostId) -> Result<usize> {
            Ok(self.hosts.get(&host_id).map_or(0, |(_, n)| *n))
        }
    }

    #[test]
    fn test_prefers_zero_chunk_hosts() {
        for seed in 0..20 {
            let store = TableStore::new(&[(1, 0), (2, 1), (3, 0)]);
            let mut chooser = HostChooser::with_seed(seed, TIMEOUT);

            let first = chooser.choose_host(&store, 9, NOW).unwrap().unwrap();
            assert!(first == 1 || first == 3);
            assert_eq!(chooser.cached(9), 1);
            let scans = store.scans.get();

            let second = chooser.choose_host(&store, 9, NOW).unwrap().unwrap();
            assert_eq!(second, if first == 1 { 3 } else { 1 });
            assert_eq!(store.scans.get(), scans, "second call must not re-scan");
        }
    }

    #[test]
    fn test_no_empty_host() {
        let store = TableStore::new(&[(1, 2), (2, 1), (3, 4)]);
        let mut chooser = HostChooser::with_seed(1, TIMEOUT);
        assert_eq!(chooser.choose_host(&store, 9, NOW).unwrap(), None);

        chooser.set_allow_colocated(true);
        assert_eq!(chooser.choose_host(&store, 9, NOW).unwrap(), Some(2));
    }

    #[test]
    fn test_dead_cached_hosts_are_skipped() {
        let mut store = TableStore::new(&[(1, 0), (2, 0), (3, 0)]);
        let mut chooser = HostChooser::with_seed(3, TIMEOUT);
        let first = chooser.choose_host(&store, 4, NOW).unwrap().unwrap();
        assert_eq!(chooser.cached(4), 2);

        // every other host stops contacting us
        for (id, (host, _)) in store.hosts.iter_mut() {
            if *id != first {
                host.rpc_time = NOW - 2.0 * TIMEOUT;
            }
        }
        // cache drains, scan finds `first` which now holds a chunk
        store.hosts.get_mut(&first).unwrap().1 = 1;
        assert_eq!(chooser.choose_host(&store, 4, NOW).unwrap(), None);
        assert_eq!(chooser.cached(4), 0);
    }

    #[test]
    fn test_wraps_around_id_space() {
        let store = TableStore::new(&[(1, 0), (50, 1)]);
        for seed in 0..10 {
            let mut chooser = HostChooser::with_seed(seed, TIMEOUT);
            assert_eq!(chooser.choose_host(&store, 1, NOW).unwrap(), Some(1));
        }
    }

    #[test]
    fn test_store_error_is_surfaced() {
        let mut store = TableStore::new(&[(1, 0)]);
        store.fail = true;
        let mut chooser = HostChooser::with_seed(0, TIMEOUT);
        assert!(chooser.choose_host(&store, 1, NOW).is_err());
    }

    #[test]
    fn test_empty_registry() {
        let store = TableStore::new(&[]);
        let mut chooser = HostChooser::with_seed(0, TIMEOUT);
        assert_eq!(chooser.choose_host(&store, 1, NOW).unwrap(), None);
    }
}
