//! Recovery engine
//!
//! Keeping a file available is a two-pass walk over its coding tree,
//! re-run from scratch after every external event (host death, finished
//! transfer, new file):
//!
//! 1. [`recovery_plan`] derives, bottom-up, each unit's status, the
//!    network cost of making it present, and which children form the
//!    cheapest set for rebuilding each meta-chunk.
//! 2. [`recovery_action`] walks top-down, deciding which units must be on
//!    the server, and asks a [`TransferAgent`] to move data accordingly.
//!    Each node's status and fault tolerance are then refreshed from its
//!    children's post-action state.
//!
//! Nothing is incremental; every pass re-derives state from the current
//! placement and server facts.

use crate::host::HostId;
use crate::storage::{
    CodingTree, DataUnit, Placement, Status, UnitId, UnitKind, INFINITE_FAILURES,
};
use crate::Result;
use tracing::{debug, info, warn};

/// Identity of a unit handed to the transfer agent
#[derive(Debug, Clone, PartialEq)]
pub struct UnitInfo {
    /// Dotted tree position
    pub name: String,
    pub path: Vec<usize>,
    pub id: UnitId,
    /// Bytes (0 when not known)
    pub size: f64,
}

/// Side effects of the action phase
///
/// The daemon implements this against the database and the server's
/// filesystem; the simulator implements it with scheduled events.
pub trait TransferAgent {
    /// Pick a host for a new replica; `Ok(None)` skips the placement
    fn choose_host(&mut self, now: f64) -> Result<Option<HostId>>;

    /// Begin sending a chunk from the server to `host`
    fn start_download(&mut self, chunk: &UnitInfo, host: HostId, now: f64) -> Result<()>;

    /// Begin fetching a chunk from `host` back to the server
    fn start_upload(&mut self, chunk: &UnitInfo, host: HostId, now: f64) -> Result<()>;

    /// Drop the server copy of a chunk
    fn delete_server_copy(&mut self, chunk: &UnitInfo, now: f64) -> Result<()>;

    /// Regenerate the pieces of a present meta-chunk that were lost
    fn reconstruct(&mut self, _meta: &UnitInfo, _now: f64) -> Result<()> {
        Ok(())
    }

    /// A lost chunk is back on the server thanks to a reconstruction
    fn chunk_materialized(&mut self, _chunk: &UnitInfo, _now: f64) -> Result<()> {
        Ok(())
    }
}

/// What one action pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionReport {
    pub downloads_started: usize,
    pub uploads_started: usize,
    pub server_copies_deleted: usize,
    pub chunks_materialized: usize,
    pub reconstructions: usize,
    /// Replicas wanted but not placed for lack of a host
    pub placements_skipped: usize,
}

impl ActionReport {
    /// Whether the pass triggered any I/O
    pub fn is_idle(&self) -> bool {
        self.downloads_started == 0
            && self.uploads_started == 0
            && self.server_copies_deleted == 0
            && self.reconstructions == 0
    }
}

/// Plan then act; `retrieve` asks for the whole file on the server
pub fn recover<A: TransferAgent + ?Sized>(
    tree: &mut CodingTree,
    agent: &mut A,
    now: f64,
    retrieve: bool,
) -> Result<ActionReport> {
    recovery_plan(tree);
    if retrieve {
        let root = tree.root();
        tree.unit_mut(root).state.data_needed = true;
    }
    recovery_action(tree, agent, now)
}

/// Phase 1: recompute status, cost, min_failures and recovery sets
pub fn recovery_plan(tree: &mut CodingTree) {
    let root = tree.root();
    tree.unit_mut(root).state.reset_flags();
    plan_unit(tree, root);
}

fn plan_unit(tree: &mut CodingTree, id: UnitId) {
    if tree.unit(id).is_chunk() {
        plan_chunk(tree, id);
    } else {
        plan_meta(tree, id);
    }
}

fn plan_chunk(tree: &mut CodingTree, id: UnitId) {
    let replication = tree.policy().replication;
    let DataUnit { state, kind, .. } = tree.unit_mut(id);
    let UnitKind::Chunk(chunk) = kind else {
        return;
    };

    if chunk.present_on_server {
        state.set_present();
        state.cost = 0.0;
    } else if chunk.host_copies() > 0 {
        state.status = Status::Recoverable;
        state.cost = chunk.size;
        state.min_failures = chunk.host_copies() as u32;
        if chunk.replica_count() < replication {
            state.data_needed = true;
        }
    } else {
        state.set_unrecoverable();
        state.cost = 0.0;
    }
}

fn plan_meta(tree: &mut CodingTree, id: UnitId) {
    let children = tree.children(id).to_vec();
    let n = coding_n(tree, id);

    let mut present = Vec::new();
    let mut recoverable = Vec::new();
    let mut have_unrecoverable = false;

    for &child in &children {
        tree.unit_mut(child).state.reset_flags();
        plan_unit(tree, child);
        match tree.unit(child).state.status {
            Status::Present => present.push(child),
            Status::Recoverable => recoverable.push(child),
            Status::Unrecoverable => have_unrecoverable = true,
        }
    }

    if let UnitKind::Meta(meta) = &mut tree.unit_mut(id).kind {
        meta.have_unrecoverable_children = have_unrecoverable;
    }

    if present.len() >= n {
        sort_by_cost(tree, &mut present);
        let mut cost = 0.0;
        for &child in present.iter().take(n) {
            let state = &mut tree.unit_mut(child).state;
            state.in_recovery_set = true;
            cost += state.cost;
        }
        let state = &mut tree.unit_mut(id).state;
        state.set_present();
        state.cost = cost;
    } else if present.len() + recoverable.len() >= n {
        sort_by_cost(tree, &mut recoverable);
        for &child in &present {
            tree.unit_mut(child).state.in_recovery_set = true;
        }
        let mut cost = 0.0;
        for &child in recoverable.iter().take(n - present.len()) {
            let state = &mut tree.unit_mut(child).state;
            state.in_recovery_set = true;
            cost += state.cost;
        }
        let min_failures = min_failures_estimate(tree, present.len(), &recoverable, n);
        let state = &mut tree.unit_mut(id).state;
        state.status = Status::Recoverable;
        state.cost = cost;
        state.min_failures = min_failures;
    } else {
        let state = &mut tree.unit_mut(id).state;
        state.set_unrecoverable();
        state.cost = 0.0;
    }

    debug!(
        unit = %tree.unit(id).name,
        status = %tree.unit(id).state.status,
        cost = tree.unit(id).state.cost,
        present = present.len(),
        recoverable = recoverable.len(),
        "planned meta-chunk"
    );
}

/// Phase 2: enact the plan, then refresh status and fault tolerance
pub fn recovery_action<A: TransferAgent + ?Sized>(
    tree: &mut CodingTree,
    agent: &mut A,
    now: f64,
) -> Result<ActionReport> {
    let mut report = ActionReport::default();
    let root = tree.root();
    action_unit(tree, agent, root, now, &mut report)?;
    Ok(report)
}

fn action_unit<A: TransferAgent + ?Sized>(
    tree: &mut CodingTree,
    agent: &mut A,
    id: UnitId,
    now: f64,
    report: &mut ActionReport,
) -> Result<()> {
    if tree.unit(id).is_chunk() {
        action_chunk(tree, agent, id, now, report)
    } else {
        action_meta(tree, agent, id, now, report)
    }
}

fn action_meta<A: TransferAgent + ?Sized>(
    tree: &mut CodingTree,
    agent: &mut A,
    id: UnitId,
    now: f64,
    report: &mut ActionReport,
) -> Result<()> {
    if tree.unit(id).state.data_now_present {
        tree.unit_mut(id).state.set_present();
    }

    let children = tree.children(id).to_vec();
    let status = tree.unit(id).state.status;
    let data_needed = tree.unit(id).state.data_needed;
    let lost: Vec<UnitId> = children
        .iter()
        .copied()
        .filter(|&c| tree.unit(c).state.status == Status::Unrecoverable)
        .collect();

    match status {
        Status::Present => {
            if !lost.is_empty() {
                info!(
                    unit = %tree.unit(id).name,
                    lost = lost.len(),
                    "rebuilding lost pieces"
                );
                agent.reconstruct(&unit_info(tree, id), now)?;
                report.reconstructions += 1;
                for &child in &lost {
                    tree.unit_mut(child).state.data_now_present = true;
                }
            }
            if data_needed {
                mark_recovery_set_needed(tree, &children);
            }
        }
        Status::Recoverable => {
            if data_needed || !lost.is_empty() {
                mark_recovery_set_needed(tree, &children);
            }
        }
        Status::Unrecoverable => {}
    }

    for &child in &children {
        action_unit(tree, agent, child, now, report)?;
    }

    refresh_meta(tree, id);
    Ok(())
}

fn mark_recovery_set_needed(tree: &mut CodingTree, children: &[UnitId]) {
    for &child in children {
        let state = &mut tree.unit_mut(child).state;
        if state.in_recovery_set {
            state.data_needed = true;
        }
    }
}

/// Recompute a meta-chunk's status and min_failures from its children
fn refresh_meta(tree: &mut CodingTree, id: UnitId) {
    let n = coding_n(tree, id);
    let mut present = 0;
    let mut recoverable = Vec::new();
    for &child in tree.children(id) {
        match tree.unit(child).state.status {
            Status::Present => present += 1,
            Status::Recoverable => recoverable.push(child),
            Status::Unrecoverable => {}
        }
    }

    if present >= n {
        tree.unit_mut(id).state.set_present();
    } else if present + recoverable.len() >= n {
        let min_failures = min_failures_estimate(tree, present, &recoverable, n);
        let state = &mut tree.unit_mut(id).state;
        state.status = Status::Recoverable;
        state.min_failures = min_failures;
    } else {
        tree.unit_mut(id).state.set_unrecoverable();
    }
}

fn action_chunk<A: TransferAgent + ?Sized>(
    tree: &mut CodingTree,
    agent: &mut A,
    id: UnitId,
    now: f64,
    report: &mut ActionReport,
) -> Result<()> {
    let replication = tree.policy().replication;
    let info = unit_info(tree, id);
    let DataUnit { state, kind, .. } = tree.unit_mut(id);
    let UnitKind::Chunk(chunk) = kind else {
        return Ok(());
    };

    if state.data_now_present {
        chunk.present_on_server = true;
        state.set_present();
        state.cost = 0.0;
        agent.chunk_materialized(&info, now)?;
        report.chunks_materialized += 1;
    }

    if state.status == Status::Present {
        while chunk.replica_count() < replication {
            let host = match agent.choose_host(now) {
                Ok(Some(host)) => host,
                Ok(None) => {
                    report.placements_skipped += replication - chunk.replica_count();
                    debug!(chunk = %info.name, "no host available for replica");
                    break;
                }
                Err(e) => {
                    warn!(chunk = %info.name, error = %e, "host selection failed");
                    report.placements_skipped += replication - chunk.replica_count();
                    break;
                }
            };
            if !chunk.add_placement(Placement::downloading(host)) {
                report.placements_skipped += replication - chunk.replica_count();
                break;
            }
            agent.start_download(&info, host, now)?;
            report.downloads_started += 1;
        }
    }

    if chunk.download_in_progress() {
        state.data_needed = true;
    }

    if state.data_needed {
        if !chunk.present_on_server && !chunk.upload_in_progress() {
            if let Some(host) = chunk.upload_source() {
                if let Some(p) = chunk.placement_mut(host) {
                    p.transfer_wait = true;
                }
                agent.start_upload(&info, host, now)?;
                report.uploads_started += 1;
            }
        }
    } else if chunk.present_on_server && chunk.host_copies() >= replication {
        agent.delete_server_copy(&info, now)?;
        chunk.present_on_server = false;
        state.status = Status::Recoverable;
        state.cost = chunk.size;
        state.min_failures = replication as u32;
        report.server_copies_deleted += 1;
    }
    Ok(())
}

/// Least number of further host failures that makes a recoverable
/// meta-chunk unrecoverable
///
/// Losing `j = |recoverable| - (n - present) + 1` recoverable children
/// drops availability below `n`; the cheapest such loss is the sum of the
/// `j` smallest child `min_failures`.
fn min_failures_estimate(
    tree: &CodingTree,
    present: usize,
    recoverable: &[UnitId],
    n: usize,
) -> u32 {
    if present >= n {
        return INFINITE_FAILURES;
    }
    let needed = n - present;
    if recoverable.len() < needed {
        return 0;
    }
    let mut failures: Vec<u32> = recoverable
        .iter()
        .map(|&c| tree.unit(c).state.min_failures)
        .collect();
    failures.sort_unstable();
    let j = recoverable.len() - needed + 1;
    failures
        .iter()
        .take(j)
        .fold(0u32, |acc, &f| acc.saturating_add(f))
}

fn sort_by_cost(tree: &CodingTree, units: &mut [UnitId]) {
    units.sort_by(|&a, &b| tree.unit(a).state.cost.total_cmp(&tree.unit(b).state.cost));
}

fn coding_n(tree: &CodingTree, id: UnitId) -> usize {
    let level = tree.unit(id).as_meta().map_or(0, |m| m.level);
    tree.policy().codings[level].n
}

/// Size of a unit from the policy's per-level sizes
pub fn unit_size(tree: &CodingTree, id: UnitId) -> f64 {
    let unit = tree.unit(id);
    if let Some(chunk) = unit.as_chunk() {
        return chunk.size;
    }
    let policy = tree.policy();
    match unit.path.len() {
        0 => policy
            .chunk_sizes
            .first()
            .map_or(0.0, |s| s * policy.codings[0].n as f64),
        depth => policy.chunk_sizes.get(depth - 1).copied().unwrap_or(0.0),
    }
}

/// Describe a unit for the transfer agent
pub fn unit_info(tree: &CodingTree, id: UnitId) -> UnitInfo {
    let unit = tree.unit(id);
    UnitInfo {
        name: unit.name.clone(),
        path: unit.path.clone(),
        id,
        size: unit_size(tree, id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::Policy;
    use crate::error::VdaError;
    use crate::storage::UnitState;

    /// Agent handing out fresh host ids and recording every request
    #[derive(Default)]
    struct RecordingAgent {
        next_host: HostId,
        host_limit: Option<HostId>,
        fail_choice: bool,
        downloads: Vec<(String, HostId)>,
        uploads: Vec<(String, HostId)>,
        deleted: Vec<String>,
        reconstructed: Vec<String>,
        materialized: Vec<String>,
    }

    impl TransferAgent for RecordingAgent {
        fn choose_host(&mut self, _now: f64) -> Result<Option<HostId>> {
            if self.fail_choice {
                return Err(VdaError::Store("db down".into()));
            }
            if self.host_limit.map_or(false, |l| self.next_host >= l) {
                return Ok(None);
            }
            self.next_host += 1;
            Ok(Some(self.next_host))
        }

        fn start_download(&mut self, chunk: &UnitInfo, host: HostId, _now: f64) -> Result<()> {
            self.downloads.push((chunk.name.clone(), host));
            Ok(())
        }

        fn start_upload(&mut self, chunk: &UnitInfo, host: HostId, _now: f64) -> Result<()> {
            self.uploads.push((chunk.name.clone(), host));
            Ok(())
        }

        fn delete_server_copy(&mut self, chunk: &UnitInfo, _now: f64) -> Result<()> {
            self.deleted.push(chunk.name.clone());
            Ok(())
        }

        fn reconstruct(&mut self, meta: &UnitInfo, _now: f64) -> Result<()> {
            self.reconstructed.push(meta.name.clone());
            Ok(())
        }

        fn chunk_materialized(&mut self, chunk: &UnitInfo, _now: f64) -> Result<()> {
            self.materialized.push(chunk.name.clone());
            Ok(())
        }
    }

    fn new_tree(policy: &str, file_size: f64) -> CodingTree {
        let mut policy = Policy::parse(policy).unwrap();
        policy.compute_chunk_sizes(file_size);
        let mut tree = CodingTree::build(policy);
        for id in tree.chunk_ids() {
            tree.chunk_mut(id).unwrap().present_on_server = true;
        }
        tree
    }

    fn finish_all_transfers(tree: &mut CodingTree) {
        for id in tree.chunk_ids() {
            let chunk = tree.chunk_mut(id).unwrap();
            let uploaded = chunk.placements.iter().any(|p| p.is_uploading());
            for p in chunk.placements.iter_mut() {
                p.finish_transfer();
            }
            if uploaded {
                chunk.present_on_server = true;
            }
        }
    }

    /// Archive a fresh single-level file until it rests on hosts only
    fn distributed_tree(agent: &mut RecordingAgent) -> CodingTree {
        let mut tree = new_tree("2 1 10 6 12", 10_000.0);
        recover(&mut tree, agent, 0.0, false).unwrap();
        finish_all_transfers(&mut tree);
        recover(&mut tree, agent, 1.0, false).unwrap();
        tree
    }

    fn snapshot(tree: &CodingTree) -> Vec<UnitState> {
        (0..tree.len()).map(|id| tree.unit(id).state.clone()).collect()
    }

    fn assert_status_consistent(tree: &CodingTree) {
        for id in 0..tree.len() {
            let state = &tree.unit(id).state;
            match state.status {
                Status::Present => assert_eq!(state.min_failures, INFINITE_FAILURES),
                Status::Unrecoverable => assert_eq!(state.min_failures, 0),
                Status::Recoverable => {
                    assert!(state.min_failures > 0 && state.min_failures < INFINITE_FAILURES)
                }
            }
        }
    }

    fn kill_host(tree: &mut CodingTree, host: HostId) {
        tree.remove_host(host);
    }

    fn hosts_of(tree: &CodingTree, name: &str) -> Vec<HostId> {
        let id = tree.find(name).unwrap();
        tree.chunk(id)
            .unwrap()
            .placements
            .iter()
            .map(|p| p.host_id)
            .collect()
    }

    #[test]
    fn test_plan_is_idempotent() {
        let mut agent = RecordingAgent::default();
        let mut tree = distributed_tree(&mut agent);
        let victim = hosts_of(&tree, "4")[0];
        kill_host(&mut tree, victim);

        recovery_plan(&mut tree);
        let first = snapshot(&tree);
        recovery_plan(&mut tree);
        assert_eq!(first, snapshot(&tree));
    }

    #[test]
    fn test_fresh_file_is_replicated() {
        let mut tree = new_tree("2 1 10 6 12", 10_000.0);
        let mut agent = RecordingAgent::default();
        let report = recover(&mut tree, &mut agent, 0.0, false).unwrap();

        assert_eq!(report.downloads_started, 32);
        assert_eq!(report.server_copies_deleted, 0);
        assert_eq!(tree.status(), Status::Present);
        for id in tree.chunk_ids() {
            assert_eq!(tree.chunk(id).unwrap().replica_count(), 2);
            assert!(tree.chunk(id).unwrap().present_on_server);
            assert!(tree.unit(id).state.data_needed);
        }
        assert_status_consistent(&tree);
    }

    #[test]
    fn test_server_copies_dropped_once_replicated() {
        let mut agent = RecordingAgent::default();
        let tree = distributed_tree(&mut agent);

        assert_eq!(agent.deleted.len(), 16);
        assert_eq!(tree.server_bytes(), 0.0);
        assert_eq!(tree.status(), Status::Recoverable);
        // 7 of 16 children must go, each needing 2 host failures
        assert_eq!(tree.unit(tree.root()).state.min_failures, 14);
        for id in tree.chunk_ids() {
            assert_eq!(tree.unit(id).state.min_failures, 2);
        }
        assert_status_consistent(&tree);
    }

    #[test]
    fn test_single_host_failure() {
        let mut agent = RecordingAgent::default();
        let mut tree = distributed_tree(&mut agent);
        let victim = hosts_of(&tree, "3")[0];
        kill_host(&mut tree, victim);

        let report = recover(&mut tree, &mut agent, 2.0, false).unwrap();
        let chunk = tree.find("3").unwrap();
        assert_eq!(tree.unit(chunk).state.status, Status::Recoverable);
        assert_eq!(tree.unit(chunk).state.min_failures, 1);
        assert_eq!(report.uploads_started, 1);
        assert_eq!(agent.uploads.last().unwrap().0, "3");
        assert_eq!(tree.status(), Status::Recoverable);
        assert_eq!(tree.unit(tree.root()).state.min_failures, 13);

        // upload lands, chunk gets a new replica, then leaves the server
        finish_all_transfers(&mut tree);
        let report = recover(&mut tree, &mut agent, 3.0, false).unwrap();
        assert_eq!(report.downloads_started, 1);
        assert_eq!(hosts_of(&tree, "3").len(), 2);
        assert_eq!(tree.unit(tree.root()).state.min_failures, 14);

        finish_all_transfers(&mut tree);
        let report = recover(&mut tree, &mut agent, 4.0, false).unwrap();
        assert_eq!(report.server_copies_deleted, 1);
        assert_eq!(tree.server_bytes(), 0.0);
        assert_status_consistent(&tree);
    }

    #[test]
    fn test_chunk_lost_with_last_replica() {
        let mut agent = RecordingAgent::default();
        let mut tree = distributed_tree(&mut agent);
        for host in hosts_of(&tree, "0") {
            kill_host(&mut tree, host);
        }

        recovery_plan(&mut tree);
        let chunk = tree.find("0").unwrap();
        assert_eq!(tree.unit(chunk).state.status, Status::Unrecoverable);
        assert_eq!(tree.unit(chunk).state.min_failures, 0);
        // 15 children left, still >= n = 10
        assert_eq!(tree.status(), Status::Recoverable);
        assert!(tree.unit(tree.root()).as_meta().unwrap().have_unrecoverable_children);
    }

    #[test]
    fn test_too_many_losses() {
        let mut agent = RecordingAgent::default();
        let mut tree = distributed_tree(&mut agent);
        // k + 1 = 7 chunks lose every replica
        for i in 0..7 {
            for host in hosts_of(&tree, &i.to_string()) {
                kill_host(&mut tree, host);
            }
        }

        let report = recover(&mut tree, &mut agent, 2.0, false).unwrap();
        assert_eq!(tree.status(), Status::Unrecoverable);
        assert!(tree.unit(tree.root()).as_meta().unwrap().have_unrecoverable_children);
        assert_eq!(report.uploads_started, 0);
        assert_status_consistent(&tree);
    }

    #[test]
    fn test_reconstruction_after_losses() {
        let mut agent = RecordingAgent::default();
        let mut tree = distributed_tree(&mut agent);
        for i in 0..6 {
            for host in hosts_of(&tree, &i.to_string()) {
                kill_host(&mut tree, host);
            }
        }

        // recoverable with lost children: fetch the n cheapest survivors
        let report = recover(&mut tree, &mut agent, 2.0, false).unwrap();
        assert_eq!(tree.status(), Status::Recoverable);
        assert_eq!(report.uploads_started, 10);
        let in_set = tree
            .children(tree.root())
            .iter()
            .filter(|&&c| tree.unit(c).state.in_recovery_set)
            .count();
        assert_eq!(in_set, 10);

        // uploads land: root is present, lost chunks are rebuilt
        finish_all_transfers(&mut tree);
        let report = recover(&mut tree, &mut agent, 3.0, false).unwrap();
        assert_eq!(agent.reconstructed, vec![String::new()]);
        assert_eq!(report.chunks_materialized, 6);
        assert_eq!(report.downloads_started, 12);
        for i in 0..6 {
            let id = tree.find(&i.to_string()).unwrap();
            assert_eq!(tree.unit(id).state.status, Status::Present);
            assert_eq!(tree.chunk(id).unwrap().replica_count(), 2);
        }
        assert_status_consistent(&tree);
    }

    #[test]
    fn test_cheapest_recovery_set() {
        // 4 metas of 3 chunks; any 3 metas rebuild the root
        let mut agent = RecordingAgent::default();
        let mut tree = new_tree("1 2 3 1 3 2 1 2", 6000.0);
        recover(&mut tree, &mut agent, 0.0, false).unwrap();
        finish_all_transfers(&mut tree);
        recover(&mut tree, &mut agent, 1.0, false).unwrap();
        assert_eq!(tree.server_bytes(), 0.0);

        // meta 1 needs one chunk back, meta 2 two, meta 3 two
        tree.chunk_mut(tree.find("1.0").unwrap()).unwrap().present_on_server = true;
        for name in ["0.0", "0.1"] {
            tree.chunk_mut(tree.find(name).unwrap()).unwrap().present_on_server = true;
        }
        recovery_plan(&mut tree);

        let root = tree.root();
        let chosen: Vec<String> = tree
            .children(root)
            .iter()
            .filter(|&&c| tree.unit(c).state.in_recovery_set)
            .map(|&c| tree.unit(c).name.clone())
            .collect();
        assert_eq!(chosen.len(), 3);
        assert!(chosen.contains(&"0".to_string()));
        assert!(chosen.contains(&"1".to_string()));

        let cost = |name: &str| tree.unit(tree.find(name).unwrap()).state.cost;
        assert_eq!(cost("0"), 0.0);
        assert_eq!(cost("1"), 1000.0);
        assert_eq!(cost("2"), 2000.0);
        assert_eq!(tree.unit(root).state.cost, 3000.0);
        for c in tree.children(root) {
            for other in tree.children(root) {
                let (a, b) = (&tree.unit(*c).state, &tree.unit(*other).state);
                if a.in_recovery_set && !b.in_recovery_set && b.status == a.status {
                    assert!(a.cost <= b.cost);
                }
            }
        }
    }

    #[test]
    fn test_present_children_chosen_by_cost() {
        let mut tree = new_tree("1 1 3 2 3", 3000.0);
        recovery_plan(&mut tree);
        let root = tree.root();
        let in_set = tree
            .children(root)
            .iter()
            .filter(|&&c| tree.unit(c).state.in_recovery_set)
            .count();
        assert_eq!(in_set, 3);
        assert_eq!(tree.unit(root).state.cost, 0.0);
        assert_eq!(tree.unit(root).state.status, Status::Present);
    }

    #[test]
    fn test_retrieve_brings_file_back() {
        let mut agent = RecordingAgent::default();
        let mut tree = distributed_tree(&mut agent);
        let report = recover(&mut tree, &mut agent, 2.0, true).unwrap();
        assert_eq!(report.uploads_started, 10);

        finish_all_transfers(&mut tree);
        let report = recover(&mut tree, &mut agent, 3.0, true).unwrap();
        assert_eq!(tree.status(), Status::Present);
        assert_eq!(report.server_copies_deleted, 0);
    }

    #[test]
    fn test_no_hosts_keeps_server_copy() {
        let mut tree = new_tree("2 1 4 2 4", 4000.0);
        let mut agent = RecordingAgent {
            host_limit: Some(3),
            ..Default::default()
        };
        let report = recover(&mut tree, &mut agent, 0.0, false).unwrap();
        assert_eq!(report.downloads_started, 3);
        assert_eq!(report.placements_skipped, 2 * 6 - 3);

        finish_all_transfers(&mut tree);
        let report = recover(&mut tree, &mut agent, 1.0, false).unwrap();
        // chunks without two host copies stay on the server
        assert_eq!(report.server_copies_deleted, 1);
        assert_eq!(tree.server_bytes(), 5.0 * 1000.0);
    }

    #[test]
    fn test_host_selection_error_is_not_fatal() {
        let mut tree = new_tree("2 1 4 2 4", 4000.0);
        let mut agent = RecordingAgent {
            fail_choice: true,
            ..Default::default()
        };
        let report = recover(&mut tree, &mut agent, 0.0, false).unwrap();
        assert_eq!(report.downloads_started, 0);
        assert_eq!(report.placements_skipped, 12);
        assert!(tree.server_bytes() > 0.0);
    }

    #[test]
    fn test_min_failures_guard() {
        let tree = new_tree("1 1 3 2 3", 3000.0);
        assert_eq!(min_failures_estimate(&tree, 0, &[], 3), 0);
        assert_eq!(min_failures_estimate(&tree, 3, &[], 3), INFINITE_FAILURES);
    }

    #[test]
    fn test_unit_sizes() {
        let tree = new_tree("2 2 3 1 3 2 1 2", 6000.0);
        assert_eq!(unit_size(&tree, tree.root()), 6000.0);
        assert_eq!(unit_size(&tree, tree.find("1").unwrap()), 2000.0);
        assert_eq!(unit_size(&tree, tree.find("1.1").unwrap()), 1000.0);
    }
}
