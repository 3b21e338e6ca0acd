//! Canned simulation runs
//!
//! Each scenario runs a churn-free simulation, applies a scripted
//! disturbance and reports whether the archive healed.

use crate::host::HostId;
use crate::simulation::{SimConfig, Simulation};
use crate::storage::Status;
use crate::Result;
use std::str::FromStr;

/// Scripted runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Distribute a fresh file and check every chunk reaches its replication
    ReplicationConvergence,
    /// Kill one host after distribution and watch the chunk re-replicate
    SingleHostFailure,
    /// Lose as many chunks as the code tolerates and rebuild them
    Reconstruction,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [
        Scenario::ReplicationConvergence,
        Scenario::SingleHostFailure,
        Scenario::Reconstruction,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::ReplicationConvergence => "convergence",
            Scenario::SingleHostFailure => "single-failure",
            Scenario::Reconstruction => "reconstruction",
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scenario::ReplicationConvergence => write!(f, "Replication Convergence"),
            Scenario::SingleHostFailure => write!(f, "Single Host Failure"),
            Scenario::Reconstruction => write!(f, "Reconstruction"),
        }
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|sc| sc.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Scenario::ALL.iter().map(|sc| sc.name()).collect();
                format!("unknown scenario '{}' (expected one of {})", s, names.join(", "))
            })
    }
}

/// Result of a scenario run
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub scenario: Scenario,
    pub log: Vec<String>,
    pub passed: bool,
}

/// Run a scenario on top of `base`; churn is switched off
pub fn run_scenario(scenario: Scenario, base: &SimConfig) -> Result<ScenarioOutcome> {
    let config = SimConfig {
        host_life_mean: f64::INFINITY,
        num_files: 1,
        ..base.clone()
    };
    let mut log = vec![format!("=== {} ===", scenario)];
    let mut sim = Simulation::new(config)?;
    log.push(format!(
        "Archived {} bytes on {} hosts with policy {}",
        sim.config().file_size,
        sim.hosts_alive(),
        sim.config().policy.description
    ));

    let settle = sim.config().duration;
    sim.run_until(settle);
    let mut passed = report_health(&sim, &mut log);

    match scenario {
        Scenario::ReplicationConvergence => {}
        Scenario::SingleHostFailure => {
            let Some(victim) = sim.kill_random_host() else {
                log.push("✗ No host holds any chunk".to_string());
                return Ok(finish(scenario, log, false));
            };
            log.push(format!("⚠ Host {} failed", victim));
            log_fault_tolerance(&sim, &mut log);
            sim.step(settle);
            passed &= report_health(&sim, &mut log);
        }
        Scenario::Reconstruction => {
            let victims = hosts_of_first_chunks(&sim);
            for &host in &victims {
                sim.kill_host(host);
            }
            log.push(format!(
                "⚠ {} hosts failed, every replica of {} chunks lost",
                victims.len(),
                sim.config().policy.codings[0].k
            ));
            log_fault_tolerance(&sim, &mut log);
            sim.step(settle);
            passed &= report_health(&sim, &mut log);
        }
    }

    Ok(finish(scenario, log, passed))
}

fn finish(scenario: Scenario, mut log: Vec<String>, passed: bool) -> ScenarioOutcome {
    log.push(if passed {
        "✓ Scenario passed".to_string()
    } else {
        "✗ Scenario failed".to_string()
    });
    ScenarioOutcome {
        scenario,
        log,
        passed,
    }
}

/// Every host holding a replica of the first `k` chunks, where `k` is
/// the number of losses the top-level code tolerates
fn hosts_of_first_chunks(sim: &Simulation) -> Vec<HostId> {
    let Some(file) = sim.files().next() else {
        return Vec::new();
    };
    let losses = file.tree.policy().codings[0].k;
    file.tree
        .chunk_ids()
        .into_iter()
        .take(losses)
        .filter_map(|id| file.tree.chunk(id).ok())
        .flat_map(|c| c.placements.iter().map(|p| p.host_id))
        .collect()
}

fn log_fault_tolerance(sim: &Simulation, log: &mut Vec<String>) {
    if let Some(file) = sim.files().next() {
        log.push(format!(
            "  status {} fault tolerance {}",
            file.status(),
            file.fault_tolerance()
                .map_or_else(|| "unbounded".to_string(), |ft| ft.to_string())
        ));
    }
}

/// Log the state of the file; true if it is fully distributed
fn report_health(sim: &Simulation, log: &mut Vec<String>) -> bool {
    let Some(file) = sim.files().next() else {
        return false;
    };
    let (host_copies, on_server) = file.replica_counts();
    log.push(format!(
        "t={:.0}s: {} replicas on hosts, {} chunks on server, {} under-replicated",
        sim.now(),
        host_copies,
        on_server,
        file.under_replicated()
    ));
    log_fault_tolerance(sim, log);

    let healthy = file.status() == Status::Recoverable
        && file.under_replicated() == 0
        && on_server == 0
        && !file.lost;
    if healthy {
        log.push("✓ File fully distributed".to_string());
    } else {
        log.push("✗ File not fully distributed".to_string());
    }
    healthy
}
