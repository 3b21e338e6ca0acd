//! Time-integrated statistics for simulation reports

use crate::Result;
use std::fs;
use std::path::Path;

/// Which extreme a statistic tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extreme {
    Max,
    Min,
}

/// A piecewise-constant quantity sampled over simulated time
#[derive(Debug, Clone)]
pub struct Stat {
    pub name: String,
    kind: Extreme,
    value: Option<f64>,
    start_time: f64,
    last_time: f64,
    integral: f64,
    extreme: Option<(f64, f64)>,
    samples: Vec<(f64, f64)>,
}

impl Stat {
    pub fn new(name: &str, kind: Extreme) -> Self {
        Self {
            name: name.to_string(),
            kind,
            value: None,
            start_time: 0.0,
            last_time: 0.0,
            integral: 0.0,
            extreme: None,
            samples: Vec::new(),
        }
    }

    /// Record that the value changed to `v` at time `t`
    pub fn sample(&mut self, v: f64, t: f64) {
        match self.value {
            Some(old) => self.integral += (t - self.last_time) * old,
            None => self.start_time = t,
        }
        self.value = Some(v);
        self.last_time = t;

        let better = match (self.extreme, self.kind) {
            (None, _) => true,
            (Some((e, _)), Extreme::Max) => v > e,
            (Some((e, _)), Extreme::Min) => v < e,
        };
        if better {
            self.extreme = Some((v, t));
        }
        self.samples.push((t, v));
    }

    /// Record a change by `dv`
    pub fn sample_inc(&mut self, dv: f64, t: f64) {
        let v = self.value.unwrap_or(0.0) + dv;
        self.sample(v, t);
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Time-weighted mean up to `now`
    pub fn mean(&self, now: f64) -> f64 {
        let Some(v) = self.value else {
            return 0.0;
        };
        let elapsed = now - self.start_time;
        if elapsed <= 0.0 {
            return v;
        }
        (self.integral + (now - self.last_time) * v) / elapsed
    }

    /// Extreme value and when it was reached
    pub fn extreme(&self) -> Option<(f64, f64)> {
        self.extreme
    }

    pub fn samples(&self) -> &[(f64, f64)] {
        &self.samples
    }

    /// Write `time value` lines to `<dir>/<name>.dat`
    pub fn write_dat(&self, dir: &Path) -> Result<()> {
        let text: String = self
            .samples
            .iter()
            .map(|(t, v)| format!("{} {}\n", t, v))
            .collect();
        fs::write(dir.join(format!("{}.dat", self.name)), text)?;
        Ok(())
    }

    /// One-line summary
    pub fn describe(&self, now: f64) -> String {
        let label = match self.kind {
            Extreme::Max => "max",
            Extreme::Min => "min",
        };
        match self.extreme {
            Some((e, t)) => format!(
                "{}: mean {:.3} {} {:.3} at {:.0}s",
                self.name,
                self.mean(now),
                label,
                e,
                t
            ),
            None => format!("{}: no samples", self.name),
        }
    }
}

/// Statistics kept for one simulated file
#[derive(Debug, Clone)]
pub struct FileStats {
    /// Bytes on the server
    pub disk_usage: Stat,
    /// Bytes/sec moving host -> server
    pub upload_rate: Stat,
    /// Bytes/sec moving server -> host
    pub download_rate: Stat,
    /// Host failures survivable without loss
    pub fault_tolerance: Stat,
}

impl FileStats {
    pub fn new() -> Self {
        Self {
            disk_usage: Stat::new("disk_usage", Extreme::Max),
            upload_rate: Stat::new("upload_rate", Extreme::Max),
            download_rate: Stat::new("download_rate", Extreme::Max),
            fault_tolerance: Stat::new("fault_tol", Extreme::Min),
        }
    }

    /// Write `summary.txt` and one `.dat` file per statistic
    pub fn write_reports(&self, dir: &Path, now: f64) -> Result<()> {
        fs::create_dir_all(dir)?;
        let min_ft = self.fault_tolerance.extreme().map_or(0.0, |(v, _)| v);
        let summary = format!(
            "{}\n{}\n{}\n{}\n",
            min_ft,
            self.disk_usage.mean(now),
            self.upload_rate.mean(now),
            self.download_rate.mean(now)
        );
        fs::write(dir.join("summary.txt"), summary)?;
        for stat in [
            &self.disk_usage,
            &self.upload_rate,
            &self.download_rate,
            &self.fault_tolerance,
        ] {
            stat.write_dat(dir)?;
        }
        Ok(())
    }
}

impl Default for FileStats {
    fn default() -> Self {
        Self::new()
    }
}
