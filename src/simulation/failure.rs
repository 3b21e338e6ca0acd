//! Host population churn
//!
//! Volunteer hosts join and leave. Lifetimes are exponential; arrivals
//! form a Poisson process sized so the population stays near its
//! starting count.

use rand::rngs::StdRng;
use rand::Rng;

/// Random draws for host behaviour
#[derive(Debug, Clone, Copy)]
pub struct ChurnModel {
    /// Mean host lifetime in seconds; infinite means hosts never leave
    pub host_life_mean: f64,
    /// Mean wait before a host connects to start a transfer
    pub connect_interval: f64,
    /// Mean per-host transfer rate, bytes/sec
    pub mean_xfer_rate: f64,
    /// Target population
    pub num_hosts: usize,
}

impl ChurnModel {
    /// Whether hosts ever leave
    pub fn has_departures(&self) -> bool {
        self.host_life_mean.is_finite()
    }

    /// Lifetime of a newly joined host, `None` if it never leaves
    pub fn sample_lifetime(&self, rng: &mut StdRng) -> Option<f64> {
        self.has_departures()
            .then(|| exponential(rng, self.host_life_mean))
    }

    /// Time until the next host joins, `None` without churn
    pub fn sample_interarrival(&self, rng: &mut StdRng) -> Option<f64> {
        if !self.has_departures() || self.num_hosts == 0 {
            return None;
        }
        Some(exponential(rng, self.host_life_mean / self.num_hosts as f64))
    }

    /// Transfer rate of a new host, uniform in [0.5, 1.5] x mean
    pub fn sample_xfer_rate(&self, rng: &mut StdRng) -> f64 {
        self.mean_xfer_rate * rng.gen_range(0.5..1.5)
    }

    /// Delay before a requested transfer starts
    pub fn sample_connect_delay(&self, rng: &mut StdRng) -> f64 {
        if self.connect_interval <= 0.0 {
            return 0.0;
        }
        rng.gen_range(0.0..self.connect_interval)
    }
}

/// Exponentially distributed sample by inversion
pub fn exponential(rng: &mut StdRng, mean: f64) -> f64 {
    let u: f64 = rng.gen();
    -mean * (1.0 - u).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn model(host_life_mean: f64) -> ChurnModel {
        ChurnModel {
            host_life_mean,
            connect_interval: 100.0,
            mean_xfer_rate: 1e6,
            num_hosts: 50,
        }
    }

    #[test]
    fn test_exponential_mean() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 20_000;
        let total: f64 = (0..n).map(|_| exponential(&mut rng, 10.0)).sum();
        let mean = total / n as f64;
        assert!((mean - 10.0).abs() < 0.5, "mean was {}", mean);
    }

    #[test]
    fn test_no_churn_with_infinite_lifetime() {
        let churn = model(f64::INFINITY);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(!churn.has_departures());
        assert_eq!(churn.sample_lifetime(&mut rng), None);
        assert_eq!(churn.sample_interarrival(&mut rng), None);
    }

    #[test]
    fn test_rates_and_delays_in_range() {
        let churn = model(1e6);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..1000 {
            let rate = churn.sample_xfer_rate(&mut rng);
            assert!((5e5..1.5e6).contains(&rate));
            let delay = churn.sample_connect_delay(&mut rng);
            assert!((0.0..100.0).contains(&delay));
            assert!(churn.sample_lifetime(&mut rng).unwrap() >= 0.0);
        }
    }
}
