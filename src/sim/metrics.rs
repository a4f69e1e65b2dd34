//! Simulation metrics collector: joins, leaves, stabilization cycles,
//! coverage time series, dead-neighbor ratio, routing attempts/successes
//! and hop counts (§4.12, feeding P8 and scenarios 6-8 of §8).

#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub joins: u64,
    pub leaves: u64,
    pub stabilize_cycles: u64,
    pub coverage_samples: Vec<f64>,
    pub dead_neighbor_samples: Vec<f64>,
    pub route_attempts: u64,
    pub route_successes: u64,
    pub route_hops: Vec<usize>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_join(&mut self) {
        self.joins += 1;
    }

    pub fn record_leave(&mut self) {
        self.leaves += 1;
    }

    pub fn record_stabilize(&mut self, coverage: f64, dead_neighbor_ratio: f64) {
        self.stabilize_cycles += 1;
        self.coverage_samples.push(coverage);
        self.dead_neighbor_samples.push(dead_neighbor_ratio);
    }

    pub fn record_route(&mut self, hops: Option<usize>) {
        self.route_attempts += 1;
        if let Some(h) = hops {
            self.route_successes += 1;
            self.route_hops.push(h);
        }
    }

    pub fn route_success_rate(&self) -> f64 {
        if self.route_attempts == 0 {
            return 1.0;
        }
        self.route_successes as f64 / self.route_attempts as f64
    }

    pub fn mean_coverage(&self) -> f64 {
        mean(&self.coverage_samples)
    }

    pub fn mean_dead_neighbor_ratio(&self) -> f64 {
        mean(&self.dead_neighbor_samples)
    }

    pub fn max_hops(&self) -> Option<usize> {
        self.route_hops.iter().copied().max()
    }

    pub fn mean_hops(&self) -> f64 {
        if self.route_hops.is_empty() {
            return 0.0;
        }
        self.route_hops.iter().sum::<usize>() as f64 / self.route_hops.len() as f64
    }
}

fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_route_success_rate_with_no_attempts_is_one() {
        assert_eq!(Metrics::new().route_success_rate(), 1.0);
    }

    #[test]
    fn test_route_success_rate_tracks_failures() {
        let mut m = Metrics::new();
        m.record_route(Some(3));
        m.record_route(None);
        assert_eq!(m.route_success_rate(), 0.5);
        assert_eq!(m.max_hops(), Some(3));
    }

    #[test]
    fn test_mean_coverage_averages_samples() {
        let mut m = Metrics::new();
        m.record_stabilize(1.0, 0.0);
        m.record_stabilize(0.5, 0.2);
        assert_eq!(m.stabilize_cycles, 2);
        assert!((m.mean_coverage() - 0.75).abs() < 1e-9);
        assert!((m.mean_dead_neighbor_ratio() - 0.1).abs() < 1e-9);
    }
}
