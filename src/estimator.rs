//! Size & partition estimator (C4): weighted aggregation of self-observation
//! and externally reported network-size observations, churn rate, and
//! partition detection.

use std::collections::VecDeque;

const MAX_OBSERVATIONS: usize = 100;
const WINDOW_MS: u64 = 5 * 60 * 1000;
const STALE_AGE_MS: u64 = 30_000;
const MIN_OBSERVATIONS_FOR_PARTITION: usize = 10;
const PARTITION_DROP_RATIO: f64 = 0.5;
const PARTITION_MIN_CONFIDENCE: f64 = 0.3;
const PARTITION_CHURN_RATIO_PER_MIN: f64 = 0.1;

/// Where a size estimate observation came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// Derived from the spacing of this node's own S/P set.
    SelfObservation,
    /// Reported by a remote peer (ping / snapshot reply).
    Peer(String),
}

#[derive(Debug, Clone)]
struct Observation {
    estimate: f64,
    confidence: f64,
    timestamp_ms: u64,
    source: Source,
}

/// A weighted network-size estimate with aggregate confidence and the
/// number of observations that contributed to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkSizeEstimate {
    pub estimate: u64,
    pub confidence: f64,
    pub sources: usize,
}

impl Default for NetworkSizeEstimate {
    fn default() -> Self {
        Self {
            estimate: 1,
            confidence: 0.0,
            sources: 0,
        }
    }
}

/// Ring buffer of size observations, capped at 100 entries and aged out
/// after 5 minutes (§4.4).
#[derive(Debug, Default)]
pub struct Estimator {
    observations: VecDeque<Observation>,
}

impl Estimator {
    pub fn new() -> Self {
        Self::default()
    }

    fn evict_stale(&mut self, now_ms: u64) {
        while let Some(front) = self.observations.front() {
            if now_ms.saturating_sub(front.timestamp_ms) > WINDOW_MS {
                self.observations.pop_front();
            } else {
                break;
            }
        }
        while self.observations.len() > MAX_OBSERVATIONS {
            self.observations.pop_front();
        }
    }

    /// Append one observation.
    pub fn report_network_size(
        &mut self,
        estimate: f64,
        confidence: f64,
        source: Option<Source>,
        now_ms: u64,
    ) {
        self.evict_stale(now_ms);
        self.observations.push_back(Observation {
            estimate,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp_ms: now_ms,
            source: source.unwrap_or(Source::SelfObservation),
        });
        self.evict_stale(now_ms);
    }

    /// Self-estimate derived from the spacing of the local S/P set: the
    /// denser the local band, the larger the inferred network. `span` is
    /// the normalized distance (in [0,1]) spanned by the local S/P set;
    /// `count` is the number of members in it.
    pub fn self_estimate_from_spacing(span: f64, count: usize) -> f64 {
        if span <= 0.0 || count == 0 {
            return 1.0;
        }
        (count as f64 / span).max(1.0)
    }

    /// Combine the self-estimate and all external observations, weighted by
    /// `exp(-age / (window/3)) * confidence` (§4.4).
    pub fn get_network_size_estimate(
        &mut self,
        self_estimate: Option<f64>,
        now_ms: u64,
    ) -> NetworkSizeEstimate {
        self.evict_stale(now_ms);

        let decay = WINDOW_MS as f64 / 3.0;
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut confidence_total = 0.0;
        let mut sources = 0usize;

        let mut all: Vec<Observation> = self.observations.iter().cloned().collect();
        if let Some(se) = self_estimate {
            all.push(Observation {
                estimate: se,
                confidence: 1.0,
                timestamp_ms: now_ms,
                source: Source::SelfObservation,
            });
        }

        for obs in &all {
            let age = now_ms.saturating_sub(obs.timestamp_ms) as f64;
            let weight = (-age / decay).exp() * obs.confidence;
            if weight <= 0.0 {
                continue;
            }
            weighted_sum += obs.estimate * weight;
            weight_total += weight;
            confidence_total += obs.confidence;
            sources += 1;
        }

        if weight_total <= 0.0 || sources == 0 {
            return NetworkSizeEstimate::default();
        }

        let estimate = (weighted_sum / weight_total).round().max(1.0) as u64;
        let confidence = (confidence_total / sources as f64).clamp(0.0, 1.0);

        NetworkSizeEstimate {
            estimate,
            confidence,
            sources,
        }
    }

    /// Slope of the mean estimate between the older and newer halves of the
    /// observation window, in peers per minute (§4.4).
    pub fn get_network_churn(&self) -> f64 {
        let n = self.observations.len();
        if n < 2 {
            return 0.0;
        }
        let mid = n / 2;
        let older: Vec<&Observation> = self.observations.iter().take(mid).collect();
        let newer: Vec<&Observation> = self.observations.iter().skip(mid).collect();
        if older.is_empty() || newer.is_empty() {
            return 0.0;
        }
        let mean = |xs: &[&Observation]| xs.iter().map(|o| o.estimate).sum::<f64>() / xs.len() as f64;
        let mean_old = mean(&older);
        let mean_new = mean(&newer);

        let t_old = older.iter().map(|o| o.timestamp_ms).sum::<u64>() as f64 / older.len() as f64;
        let t_new = newer.iter().map(|o| o.timestamp_ms).sum::<u64>() as f64 / newer.len() as f64;
        let minutes = ((t_new - t_old).max(1.0)) / 60_000.0;

        (mean_new - mean_old) / minutes
    }

    /// True when the current weighted estimate has dropped below half the
    /// mean of the last five observations older than 30s (and confidence
    /// is high enough to trust the drop), or when absolute churn exceeds
    /// 10% of the current estimate per minute. Fewer than 10 observations
    /// always returns false (§4.4).
    pub fn detect_partition(&mut self, self_estimate: Option<f64>, now_ms: u64) -> bool {
        self.evict_stale(now_ms);
        if self.observations.len() < MIN_OBSERVATIONS_FOR_PARTITION {
            return false;
        }

        let current = self.get_network_size_estimate(self_estimate, now_ms);

        let older: Vec<&Observation> = self
            .observations
            .iter()
            .filter(|o| now_ms.saturating_sub(o.timestamp_ms) > STALE_AGE_MS)
            .rev()
            .take(5)
            .collect();

        let dropped = if older.len() >= 1 {
            let mean_recent_old =
                older.iter().map(|o| o.estimate).sum::<f64>() / older.len() as f64;
            mean_recent_old > 0.0
                && (current.estimate as f64) < mean_recent_old * PARTITION_DROP_RATIO
                && current.confidence >= PARTITION_MIN_CONFIDENCE
        } else {
            false
        };

        let churn = self.get_network_churn();
        let churn_excessive =
            current.estimate > 0 && churn.abs() > (current.estimate as f64) * PARTITION_CHURN_RATIO_PER_MIN;

        dropped || churn_excessive
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_no_observations_returns_default() {
        let mut e = Estimator::new();
        let est = e.get_network_size_estimate(None, 0);
        assert_eq!(est.sources, 0);
    }

    #[test]
    fn test_weighted_mean_combines_sources() {
        let mut e = Estimator::new();
        e.report_network_size(100.0, 1.0, Some(Source::Peer("a".into())), 0);
        e.report_network_size(200.0, 1.0, Some(Source::Peer("b".into())), 0);
        let est = e.get_network_size_estimate(None, 0);
        assert_eq!(est.sources, 2);
        assert!((140..=160).contains(&est.estimate));
    }

    #[test]
    fn test_stale_observations_age_out() {
        let mut e = Estimator::new();
        e.report_network_size(100.0, 1.0, None, 0);
        let est = e.get_network_size_estimate(None, WINDOW_MS + 1);
        assert_eq!(est.sources, 0);
    }

    #[test]
    fn test_capacity_capped_at_100() {
        let mut e = Estimator::new();
        for i in 0..150 {
            e.report_network_size(i as f64, 1.0, None, i as u64);
        }
        assert!(e.observations.len() <= MAX_OBSERVATIONS);
    }

    #[test]
    fn test_fewer_than_10_observations_never_partitions() {
        let mut e = Estimator::new();
        for i in 0..9 {
            e.report_network_size(1000.0, 1.0, None, i * 1000);
        }
        assert!(!e.detect_partition(None, 9000));
    }

    #[test]
    fn test_partition_detected_on_sharp_churn() {
        let mut e = Estimator::new();
        // Ten observations, ten seconds apart, declining sharply from 1000 to 100.
        for i in 0..10u64 {
            let value = 1000.0 - i as f64 * 100.0;
            e.report_network_size(value, 1.0, None, i * 10_000);
        }
        assert!(e.detect_partition(None, 90_000));
    }

    #[test]
    fn test_no_partition_on_stable_network() {
        let mut e = Estimator::new();
        for i in 0..15 {
            e.report_network_size(1000.0, 0.8, None, i * 10_000);
        }
        assert!(!e.detect_partition(None, 150_000));
    }

    #[test]
    fn test_self_estimate_from_spacing() {
        assert_eq!(Estimator::self_estimate_from_spacing(0.0, 5), 1.0);
        assert!(Estimator::self_estimate_from_spacing(0.5, 5) > 1.0);
    }
}
