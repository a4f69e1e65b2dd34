//! Relevance model (C3): per-entry keep-score and the sparsity model that
//! feeds it.

use crate::digitree::PeerEntry;

/// Lower bound on relevance: keeps failing peers from drifting to `-inf`.
pub const MIN_RELEVANCE: f64 = -10.0;
/// Upper bound on relevance: keeps hot peers from overflowing.
pub const MAX_RELEVANCE: f64 = 100.0;

const TOUCH_BASE: f64 = 0.05;
const SUCCESS_BASE: f64 = 0.5;
const FAILURE_BASE: f64 = 0.5;
const LATENCY_EMA_ALPHA: f64 = 0.2;
/// Latency, in ms, below which a peer is considered "fast" for the purposes
/// of the success-nudge scaling.
const FAST_LATENCY_MS: f64 = 50.0;

const SPARSITY_BANDS: usize = 32;
const SPARSITY_EMA_ALPHA: f64 = 0.1;

/// Tracks an exponential moving average of observed peer density per
/// logarithmic-distance band, so that underrepresented long-range bands are
/// retained preferentially (§4.3).
#[derive(Debug, Clone)]
pub struct SparsityModel {
    /// EMA of density per band, seeded uniform so early observations don't
    /// produce an extreme bonus.
    density: [f64; SPARSITY_BANDS],
}

impl Default for SparsityModel {
    fn default() -> Self {
        Self {
            density: [1.0 / SPARSITY_BANDS as f64; SPARSITY_BANDS],
        }
    }
}

impl SparsityModel {
    fn band_of(x: f64) -> usize {
        let x = x.clamp(0.0, 1.0);
        ((x * SPARSITY_BANDS as f64) as usize).min(SPARSITY_BANDS - 1)
    }

    /// Record an observation of a peer at normalized distance `x`.
    pub fn observe(&mut self, x: f64) {
        let band = Self::band_of(x);
        for (i, d) in self.density.iter_mut().enumerate() {
            let hit = if i == band { 1.0 } else { 0.0 };
            *d = *d * (1.0 - SPARSITY_EMA_ALPHA) + hit * SPARSITY_EMA_ALPHA;
        }
    }

    /// Sparsity bonus at normalized distance `x`: inversely proportional to
    /// that band's density, so sparse bands get a bigger bump.
    pub fn bonus(&self, x: f64) -> f64 {
        let band = Self::band_of(x);
        let density = self.density[band].max(1e-6);
        (1.0 / (density * SPARSITY_BANDS as f64)).min(4.0)
    }
}

/// Increment `accessCount`, update `lastAccess`, nudge relevance upward by a
/// bounded amount that includes the sparsity bonus at `x` (§4.3).
pub fn touch(entry: &mut PeerEntry, x: f64, sparsity: &mut SparsityModel, now_ms: u64) {
    entry.access_count += 1;
    entry.last_access = now_ms;
    sparsity.observe(x);
    let bump = TOUCH_BASE * (1.0 + sparsity.bonus(x));
    entry.relevance = (entry.relevance + bump).clamp(MIN_RELEVANCE, MAX_RELEVANCE);
}

/// Increment `successCount`, EMA-update `avgLatencyMs`, apply a positive
/// nudge scaled up for faster peers (§4.3).
pub fn record_success(
    entry: &mut PeerEntry,
    latency_ms: f64,
    x: f64,
    sparsity: &mut SparsityModel,
) {
    entry.success_count += 1;
    entry.avg_latency_ms = if entry.avg_latency_ms <= 0.0 {
        latency_ms
    } else {
        entry.avg_latency_ms * (1.0 - LATENCY_EMA_ALPHA) + latency_ms * LATENCY_EMA_ALPHA
    };
    sparsity.observe(x);
    let speed_factor = (FAST_LATENCY_MS / entry.avg_latency_ms.max(1.0)).clamp(0.25, 4.0);
    let bump = SUCCESS_BASE * speed_factor * (1.0 + sparsity.bonus(x));
    entry.relevance = (entry.relevance + bump).clamp(MIN_RELEVANCE, MAX_RELEVANCE);
}

/// Increment `failureCount`, apply a negative nudge proportional to the
/// peer's current success ratio (§4.3).
pub fn record_failure(entry: &mut PeerEntry, _x: f64) {
    entry.failure_count += 1;
    let total = (entry.success_count + entry.failure_count) as f64;
    let success_ratio = if total > 0.0 {
        entry.success_count as f64 / total
    } else {
        0.0
    };
    let penalty = FAILURE_BASE * success_ratio;
    entry.relevance = (entry.relevance - penalty).clamp(MIN_RELEVANCE, MAX_RELEVANCE);
}
