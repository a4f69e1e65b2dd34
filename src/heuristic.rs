//! Payload heuristic (C7): near-radius computation and the "include payload
//! now?" decision used by the client-side iterative lookup and the
//! server-side forwarding path.

use crate::ring::Coord;

/// `min(beta * k * (2^256 / max(1, round(n))), 2^256 - 1)`. Collapses to
/// zero when `size_estimate < 1` (§4.7).
pub fn compute_near_radius(size_estimate: f64, k: usize, beta: u64) -> Coord {
    if size_estimate < 1.0 {
        return Coord::ZERO;
    }
    let n = size_estimate.round().max(1.0) as u64;
    let unit = Coord::MAX.div_u64(n);
    unit.saturating_mul_u64(beta * k as u64)
}

/// Linear-probability decision of whether to include the activity payload
/// in this forward, given the 256-bit distance to the key (§4.7).
pub fn should_include_payload(
    dist_to_key: &Coord,
    size_estimate: f64,
    confidence: f64,
    k: usize,
    beta: u64,
    threshold: f64,
) -> bool {
    if size_estimate < 1.0 || confidence <= 0.0 {
        return false;
    }
    let n = size_estimate.round().max(1.0) as u64;
    let near_zone = Coord::MAX.div_u64(n).saturating_mul_u64(beta * k as u64);

    if near_zone == Coord::ZERO {
        return false;
    }

    // p = (nearZone - distToKey) / nearZone, clamped >= 0. Both quantities
    // are 256-bit unsigned integers; compare via the bytes directly to
    // avoid floating-point loss, then express the ratio in f64 only for the
    // final probability.
    let p = if dist_to_key.as_bytes() >= near_zone.as_bytes() {
        0.0
    } else {
        ratio(near_zone, *dist_to_key, near_zone)
    };

    p * confidence >= threshold
}

/// Computes `(numerator_a - numerator_b) / denominator` for 256-bit
/// unsigned values, as an f64 in [0, 1]. Only the leading 16 bytes are used
/// for the floating-point approximation, which is more than enough
/// precision for a probability threshold comparison.
fn ratio(a: Coord, b: Coord, denom: Coord) -> f64 {
    let to_f64 = |c: &Coord| -> f64 {
        let mut v = 0.0f64;
        for &byte in c.as_bytes().iter().take(16) {
            v = v * 256.0 + byte as f64;
        }
        v
    };
    let an = to_f64(&a);
    let bn = to_f64(&b);
    let dn = to_f64(&denom);
    if dn <= 0.0 {
        return 0.0;
    }
    ((an - bn) / dn).clamp(0.0, 1.0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_near_radius_zero_below_one_peer() {
        assert_eq!(compute_near_radius(0.5, 8, 2), Coord::ZERO);
    }

    #[test]
    fn test_near_radius_scales_with_k() {
        let small = compute_near_radius(1000.0, 1, 2);
        let big = compute_near_radius(1000.0, 8, 2);
        assert!(small.lex_less(&big));
    }

    #[test]
    fn test_should_include_payload_false_below_one_peer() {
        assert!(!should_include_payload(&Coord::ZERO, 0.5, 1.0, 8, 2, 0.5));
    }

    #[test]
    fn test_should_include_payload_false_zero_confidence() {
        assert!(!should_include_payload(&Coord::ZERO, 1000.0, 0.0, 8, 2, 0.5));
    }

    #[test]
    fn test_should_include_payload_true_when_very_close() {
        // Distance 0 is always inside the near zone, confidence 1.
        assert!(should_include_payload(&Coord::ZERO, 1000.0, 1.0, 8, 2, 0.5));
    }

    #[test]
    fn test_should_include_payload_false_when_far() {
        assert!(!should_include_payload(&Coord::MAX, 1000.0, 1.0, 8, 2, 0.5));
    }
}
