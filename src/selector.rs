//! Next-hop selector (C8): dual-mode (near strict / far cost-function) hop
//! choice with a backoff penalty.

use crate::ring::Coord;

/// A routable candidate: an id at a known ring coordinate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub coord: Coord,
}

/// Per-candidate signals the selector needs, supplied by the caller (which
/// in the service is backed by the Digitree, the connection state, and the
/// per-peer backoff map).
pub trait SelectorContext {
    fn is_connected(&self, id: &str) -> bool;
    /// Smoothed link quality in [0, 1]. Higher is better.
    fn link_quality(&self, id: &str) -> f64;
    /// Exponential backoff penalty in [0, 1]. Higher means more recently
    /// penalized (§4.11 "Per-peer backoff").
    fn backoff_penalty(&self, id: &str) -> f64;
}

fn leading_nonzero_byte_index(dist: &Coord) -> i32 {
    for (i, byte) in dist.as_bytes().iter().enumerate() {
        if *byte != 0 {
            return i as i32;
        }
    }
    32
}

struct Weights {
    w_d: f64,
    w_conn: f64,
    w_q: f64,
    w_b: f64,
}

fn weights_for(near: bool, confidence: f64) -> Weights {
    let (mut w_d, mut w_conn, w_q, w_b) = if near {
        (0.7, 0.1, 0.1, 0.1)
    } else {
        (0.4, 0.4, 0.1, 0.1)
    };
    let shift = (confidence - 0.5) * 0.2;
    w_d = (w_d + shift).max(0.1);
    w_conn = (w_conn - shift).max(0.05);
    Weights { w_d, w_conn, w_q, w_b }
}

fn cost(
    candidate: &Candidate,
    target: Coord,
    near: bool,
    confidence: f64,
    ctx: &dyn SelectorContext,
) -> f64 {
    let weights = weights_for(near, confidence);
    let dist = candidate.coord.xor_distance(&target);
    let norm_dist = candidate.coord.normalized_log_distance(&target);
    let connected = ctx.is_connected(&candidate.id);
    let link_q = ctx.link_quality(&candidate.id);
    let backoff = ctx.backoff_penalty(&candidate.id);
    let _ = dist;

    weights.w_d * norm_dist - weights.w_conn * (if connected { 1.0 } else { 0.0 }) - weights.w_q * link_q
        + weights.w_b * backoff
}

/// Select the next hop toward `target` out of `candidates`.
///
/// Supplying `near_radius` selects the cost-function mode (§4.8
/// "Cost-function mode"); omitting it selects the legacy mode retained for
/// testing (§4.8 "Legacy mode").
pub fn select_next_hop(
    candidates: &[Candidate],
    target: Coord,
    near_radius: Option<Coord>,
    confidence: f64,
    ctx: &dyn SelectorContext,
) -> Option<String> {
    match near_radius {
        Some(radius) => select_cost_function(candidates, target, radius, confidence, ctx),
        None => select_legacy(candidates, target, 1, ctx),
    }
}

fn select_cost_function(
    candidates: &[Candidate],
    target: Coord,
    near_radius: Coord,
    confidence: f64,
    ctx: &dyn SelectorContext,
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    let mut near: Vec<&Candidate> = Vec::new();
    let mut far: Vec<&Candidate> = Vec::new();
    for c in candidates {
        let dist = c.coord.xor_distance(&target);
        if dist.as_bytes() <= near_radius.as_bytes() {
            near.push(c);
        } else {
            far.push(c);
        }
    }

    if !near.is_empty() {
        near.sort_by(|a, b| {
            let da = a.coord.xor_distance(&target);
            let db = b.coord.xor_distance(&target);
            da.as_bytes()
                .cmp(db.as_bytes())
                .then_with(|| ctx.is_connected(&b.id).cmp(&ctx.is_connected(&a.id)))
                .then_with(|| {
                    let ca = cost(a, target, true, confidence, ctx);
                    let cb = cost(b, target, true, confidence, ctx);
                    ca.partial_cmp(&cb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });
        return Some(near[0].id.clone());
    }

    let mut far = far;
    far.sort_by(|a, b| {
        let ca = cost(a, target, false, confidence, ctx);
        let cb = cost(b, target, false, confidence, ctx);
        ca.partial_cmp(&cb)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let da = a.coord.xor_distance(&target);
                let db = b.coord.xor_distance(&target);
                da.as_bytes().cmp(db.as_bytes())
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    far.first().map(|c| c.id.clone())
}

fn select_legacy(
    candidates: &[Candidate],
    target: Coord,
    tolerance: i32,
    ctx: &dyn SelectorContext,
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    let best_by_dist = candidates
        .iter()
        .min_by(|a, b| {
            let da = a.coord.xor_distance(&target);
            let db = b.coord.xor_distance(&target);
            da.as_bytes()
                .cmp(db.as_bytes())
                .then_with(|| a.id.cmp(&b.id))
        })
        .unwrap();
    let best_index = leading_nonzero_byte_index(&best_by_dist.coord.xor_distance(&target));

    let connected_winner = candidates
        .iter()
        .filter(|c| ctx.is_connected(&c.id))
        .filter(|c| {
            let idx = leading_nonzero_byte_index(&c.coord.xor_distance(&target));
            idx >= best_index - tolerance
        })
        .min_by(|a, b| {
            let da = a.coord.xor_distance(&target);
            let db = b.coord.xor_distance(&target);
            da.as_bytes().cmp(db.as_bytes()).then_with(|| {
                let score_a = 1.0 + 0.25 * ctx.link_quality(&a.id);
                let score_b = 1.0 + 0.25 * ctx.link_quality(&b.id);
                score_b
                    .partial_cmp(&score_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });

    connected_winner
        .map(|c| c.id.clone())
        .or_else(|| Some(best_by_dist.id.clone()))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    struct Ctx {
        connected: HashMap<String, bool>,
        link_quality: HashMap<String, f64>,
        backoff: HashMap<String, f64>,
    }

    impl Default for Ctx {
        fn default() -> Self {
            Self {
                connected: HashMap::new(),
                link_quality: HashMap::new(),
                backoff: HashMap::new(),
            }
        }
    }

    impl SelectorContext for Ctx {
        fn is_connected(&self, id: &str) -> bool {
            *self.connected.get(id).unwrap_or(&false)
        }
        fn link_quality(&self, id: &str) -> f64 {
            *self.link_quality.get(id).unwrap_or(&0.0)
        }
        fn backoff_penalty(&self, id: &str) -> f64 {
            *self.backoff.get(id).unwrap_or(&0.0)
        }
    }

    fn coord(byte: u8) -> Coord {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        Coord::from_bytes(bytes)
    }

    #[test]
    fn test_legacy_picks_closest_when_none_connected() {
        let candidates = vec![
            Candidate { id: "a".into(), coord: coord(10) },
            Candidate { id: "b".into(), coord: coord(50) },
        ];
        let ctx = Ctx::default();
        let chosen = select_next_hop(&candidates, Coord::ZERO, None, 0.5, &ctx);
        assert_eq!(chosen, Some("a".into()));
    }

    #[test]
    fn test_legacy_prefers_connected_within_tolerance() {
        let candidates = vec![
            Candidate { id: "closest".into(), coord: coord(1) },
            Candidate { id: "connected".into(), coord: coord(2) },
        ];
        let mut ctx = Ctx::default();
        ctx.connected.insert("connected".into(), true);
        let chosen = select_next_hop(&candidates, Coord::ZERO, None, 0.5, &ctx);
        assert_eq!(chosen, Some("connected".into()));
    }

    #[test]
    fn test_legacy_falls_back_to_best_by_dist_when_no_connected_in_tolerance() {
        let candidates = vec![
            Candidate { id: "closest".into(), coord: coord(1) },
            Candidate { id: "far_connected".into(), coord: coord(200) },
        ];
        let mut ctx = Ctx::default();
        ctx.connected.insert("far_connected".into(), true);
        let chosen = select_next_hop(&candidates, Coord::ZERO, None, 0.5, &ctx);
        assert_eq!(chosen, Some("closest".into()));
    }

    #[test]
    fn test_cost_function_near_prefers_strict_distance_over_far_connected() {
        let candidates = vec![
            Candidate { id: "near".into(), coord: coord(1) },
            Candidate { id: "far_connected".into(), coord: coord(200) },
        ];
        let mut ctx = Ctx::default();
        ctx.connected.insert("far_connected".into(), true);
        let near_radius = coord(5);
        let chosen = select_next_hop(&candidates, Coord::ZERO, Some(near_radius), 0.5, &ctx);
        assert_eq!(chosen, Some("near".into()));
    }

    #[test]
    fn test_cost_function_far_mode_prefers_connected_lower_cost() {
        let candidates = vec![
            Candidate { id: "disconnected".into(), coord: coord(200) },
            Candidate { id: "connected".into(), coord: coord(210) },
        ];
        let mut ctx = Ctx::default();
        ctx.connected.insert("connected".into(), true);
        let near_radius = coord(5);
        let chosen = select_next_hop(&candidates, Coord::ZERO, Some(near_radius), 0.5, &ctx);
        assert_eq!(chosen, Some("connected".into()));
    }

    #[test]
    fn test_empty_candidates_returns_none() {
        let ctx = Ctx::default();
        assert_eq!(select_next_hop(&[], Coord::ZERO, None, 0.5, &ctx), None);
    }
}
