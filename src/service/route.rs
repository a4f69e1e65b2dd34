//! Route pipeline (C11): cohort assembly, `handleMaybeAct`, `routeAct`, and
//! the client-side `iterativeLookup` progress stream.

use std::collections::HashSet;

use log::debug;

use crate::digitree::{Digitree, PeerEntry};
use crate::heuristic::{compute_near_radius, should_include_payload};
use crate::relevance::{self, SparsityModel};
use crate::ring::Coord;
use crate::selector::{select_next_hop, Candidate, SelectorContext};
use crate::service::config::coord_of;
use crate::service::message::{BusyResponse, MaybeActResponse, NearAnchor, RouteAndMaybeAct};

/// Derive the cohort responsible for `coord`: alternating right/left walks,
/// merged by XOR distance to `coord`, deduplicated by id (glossary
/// "Cohort"; P2 "Monotone cohort").
pub fn assemble_cohort(tree: &Digitree, coord: Coord, wants: usize) -> Vec<PeerEntry> {
    if wants == 0 {
        return Vec::new();
    }
    let mut seen = HashSet::new();
    let mut candidates: Vec<PeerEntry> = Vec::new();
    for e in tree
        .neighbors_right(coord, wants)
        .into_iter()
        .chain(tree.neighbors_left(coord, wants))
    {
        if seen.insert(e.id.clone()) {
            candidates.push(e.clone());
        }
    }
    candidates.sort_by(|a, b| {
        let da = a.coord.xor_distance(&coord);
        let db = b.coord.xor_distance(&coord);
        da.as_bytes()
            .cmp(db.as_bytes())
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates.truncate(wants);
    candidates
}

/// Index of `self_id` within `assembleCohort(coord, want_k)`, or `None` if
/// absent (§4.11 "In-cluster test").
pub fn neighbor_distance(
    tree: &Digitree,
    self_id: &str,
    coord: Coord,
    want_k: usize,
) -> Option<usize> {
    assemble_cohort(tree, coord, want_k)
        .iter()
        .position(|e| e.id == self_id)
}

/// Exponential backoff: factor doubles from 1 up to 32, in units of 1s
/// (§4.11 "Per-peer backoff").
#[derive(Debug, Clone, Copy, Default)]
pub struct Backoff {
    factor: u32,
    expires_at_ms: u64,
}

impl Backoff {
    pub const BASE_MS: u64 = 1000;
    pub const MAX_FACTOR: u32 = 32;

    pub fn bump(&mut self, now_ms: u64) {
        self.factor = (self.factor.max(1) * 2).min(Self::MAX_FACTOR);
        self.expires_at_ms = now_ms + Self::BASE_MS * self.factor as u64;
    }

    pub fn clear(&mut self) {
        self.factor = 0;
        self.expires_at_ms = 0;
    }

    /// `factor / 32`, or 0 once the backoff window has expired.
    pub fn penalty(&self, now_ms: u64) -> f64 {
        if now_ms >= self.expires_at_ms {
            0.0
        } else {
            self.factor as f64 / Self::MAX_FACTOR as f64
        }
    }
}

/// Outcome of attempting to deliver a message to one peer, supplied by the
/// host runtime caller of [`route_act`] (the send itself is out of scope
/// here; see §1 capability 1).
pub enum SendOutcome {
    Success { latency_ms: f64 },
    Busy,
    Error,
}

/// Everything `route_act` needs from the caller beyond the Digitree: who is
/// connected, link quality, backoff state, and a way to actually attempt a
/// forward.
pub trait RouteContext: SelectorContext {
    fn backoff_mut(&mut self, id: &str) -> &mut Backoff;
    /// Attempt to forward `msg` (already decremented/breadcrumbed by the
    /// caller) to `id`. Returns `None` if the host runtime itself could not
    /// reach the peer (§7 "transient peer fault", logged, never thrown).
    fn send_maybe_act(&mut self, id: &str, msg: &RouteAndMaybeAct) -> Option<SendOutcome>;
}

/// Narrows a `&dyn RouteContext` down to its `SelectorContext` surface
/// without relying on trait-object upcasting.
struct RouteCtxAsSelector<'a>(&'a dyn RouteContext);

impl<'a> SelectorContext for RouteCtxAsSelector<'a> {
    fn is_connected(&self, id: &str) -> bool {
        self.0.is_connected(id)
    }
    fn link_quality(&self, id: &str) -> f64 {
        self.0.link_quality(id)
    }
    fn backoff_penalty(&self, id: &str) -> f64 {
        self.0.backoff_penalty(id)
    }
}

/// A registered activity handler (§9 "Dynamic dispatch").
pub trait ActivityHandler {
    fn handle(
        &mut self,
        activity: &serde_json::Value,
        cohort: &[PeerEntry],
        min_sigs: usize,
        correlation_id: &str,
    ) -> serde_json::Value;
}

pub(crate) fn near_anchor_for(tree: &Digitree, coord: Coord, estimate: f64, confidence: f64) -> NearAnchor {
    let cohort = assemble_cohort(tree, coord, 4);
    NearAnchor {
        v: crate::service::message::WIRE_VERSION,
        anchors: cohort.iter().take(2).map(|e| e.id.clone()).collect(),
        cohort_hint: cohort.iter().map(|e| e.id.clone()).collect(),
        estimated_cluster_size: estimate.round().max(0.0) as u64,
        confidence,
    }
}

/// `routeAct(msg)` (§4.11). `self_id` identifies this service instance;
/// `estimate`/`confidence` come from [`crate::estimator::Estimator`].
#[allow(clippy::too_many_arguments)]
pub fn route_act(
    tree: &mut Digitree,
    self_id: &str,
    msg: &RouteAndMaybeAct,
    k: usize,
    m: usize,
    estimate: f64,
    confidence: f64,
    activity_handler: Option<&mut dyn ActivityHandler>,
    ctx: &mut dyn RouteContext,
    sparsity: &mut SparsityModel,
    now_ms: u64,
) -> MaybeActResponse {
    let coord = msg.key;
    let want_k = msg.want_k.max(k);

    if let Some(idx) = neighbor_distance(tree, self_id, coord, want_k) {
        if idx <= 1 {
            let cohort = assemble_cohort(tree, coord, want_k);
            if let (Some(activity), Some(handler)) = (&msg.activity, activity_handler) {
                let certificate =
                    handler.handle(activity, &cohort, msg.min_sigs, &msg.correlation_id);
                return MaybeActResponse::Committed(certificate);
            }
            return MaybeActResponse::NearAnchor(near_anchor_for(
                tree, coord, estimate, confidence,
            ));
        }
    }

    if msg.ttl > 0 {
        let mut excluded: HashSet<String> = msg.breadcrumbs.iter().cloned().collect();
        excluded.insert(self_id.to_string());
        let pool_size = 4.max(m);
        let candidates: Vec<Candidate> = assemble_cohort(tree, coord, pool_size * 2)
            .into_iter()
            .filter(|e| !excluded.contains(&e.id))
            .take(pool_size)
            .map(|e| Candidate { id: e.id, coord: e.coord })
            .collect();

        let near_radius = compute_near_radius(estimate, k, 2);
        let selector_ctx = RouteCtxAsSelector(&*ctx);
        if let Some(target) =
            select_next_hop(&candidates, coord, Some(near_radius), confidence, &selector_ctx)
        {
            let mut forward = msg.clone();
            forward.ttl -= 1;
            forward.breadcrumbs.push(self_id.to_string());

            let outcome = ctx.send_maybe_act(&target, &forward);
            let self_coord = coord_of(self_id);
            let x = tree
                .get_by_id(&target)
                .map(|e| e.coord.normalized_log_distance(&self_coord))
                .unwrap_or(0.5);

            match outcome {
                Some(SendOutcome::Success { latency_ms }) => {
                    if let Some(entry) = tree.get_by_id_mut(&target) {
                        relevance::record_success(entry, latency_ms, x, sparsity);
                    }
                    ctx.backoff_mut(&target).clear();
                    return forward_response_passthrough(tree, coord, estimate, confidence);
                }
                Some(SendOutcome::Busy) => {
                    if let Some(entry) = tree.get_by_id_mut(&target) {
                        relevance::record_failure(entry, x);
                    }
                    ctx.backoff_mut(&target).bump(now_ms);
                }
                Some(SendOutcome::Error) | None => {
                    if let Some(entry) = tree.get_by_id_mut(&target) {
                        relevance::record_failure(entry, x);
                    }
                    ctx.backoff_mut(&target).bump(now_ms);
                    debug!(target: "route", "forward to {target} failed, backing off");
                }
            }
        }
    }

    MaybeActResponse::NearAnchor(near_anchor_for(tree, coord, estimate, confidence))
}

/// A successful forward has no response of its own to relay back up the
/// chain in this synchronous model; callers of `route_act` that need the
/// forwarded reply should use the host runtime's response channel. Here we
/// report the same near-anchor fallback shape so every path returns a
/// concrete [`MaybeActResponse`].
fn forward_response_passthrough(
    tree: &Digitree,
    coord: Coord,
    estimate: f64,
    confidence: f64,
) -> MaybeActResponse {
    MaybeActResponse::NearAnchor(near_anchor_for(tree, coord, estimate, confidence))
}

/// Reasons `handleMaybeAct` can short-circuit before reaching `routeAct`
/// (§4.11 steps 1-7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Loop,
    TimestampBounds,
    TtlExpired,
    PayloadTooLarge,
    RateLimited,
    InflightCap,
}

/// `handleMaybeAct(msg)` (§4.11). The dedup cache, token bucket, and
/// in-flight counter are owned by the caller ([`crate::service::Service`]);
/// this function only implements the decision sequence: loop, dedup,
/// timestamp, ttl, payload, rate-limit, inflight, then `routeAct`. Callers
/// must evaluate these in order and must not short-circuit on rate-limit or
/// inflight state before this function has had a chance to reject on the
/// earlier steps.
#[allow(clippy::too_many_arguments)]
pub fn handle_maybe_act(
    tree: &mut Digitree,
    self_id: &str,
    msg: &RouteAndMaybeAct,
    already_cached: Option<&MaybeActResponse>,
    timestamp_valid: bool,
    ttl_ceiling: u32,
    rate_limited: bool,
    inflight_at_cap: bool,
    k: usize,
    m: usize,
    estimate: f64,
    confidence: f64,
    activity_handler: Option<&mut dyn ActivityHandler>,
    ctx: &mut dyn RouteContext,
    sparsity: &mut SparsityModel,
    now_ms: u64,
) -> Result<MaybeActResponse, RejectReason> {
    if msg.breadcrumbs.iter().any(|id| id == self_id) {
        return Ok(MaybeActResponse::NearAnchor(near_anchor_for(
            tree, msg.key, estimate, confidence,
        )));
    }

    if let Some(cached) = already_cached {
        return Ok(cached.clone());
    }

    if !timestamp_valid {
        return Err(RejectReason::TimestampBounds);
    }

    if msg.ttl == 0 || msg.ttl > ttl_ceiling {
        return Err(RejectReason::TtlExpired);
    }

    if msg.activity_size_bytes() > RouteAndMaybeAct::MAX_ACTIVITY_BYTES {
        return Err(RejectReason::PayloadTooLarge);
    }

    if rate_limited {
        return Err(RejectReason::RateLimited);
    }

    if inflight_at_cap {
        return Err(RejectReason::InflightCap);
    }

    Ok(route_act(
        tree,
        self_id,
        msg,
        k,
        m,
        estimate,
        confidence,
        activity_handler,
        ctx,
        sparsity,
        now_ms,
    ))
}

/// One progress event of `iterativeLookup` (§9 "Progressive iterative
/// lookup").
#[derive(Debug, Clone)]
pub enum RouteProgressKind {
    Probing,
    Forwarding,
    NearAnchor,
    ActivitySent,
    Complete,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RouteProgress {
    pub kind: RouteProgressKind,
    pub hop: usize,
    pub peer_id: Option<String>,
    pub near_anchor: Option<NearAnchor>,
    pub result: Option<serde_json::Value>,
    pub ttl_remaining: u32,
}

/// Everything `iterative_lookup` needs from the caller to attempt a hop.
pub trait LookupContext: SelectorContext {
    fn local_cohort(&self, coord: Coord, wants: usize) -> Vec<Candidate>;
    fn backoff_mut(&mut self, id: &str) -> &mut Backoff;
    fn send_maybe_act(&mut self, target: &str, msg: &RouteAndMaybeAct) -> LookupSendResult;
}

/// Narrows a `&dyn LookupContext` down to its `SelectorContext` surface
/// without relying on trait-object upcasting.
struct LookupCtxAsSelector<'a>(&'a dyn LookupContext);

impl<'a> SelectorContext for LookupCtxAsSelector<'a> {
    fn is_connected(&self, id: &str) -> bool {
        self.0.is_connected(id)
    }
    fn link_quality(&self, id: &str) -> f64 {
        self.0.link_quality(id)
    }
    fn backoff_penalty(&self, id: &str) -> f64 {
        self.0.backoff_penalty(id)
    }
}

/// Outcome of one client-initiated `maybeAct` send.
pub enum LookupSendResult {
    Busy,
    NearAnchor(NearAnchor),
    Committed(serde_json::Value),
    Error,
}

/// Parameters held steady across every iteration of a lookup.
pub struct LookupOptions {
    pub want_k: usize,
    pub ttl: u32,
    pub min_sigs: usize,
    pub activity: Option<serde_json::Value>,
    pub k: usize,
    pub beta: u64,
    pub threshold: f64,
}

/// `iterativeLookup(key, options)` (§4.11). Produces up to `ttl + 2`
/// [`RouteProgress`] events, eagerly: callers that stop pulling simply drop
/// the iterator (§9 "Cancellation is by dropping the consumer").
pub struct IterativeLookup<'a> {
    key: Coord,
    options: LookupOptions,
    ctx: &'a mut dyn LookupContext,
    correlation_id: String,
    now_ms: u64,
    estimate: f64,
    confidence: f64,
    best_anchors: Vec<String>,
    attempt: usize,
    max_attempts: usize,
    done: bool,
}

impl<'a> IterativeLookup<'a> {
    pub fn new(
        key: Coord,
        options: LookupOptions,
        ctx: &'a mut dyn LookupContext,
        correlation_id: String,
        estimate: f64,
        confidence: f64,
        now_ms: u64,
    ) -> Self {
        let max_attempts = options.ttl as usize + 2;
        Self {
            key,
            options,
            ctx,
            correlation_id,
            now_ms,
            estimate,
            confidence,
            best_anchors: Vec::new(),
            attempt: 0,
            max_attempts,
            done: false,
        }
    }

    fn candidates(&self) -> Vec<Candidate> {
        if !self.best_anchors.is_empty() {
            self.ctx.local_cohort(self.key, self.options.want_k)
                .into_iter()
                .filter(|c| self.best_anchors.contains(&c.id))
                .collect()
        } else {
            self.ctx.local_cohort(self.key, self.options.want_k)
        }
    }

    fn build_message(&self, ttl: u32, include_activity: bool, breadcrumbs: Vec<String>) -> RouteAndMaybeAct {
        RouteAndMaybeAct {
            v: crate::service::message::WIRE_VERSION,
            key: self.key,
            want_k: self.options.want_k,
            wants: None,
            ttl,
            min_sigs: self.options.min_sigs,
            digest: None,
            activity: if include_activity {
                self.options.activity.clone()
            } else {
                None
            },
            breadcrumbs,
            correlation_id: self.correlation_id.clone(),
            timestamp: self.now_ms,
            signature: String::new(),
        }
    }
}

impl<'a> Iterator for IterativeLookup<'a> {
    type Item = RouteProgress;

    fn next(&mut self) -> Option<RouteProgress> {
        if self.done || self.attempt >= self.max_attempts {
            if !self.done {
                self.done = true;
                return Some(RouteProgress {
                    kind: RouteProgressKind::Exhausted,
                    hop: self.attempt,
                    peer_id: None,
                    near_anchor: None,
                    result: None,
                    ttl_remaining: 0,
                });
            }
            return None;
        }

        let candidates = self.candidates();
        let dist = candidates
            .first()
            .map(|c| c.coord.xor_distance(&self.key))
            .unwrap_or(Coord::ZERO);
        let near_radius = compute_near_radius(self.estimate, self.options.k, self.options.beta);
        let include_activity = self.options.activity.is_some()
            && should_include_payload(
                &dist,
                self.estimate,
                self.confidence,
                self.options.k,
                self.options.beta,
                self.options.threshold,
            );

        let selector_ctx = LookupCtxAsSelector(&*self.ctx);
        let target = match select_next_hop(
            &candidates,
            self.key,
            Some(near_radius),
            self.confidence,
            &selector_ctx,
        ) {
            Some(t) => t,
            None => {
                self.done = true;
                return Some(RouteProgress {
                    kind: RouteProgressKind::Exhausted,
                    hop: self.attempt,
                    peer_id: None,
                    near_anchor: None,
                    result: None,
                    ttl_remaining: 0,
                });
            }
        };

        self.attempt += 1;
        let ttl_remaining = self.options.ttl.saturating_sub(self.attempt as u32);
        let msg = self.build_message(ttl_remaining, include_activity, vec![]);

        let progress_kind = if include_activity {
            RouteProgressKind::ActivitySent
        } else {
            RouteProgressKind::Forwarding
        };

        match self.ctx.send_maybe_act(&target, &msg) {
            LookupSendResult::Busy => {
                self.ctx.backoff_mut(&target).bump(self.now_ms);
                Some(RouteProgress {
                    kind: progress_kind.clone(),
                    hop: self.attempt,
                    peer_id: Some(target),
                    near_anchor: None,
                    result: None,
                    ttl_remaining,
                })
            }
            LookupSendResult::Committed(result) => {
                self.done = true;
                Some(RouteProgress {
                    kind: RouteProgressKind::Complete,
                    hop: self.attempt,
                    peer_id: Some(target),
                    near_anchor: None,
                    result: Some(result),
                    ttl_remaining,
                })
            }
            LookupSendResult::NearAnchor(anchor) => {
                if self.options.activity.is_some() && !include_activity && !anchor.anchors.is_empty() {
                    let first = anchor.anchors[0].clone();
                    let followup =
                        self.build_message(1, true, vec![target.clone(), first.clone()]);
                    match self.ctx.send_maybe_act(&first, &followup) {
                        LookupSendResult::Committed(result) => {
                            self.done = true;
                            return Some(RouteProgress {
                                kind: RouteProgressKind::Complete,
                                hop: self.attempt,
                                peer_id: Some(first),
                                near_anchor: None,
                                result: Some(result),
                                ttl_remaining,
                            });
                        }
                        LookupSendResult::NearAnchor(second) => {
                            self.best_anchors = second.anchors.clone();
                        }
                        LookupSendResult::Busy => {
                            self.ctx.backoff_mut(&first).bump(self.now_ms);
                        }
                        LookupSendResult::Error => {
                            self.ctx.backoff_mut(&first).bump(self.now_ms);
                        }
                    }
                } else {
                    self.best_anchors = anchor.anchors.clone();
                }
                Some(RouteProgress {
                    kind: RouteProgressKind::NearAnchor,
                    hop: self.attempt,
                    peer_id: Some(target),
                    near_anchor: Some(anchor),
                    result: None,
                    ttl_remaining,
                })
            }
            LookupSendResult::Error => {
                self.ctx.backoff_mut(&target).bump(self.now_ms);
                self.best_anchors.retain(|id| id != &target);
                Some(RouteProgress {
                    kind: progress_kind,
                    hop: self.attempt,
                    peer_id: Some(target),
                    near_anchor: None,
                    result: None,
                    ttl_remaining,
                })
            }
        }
    }
}

/// Build the busy reply for `handleMaybeAct` steps 6/7 (§4.11).
pub fn busy_response(retry_after_ms: u64) -> MaybeActResponse {
    MaybeActResponse::Busy(BusyResponse::new(retry_after_ms))
}
