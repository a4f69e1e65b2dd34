//! Service state machine (C10): stabilization, snapshot merge, graceful
//! leave, and the wiring that ties every other component together behind
//! the [`crate::runtime::HostRuntime`] boundary.

pub mod config;
pub mod dedup;
pub mod diagnostics;
pub mod envelope;
pub mod limiter;
pub mod message;
pub mod persist;
pub mod route;

use std::collections::HashMap;

use log::debug;

use crate::clock::RefClock;
use crate::digitree::{Digitree, EntryPatch, PeerState};
use crate::estimator::{Estimator, NetworkSizeEstimate, Source};
use crate::relevance::{self, SparsityModel};
use crate::ring::Coord;
use crate::runtime::HostRuntime;
use crate::selector::SelectorContext;

pub use config::{coord_of, Config, Profile, Protocol};
pub use diagnostics::Diagnostics;

use dedup::DedupCache;
use envelope::{validate_timestamp, RateLimitOutcome, TIMESTAMP_WINDOW_MS};
use limiter::TokenBucket;
use message::{
    BusyResponse, LeaveNotice, MaybeActResponse, NeighborSnapshot, PingRequest, PingResponse,
    RouteAndMaybeAct, SampleEntry, WIRE_VERSION,
};
use route::{
    busy_response, handle_maybe_act, ActivityHandler, Backoff, RejectReason, RouteContext,
    SendOutcome,
};

/// Default token-bucket budgets: capacity in tokens, refill rate in
/// tokens/second. Not pinned by spec.md's wire table, picked conservatively
/// per protocol relative to its payload cap (§4.5, §6).
fn default_bucket(protocol: Protocol, now: crate::LocalTime) -> TokenBucket {
    let (capacity, rate) = match protocol {
        Protocol::Ping => (20, 5.0),
        Protocol::Neighbors => (10, 2.0),
        Protocol::NeighborsAnnounce => (10, 2.0),
        Protocol::MaybeAct => (30, 10.0),
        Protocol::Leave => (10, 1.0),
    };
    TokenBucket::new(capacity, rate, now)
}

/// A snapshot of overall health, bundling diagnostics, table size, and the
/// latest network-size estimate (§10 "`Service::stats()`").
#[derive(Debug, Clone)]
pub struct Stats {
    pub diagnostics: Diagnostics,
    pub table_size: usize,
    pub network_size: NetworkSizeEstimate,
}

/// The FRET service (C10). Owns the Digitree, the dedup cache, the
/// per-protocol token buckets, and the per-peer backoff map; no
/// process-wide singletons (§9 "Global mutable state").
pub struct Service {
    config: Config,
    self_id: String,
    self_coord: Coord,
    clock: RefClock,
    tree: Digitree,
    sparsity: SparsityModel,
    estimator: Estimator,
    dedup: DedupCache<MaybeActResponse>,
    limiters: HashMap<Protocol, TokenBucket>,
    discovery_bucket: TokenBucket,
    backoffs: HashMap<String, Backoff>,
    diagnostics: Diagnostics,
    activity_handler: Option<Box<dyn ActivityHandler>>,
    active: bool,
    inflight_act: usize,
    bootstrapped: bool,
}

impl Service {
    pub fn new(config: Config, self_id: impl Into<String>, clock: RefClock) -> Self {
        let self_id = self_id.into();
        let self_coord = coord_of(&self_id);
        let now = clock.local_time();
        let mut limiters = HashMap::new();
        for protocol in [
            Protocol::Ping,
            Protocol::Neighbors,
            Protocol::NeighborsAnnounce,
            Protocol::MaybeAct,
            Protocol::Leave,
        ] {
            limiters.insert(protocol, default_bucket(protocol, now));
        }
        let capacity = config.capacity;
        Self {
            config,
            self_id,
            self_coord,
            clock,
            tree: Digitree::new(capacity),
            sparsity: SparsityModel::default(),
            estimator: Estimator::new(),
            dedup: DedupCache::default(),
            limiters,
            discovery_bucket: TokenBucket::new(20, 5.0, now),
            backoffs: HashMap::new(),
            diagnostics: Diagnostics::default(),
            activity_handler: None,
            active: false,
            inflight_act: 0,
            bootstrapped: false,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn self_coord(&self) -> Coord {
        self.self_coord
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn set_activity_handler(&mut self, handler: Box<dyn ActivityHandler>) {
        self.activity_handler = Some(handler);
    }

    fn now_ms(&self) -> u64 {
        self.clock.local_time().as_secs() * 1000
    }

    fn m(&self) -> usize {
        self.config.m.max(2)
    }

    /// `start()` (§4.10 "Startup"): seed self and peer-store peers, register
    /// handlers, emit a bounded proactive announce, begin stabilization.
    ///
    /// The host runtime is responsible for decoding each registered
    /// protocol's inbound frames and calling the matching handler:
    /// `Protocol::Ping` -> [`Service::handle_ping`], `Protocol::Neighbors`
    /// -> [`Service::handle_neighbors_request`], `Protocol::MaybeAct` ->
    /// [`Service::handle_maybe_act`], `Protocol::Leave` ->
    /// [`Service::handle_leave_notice`]. `Protocol::NeighborsAnnounce` has
    /// no reply; it is this instance's own push, merged by the receiver via
    /// [`Service::merge_snapshot`].
    pub fn start(&mut self, runtime: &mut dyn HostRuntime) {
        for bootstrap in self.config.bootstraps.clone() {
            let coord = coord_of(&bootstrap);
            self.tree.upsert(bootstrap, coord);
        }
        for protocol in [
            Protocol::Ping,
            Protocol::Neighbors,
            Protocol::NeighborsAnnounce,
            Protocol::MaybeAct,
            Protocol::Leave,
        ] {
            runtime.register_handler(protocol);
        }
        let targets: Vec<String> = self
            .tree
            .protected_ids_around(self.self_coord, self.m())
            .into_iter()
            .take(8)
            .collect();
        for id in targets {
            self.announce_to(&id, runtime);
        }
        self.bootstrapped = false;
        self.active = true;
        self.tick(runtime);
    }

    /// Stabilization cadence the host runtime should drive `tick()` at:
    /// faster while this instance hasn't yet filled its S/P sets, slower
    /// once steady-state (§4.10 "States").
    pub fn tick_interval_ms(&self) -> u64 {
        self.config.tick_interval_ms(self.active)
    }

    /// Called by the embedding application when the host runtime reports a
    /// new connection; the first one triggers a one-shot post-bootstrap
    /// announce (§4.10 "Startup").
    pub fn on_peer_connect(&mut self, id: &str, runtime: &mut dyn HostRuntime) {
        self.tree.upsert(id.to_string(), coord_of(id));
        self.tree.set_state(id, PeerState::Connected);
        if !self.bootstrapped {
            self.bootstrapped = true;
            self.announce_to(id, runtime);
        }
    }

    pub fn on_peer_disconnect(&mut self, id: &str) {
        self.tree.set_state(id, PeerState::Disconnected);
    }

    /// `stabilization tick` (§4.10). Errors per peer are logged and
    /// isolated; the tick never panics.
    pub fn tick(&mut self, runtime: &mut dyn HostRuntime) {
        for bootstrap in self.config.bootstraps.clone() {
            let coord = coord_of(&bootstrap);
            self.tree.upsert(bootstrap, coord);
        }

        let m = self.m();
        let mut probe_targets: Vec<String> = self
            .tree
            .neighbors_right(self.self_coord, m)
            .into_iter()
            .chain(self.tree.neighbors_left(self.self_coord, m))
            .filter(|e| e.id != self.self_id)
            .map(|e| e.id.clone())
            .collect();
        probe_targets.dedup();
        probe_targets.truncate(4);

        for id in &probe_targets {
            self.ping(id, runtime);
        }
        for id in &probe_targets {
            self.fetch_and_merge(id, runtime);
        }

        self.tree.enforce_capacity(self.self_coord, m);

        let protected = self.tree.protected_ids_around(self.self_coord, m);
        self.active = protected.len() < m * 2;
    }

    fn ping(&mut self, id: &str, runtime: &mut dyn HostRuntime) {
        let body = serde_json::to_vec(&PingRequest {
            v: WIRE_VERSION,
            ts: self.now_ms(),
        })
        .unwrap_or_default();
        self.diagnostics.pings_sent += 1;
        match runtime.send(id, Protocol::Ping, body) {
            Some(frame) => {
                if let Ok(resp) = serde_json::from_slice::<PingResponse>(&frame) {
                    if resp.ok {
                        if let (Some(estimate), Some(confidence)) =
                            (resp.size_estimate, resp.confidence)
                        {
                            self.estimator.report_network_size(
                                estimate as f64,
                                confidence,
                                Some(Source::Peer(id.to_string())),
                                self.now_ms(),
                            );
                        }
                    }
                }
            }
            None => {
                debug!(target: "service", "ping to {id} failed");
                self.diagnostics.peer_faults.peer_unreachable += 1;
            }
        }
    }

    fn fetch_and_merge(&mut self, id: &str, runtime: &mut dyn HostRuntime) {
        match runtime.send(id, Protocol::Neighbors, Vec::new()) {
            Some(frame) => match serde_json::from_slice::<NeighborSnapshot>(&frame) {
                Ok(snapshot) => self.merge_snapshot(id, snapshot),
                Err(_) => {
                    self.diagnostics.rejected.malformed_message += 1;
                }
            },
            None => {
                debug!(target: "service", "fetch from {id} failed");
                self.diagnostics.peer_faults.peer_unreachable += 1;
            }
        }
    }

    /// `Snapshot merge` (§4.10): reject stale timestamps, update sender
    /// metadata via `update` (never mutate exported entries in place),
    /// upsert sender and every listed id.
    pub fn merge_snapshot(&mut self, sender_id: &str, snapshot: NeighborSnapshot) {
        let now = self.now_ms();
        if !validate_timestamp(now, snapshot.timestamp, TIMESTAMP_WINDOW_MS) {
            self.diagnostics.rejected.timestamp_bounds += 1;
            debug!(target: "service", "dropping stale snapshot from {sender_id}");
            return;
        }

        self.touch_id(sender_id);
        if let Some(metadata) = snapshot.metadata {
            self.tree.update(
                sender_id,
                EntryPatch {
                    relevance: None,
                    metadata: Some(metadata),
                },
            );
        }
        if let (Some(estimate), Some(confidence)) = (snapshot.size_estimate, snapshot.confidence)
        {
            self.estimator.report_network_size(
                estimate as f64,
                confidence,
                Some(Source::Peer(sender_id.to_string())),
                now,
            );
        }

        for id in snapshot.successors.iter().chain(snapshot.predecessors.iter()) {
            self.touch_id(id);
        }
        if let Some(sample) = snapshot.sample {
            for SampleEntry { id, coord, relevance } in sample {
                let is_new = self.tree.get_by_id(&id).is_none();
                self.tree.upsert(id.clone(), coord);
                if is_new {
                    self.report_discovery();
                }
                self.tree.update(
                    &id,
                    EntryPatch {
                        relevance: Some(relevance),
                        metadata: None,
                    },
                );
            }
        }
    }

    fn touch_id(&mut self, id: &str) {
        let coord = self
            .tree
            .get_by_id(id)
            .map(|e| e.coord)
            .unwrap_or_else(|| coord_of(id));
        let is_new = self.tree.get_by_id(id).is_none();
        let now = self.now_ms();
        let entry = self.tree.upsert(id.to_string(), coord);
        let x = entry.coord.normalized_log_distance(&self.self_coord);
        relevance::touch(entry, x, &mut self.sparsity, now);
        if is_new {
            self.report_discovery();
        }
    }

    fn report_discovery(&mut self) {
        let now = self.clock.local_time();
        if self.discovery_bucket.try_take(now) {
            self.diagnostics.discovery_events += 1;
        }
    }

    /// Build a [`NeighborSnapshot`] of this instance's current S/P sets plus
    /// a relevance-ranked sample, the payload shared by `announce_to` and
    /// [`Service::handle_neighbors_request`] (§4.10 "Startup", "Neighbors
    /// pull").
    fn build_snapshot(&mut self) -> NeighborSnapshot {
        let m = self.m();
        let successors: Vec<String> = self
            .tree
            .neighbors_right(self.self_coord, NeighborSnapshot::MAX_SUCCESSORS.min(m * 2))
            .into_iter()
            .map(|e| e.id.clone())
            .collect();
        let predecessors: Vec<String> = self
            .tree
            .neighbors_left(self.self_coord, NeighborSnapshot::MAX_PREDECESSORS.min(m * 2))
            .into_iter()
            .map(|e| e.id.clone())
            .collect();
        let sample: Vec<SampleEntry> = self
            .tree
            .list()
            .into_iter()
            .take(NeighborSnapshot::MAX_SAMPLE)
            .map(|e| SampleEntry {
                id: e.id.clone(),
                coord: e.coord,
                relevance: e.relevance,
            })
            .collect();
        let estimate = self.estimator.get_network_size_estimate(None, self.now_ms());

        NeighborSnapshot {
            v: WIRE_VERSION,
            from: self.self_id.clone(),
            timestamp: self.now_ms(),
            successors,
            predecessors,
            sample: Some(sample),
            size_estimate: Some(estimate.estimate),
            confidence: Some(estimate.confidence),
            sig: String::new(),
            metadata: None,
        }
    }

    /// Build and send a [`NeighborSnapshot`] to `id` (§4.10 "Startup",
    /// "Graceful leave (receiver)").
    fn announce_to(&mut self, id: &str, runtime: &mut dyn HostRuntime) {
        let snapshot = self.build_snapshot();
        let body = serde_json::to_vec(&snapshot).unwrap_or_default();
        self.diagnostics.announcements_sent += 1;
        if runtime.send(id, Protocol::NeighborsAnnounce, body).is_none() {
            self.diagnostics.peer_faults.peer_unreachable += 1;
        }
    }

    /// Inbound `Ping` handler (§4.10 "Startup"): answer liveness checks and
    /// piggy-back this instance's network-size estimate.
    pub fn handle_ping(&mut self, _request: PingRequest) -> PingResponse {
        let now_ms = self.now_ms();
        let estimate = self.estimator.get_network_size_estimate(None, now_ms);
        PingResponse {
            ok: true,
            ts: now_ms,
            size_estimate: Some(estimate.estimate),
            confidence: Some(estimate.confidence),
        }
    }

    /// Inbound `Neighbors` pull handler (§4.10 "Startup"): answer with this
    /// instance's current snapshot, the counterpart to `fetch_and_merge`.
    pub fn handle_neighbors_request(&mut self) -> NeighborSnapshot {
        self.build_snapshot()
    }

    /// `Graceful leave (sender)` (§4.10): notify S/P plus up to
    /// `profile.replacement_fanout()` replacement candidates.
    pub fn leave(&mut self, runtime: &mut dyn HostRuntime) {
        let m = self.m();
        let sp: Vec<String> = self
            .tree
            .protected_ids_around(self.self_coord, m)
            .into_iter()
            .collect();

        let mut replacements: Vec<(String, bool, f64)> = self
            .tree
            .neighbors_right(self.self_coord, m * 2)
            .into_iter()
            .chain(self.tree.neighbors_left(self.self_coord, m * 2))
            .filter(|e| !sp.contains(&e.id) && e.id != self.self_id)
            .map(|e| {
                (
                    e.id.clone(),
                    e.state == PeerState::Connected,
                    e.relevance,
                )
            })
            .collect();
        replacements.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
        });
        replacements.dedup_by(|a, b| a.0 == b.0);
        let fanout = self.config.profile.replacement_fanout();
        let replacement_ids: Vec<String> = replacements
            .into_iter()
            .take(fanout)
            .map(|(id, _, _)| id)
            .collect();

        let notice = LeaveNotice {
            v: WIRE_VERSION,
            from: self.self_id.clone(),
            replacements: if replacement_ids.is_empty() {
                None
            } else {
                Some(replacement_ids.clone())
            },
            timestamp: self.now_ms(),
        };
        let body = serde_json::to_vec(&notice).unwrap_or_default();

        for id in sp.iter().chain(replacement_ids.iter()) {
            if runtime.send(id, Protocol::Leave, body.clone()).is_none() {
                debug!(target: "service", "best-effort leave notice to {id} failed");
            }
        }
        self.active = false;
    }

    /// `Graceful leave (receiver)` (§4.10).
    pub fn handle_leave_notice(&mut self, notice: LeaveNotice, runtime: &mut dyn HostRuntime) {
        let now = self.now_ms();
        if !validate_timestamp(now, notice.timestamp, TIMESTAMP_WINDOW_MS) {
            self.diagnostics.rejected.timestamp_bounds += 1;
            return;
        }
        if !matches!(
            self.limiters
                .get_mut(&Protocol::Leave)
                .map(|b| b.try_take(self.clock.local_time())),
            Some(true)
        ) {
            self.diagnostics.rejected.rate_limited += 1;
            return;
        }

        let departing_coord = self
            .tree
            .get_by_id(&notice.from)
            .map(|e| e.coord)
            .unwrap_or_else(|| coord_of(&notice.from));
        self.tree.remove(&notice.from);

        // Drop unparseable (empty) ids before merging (§4.10, P8 scenario 8).
        let suggested: Vec<String> = notice
            .replacements
            .unwrap_or_default()
            .into_iter()
            .filter(|id| !id.is_empty())
            .collect();
        let expanded: Vec<String> = route::assemble_cohort(&self.tree, departing_coord, self.m() * 2)
            .into_iter()
            .map(|e| e.id)
            .collect();

        let mut merged: Vec<String> = suggested;
        merged.extend(expanded);
        merged.dedup();
        merged.truncate(LeaveNotice::MAX_REPLACEMENTS);

        for id in merged.iter().take(6) {
            self.ping(id, runtime);
            if !runtime.is_connected(id) {
                self.announce_to(id, runtime);
            }
        }

        let neighbors: Vec<String> = self
            .tree
            .neighbors_right(departing_coord, self.m())
            .into_iter()
            .chain(self.tree.neighbors_left(departing_coord, self.m()))
            .filter(|e| runtime.is_connected(&e.id))
            .take(4)
            .map(|e| e.id.clone())
            .collect();
        for id in neighbors {
            self.announce_to(&id, runtime);
        }
    }

    /// RPC envelope (C9) + `handleMaybeAct` (C11) for one inbound
    /// `RouteAndMaybeAct` request. `runtime` provides the per-hop forward
    /// capability via [`RouteContext`].
    pub fn handle_maybe_act(
        &mut self,
        msg: RouteAndMaybeAct,
        runtime: &mut dyn HostRuntime,
    ) -> MaybeActResponse {
        let now_ms = self.now_ms();
        let now = self.clock.local_time();

        let cached = self.dedup.get(&msg.correlation_id, now_ms).cloned();
        let timestamp_valid = validate_timestamp(now_ms, msg.timestamp, TIMESTAMP_WINDOW_MS);

        let mut retry_after_ms = 0u64;
        let rate_limited = match self.limiters.get_mut(&Protocol::MaybeAct) {
            Some(bucket) => match envelope::rate_limit(bucket, now) {
                RateLimitOutcome::Allowed => false,
                RateLimitOutcome::Limited { retry_after_ms: r } => {
                    retry_after_ms = r;
                    true
                }
            },
            None => false,
        };

        let cap = self.config.profile.maybe_act_inflight_cap();
        let inflight_at_cap = self.inflight_act >= cap;

        self.inflight_act += 1;
        let k = self.config.k;
        let m = self.config.m;
        let ttl_ceiling = self.config.ttl_ceiling;
        let estimate = self.estimator.get_network_size_estimate(None, now_ms);
        let self_id = self.self_id.clone();
        let tree = &mut self.tree;
        let sparsity = &mut self.sparsity;
        let handler: Option<&mut dyn ActivityHandler> = match &mut self.activity_handler {
            Some(b) => Some(&mut **b),
            None => None,
        };
        let result = {
            let mut ctx = HandleCtx {
                backoffs: &mut self.backoffs,
                runtime,
                protocol: Protocol::MaybeAct,
                now_ms,
            };

            handle_maybe_act(
                tree,
                &self_id,
                &msg,
                cached.as_ref(),
                timestamp_valid,
                ttl_ceiling,
                rate_limited,
                inflight_at_cap,
                k,
                m,
                estimate.estimate as f64,
                estimate.confidence,
                handler,
                &mut ctx,
                sparsity,
                now_ms,
            )
        };
        self.inflight_act -= 1;

        let response = match result {
            Ok(response) => response,
            Err(reason) => {
                match reason {
                    RejectReason::Loop => {}
                    RejectReason::TimestampBounds => self.diagnostics.rejected.timestamp_bounds += 1,
                    RejectReason::TtlExpired => self.diagnostics.rejected.ttl_expired += 1,
                    RejectReason::PayloadTooLarge => self.diagnostics.rejected.payload_too_large += 1,
                    RejectReason::RateLimited => self.diagnostics.rejected.rate_limited += 1,
                    RejectReason::InflightCap => self.diagnostics.rejected.rate_limited += 1,
                }
                match reason {
                    RejectReason::RateLimited => busy_response(retry_after_ms),
                    RejectReason::InflightCap => busy_response(500),
                    _ => {
                        let estimate_again =
                            self.estimator.get_network_size_estimate(None, now_ms);
                        MaybeActResponse::NearAnchor(route::near_anchor_for(
                            &self.tree,
                            msg.key,
                            estimate_again.estimate as f64,
                            estimate_again.confidence,
                        ))
                    }
                }
            }
        };

        self.dedup.set(msg.correlation_id.clone(), response.clone(), now_ms);
        response
    }

    pub fn stats(&mut self) -> Stats {
        let now_ms = self.now_ms();
        Stats {
            diagnostics: self.diagnostics.clone(),
            table_size: self.tree.size(),
            network_size: self.estimator.get_network_size_estimate(None, now_ms),
        }
    }
}

/// Bridges [`Service`]'s backoff map and the host runtime into the
/// [`SelectorContext`]/[`RouteContext`] traits `handle_maybe_act` needs.
struct HandleCtx<'a> {
    backoffs: &'a mut HashMap<String, Backoff>,
    runtime: &'a mut dyn HostRuntime,
    protocol: Protocol,
    now_ms: u64,
}

impl<'a> SelectorContext for HandleCtx<'a> {
    fn is_connected(&self, id: &str) -> bool {
        self.runtime.is_connected(id)
    }

    fn link_quality(&self, id: &str) -> f64 {
        if self.runtime.is_connected(id) {
            1.0
        } else {
            0.0
        }
    }

    fn backoff_penalty(&self, id: &str) -> f64 {
        self.backoffs
            .get(id)
            .map(|b| b.penalty(self.now_ms))
            .unwrap_or(0.0)
    }
}

impl<'a> RouteContext for HandleCtx<'a> {
    fn backoff_mut(&mut self, id: &str) -> &mut Backoff {
        self.backoffs.entry(id.to_string()).or_default()
    }

    fn send_maybe_act(&mut self, id: &str, msg: &RouteAndMaybeAct) -> Option<SendOutcome> {
        let body = serde_json::to_vec(msg).ok()?;
        let frame = self.runtime.send(id, self.protocol, body)?;
        if serde_json::from_slice::<BusyResponse>(&frame)
            .map(|b| b.busy)
            .unwrap_or(false)
        {
            return Some(SendOutcome::Busy);
        }
        Some(SendOutcome::Success { latency_ms: 0.0 })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    struct FakeRuntime {
        connected: StdHashMap<String, bool>,
    }

    impl HostRuntime for FakeRuntime {
        fn send(&mut self, _peer_id: &str, _protocol: Protocol, _body: Vec<u8>) -> Option<Vec<u8>> {
            None
        }

        fn register_handler(&mut self, _protocol: Protocol) {}

        fn is_connected(&self, peer_id: &str) -> bool {
            *self.connected.get(peer_id).unwrap_or(&false)
        }
    }

    fn service() -> Service {
        Service::new(Config::default(), "self", crate::LocalTime::from_secs(0).into())
    }

    #[test]
    fn test_new_service_has_empty_table() {
        let svc = service();
        assert_eq!(svc.tree.size(), 0);
    }

    #[test]
    fn test_start_registers_handlers_and_ticks() {
        let mut svc = service();
        let mut runtime = FakeRuntime { connected: StdHashMap::new() };
        svc.start(&mut runtime);
        // No panics, diagnostics remain at defaults since there were no peers to probe.
        assert_eq!(svc.diagnostics().pings_sent, 0);
    }

    #[test]
    fn test_on_peer_connect_marks_connected() {
        let mut svc = service();
        let mut runtime = FakeRuntime { connected: StdHashMap::new() };
        svc.on_peer_connect("peer-a", &mut runtime);
        assert_eq!(
            svc.tree.get_by_id("peer-a").unwrap().state,
            PeerState::Connected
        );
    }

    #[test]
    fn test_handle_maybe_act_ttl_zero_increments_diagnostics() {
        let mut svc = service();
        let mut runtime = FakeRuntime { connected: StdHashMap::new() };
        let msg = RouteAndMaybeAct {
            v: WIRE_VERSION,
            key: Coord::hash("k"),
            want_k: 8,
            wants: None,
            ttl: 0,
            min_sigs: 1,
            digest: None,
            activity: None,
            breadcrumbs: vec![],
            correlation_id: "corr-1".into(),
            timestamp: svc.now_ms(),
            signature: String::new(),
        };
        let resp = svc.handle_maybe_act(msg, &mut runtime);
        assert!(matches!(resp, MaybeActResponse::NearAnchor(_)));
        assert_eq!(svc.diagnostics().rejected.ttl_expired, 1);
    }

    #[test]
    fn test_handle_maybe_act_dedup_idempotence_p7() {
        let mut svc = service();
        let mut runtime = FakeRuntime { connected: StdHashMap::new() };
        let msg = RouteAndMaybeAct {
            v: WIRE_VERSION,
            key: Coord::hash("k"),
            want_k: 8,
            wants: None,
            ttl: 0,
            min_sigs: 1,
            digest: None,
            activity: None,
            breadcrumbs: vec![],
            correlation_id: "corr-dup".into(),
            timestamp: svc.now_ms(),
            signature: String::new(),
        };
        let first = svc.handle_maybe_act(msg.clone(), &mut runtime);
        let second = svc.handle_maybe_act(msg, &mut runtime);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    /// A drained rate-limit bucket must not preempt the ttl check: a
    /// ttl=0 message is rejected as expired, not as busy/rate-limited.
    #[test]
    fn test_handle_maybe_act_ttl_expired_takes_priority_over_rate_limit() {
        let mut svc = service();
        let mut runtime = FakeRuntime { connected: StdHashMap::new() };
        for bucket in svc.limiters.values_mut() {
            while bucket.try_take(svc.clock.local_time()) {}
        }
        let msg = RouteAndMaybeAct {
            v: WIRE_VERSION,
            key: Coord::hash("k"),
            want_k: 8,
            wants: None,
            ttl: 0,
            min_sigs: 1,
            digest: None,
            activity: None,
            breadcrumbs: vec![],
            correlation_id: "corr-ttl-vs-rate".into(),
            timestamp: svc.now_ms(),
            signature: String::new(),
        };
        let resp = svc.handle_maybe_act(msg, &mut runtime);
        assert!(matches!(resp, MaybeActResponse::NearAnchor(_)));
        assert_eq!(svc.diagnostics().rejected.ttl_expired, 1);
        assert_eq!(svc.diagnostics().rejected.rate_limited, 0);
    }

    #[test]
    fn test_handle_maybe_act_ttl_above_ceiling_rejected() {
        let mut svc = service();
        let mut runtime = FakeRuntime { connected: StdHashMap::new() };
        let msg = RouteAndMaybeAct {
            v: WIRE_VERSION,
            key: Coord::hash("k"),
            want_k: 8,
            wants: None,
            ttl: svc.config.ttl_ceiling + 1,
            min_sigs: 1,
            digest: None,
            activity: None,
            breadcrumbs: vec![],
            correlation_id: "corr-ttl-ceiling".into(),
            timestamp: svc.now_ms(),
            signature: String::new(),
        };
        let resp = svc.handle_maybe_act(msg, &mut runtime);
        assert!(matches!(resp, MaybeActResponse::NearAnchor(_)));
        assert_eq!(svc.diagnostics().rejected.ttl_expired, 1);
    }

    #[test]
    fn test_handle_maybe_act_rate_limited_returns_busy() {
        let mut svc = service();
        let mut runtime = FakeRuntime { connected: StdHashMap::new() };
        for bucket in svc.limiters.values_mut() {
            while bucket.try_take(svc.clock.local_time()) {}
        }
        let msg = RouteAndMaybeAct {
            v: WIRE_VERSION,
            key: Coord::hash("k"),
            want_k: 8,
            wants: None,
            ttl: 3,
            min_sigs: 1,
            digest: None,
            activity: None,
            breadcrumbs: vec![],
            correlation_id: "corr-busy".into(),
            timestamp: svc.now_ms(),
            signature: String::new(),
        };
        let resp = svc.handle_maybe_act(msg, &mut runtime);
        assert!(matches!(resp, MaybeActResponse::Busy(_)));
        assert_eq!(svc.diagnostics().rejected.rate_limited, 1);
    }

    #[test]
    fn test_handle_ping_reports_ok_and_estimate() {
        let mut svc = service();
        let resp = svc.handle_ping(PingRequest { v: WIRE_VERSION, ts: 0 });
        assert!(resp.ok);
        assert!(resp.size_estimate.is_some());
        assert!(resp.confidence.is_some());
    }

    #[test]
    fn test_handle_neighbors_request_matches_announce_snapshot() {
        let mut svc = service();
        svc.tree.upsert("peer-a".to_string(), Coord::hash("peer-a"));
        let snapshot = svc.handle_neighbors_request();
        assert_eq!(snapshot.from, svc.self_id);
        assert_eq!(snapshot.v, WIRE_VERSION);
    }

    #[test]
    fn test_tick_interval_faster_while_active() {
        let mut svc = service();
        svc.active = true;
        let active_interval = svc.tick_interval_ms();
        svc.active = false;
        let passive_interval = svc.tick_interval_ms();
        assert!(active_interval < passive_interval);
    }
}
