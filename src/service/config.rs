//! Service configuration (§6 "Configuration options").

use crate::ring::Coord;

/// Selects the token-bucket budgets, payload caps, fan-out, and inflight
/// caps used throughout the service (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Edge,
    Core,
}

impl Profile {
    pub fn maybe_act_inflight_cap(&self) -> usize {
        match self {
            Profile::Core => 16,
            Profile::Edge => 4,
        }
    }

    /// Number of replacement candidates to suggest beyond S/P on graceful
    /// leave (§4.10 "Graceful leave (sender)").
    pub fn replacement_fanout(&self) -> usize {
        match self {
            Profile::Core => 4,
            Profile::Edge => 2,
        }
    }

    pub fn max_bytes(&self, protocol: Protocol) -> usize {
        match (protocol, self) {
            (Protocol::Ping, _) => 1024,
            (Protocol::Neighbors, Profile::Edge) => 65536,
            (Protocol::Neighbors, Profile::Core) => 131072,
            (Protocol::NeighborsAnnounce, Profile::Edge) => 65536,
            (Protocol::NeighborsAnnounce, Profile::Core) => 131072,
            (Protocol::MaybeAct, Profile::Edge) => 262144,
            (Protocol::MaybeAct, Profile::Core) => 524288,
            (Protocol::Leave, _) => 4096,
        }
    }
}

/// Protocol identifiers, namespaced by network name at the host runtime
/// registration boundary (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ping,
    Neighbors,
    NeighborsAnnounce,
    MaybeAct,
    Leave,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Ping => "ping",
            Protocol::Neighbors => "neighbors",
            Protocol::NeighborsAnnounce => "neighbors-announce",
            Protocol::MaybeAct => "maybeAct",
            Protocol::Leave => "leave",
        }
    }

    /// Namespace this protocol identifier by network name, so unrelated
    /// rings don't cross-talk (§6 "networkName").
    pub fn namespaced(&self, network_name: &str) -> String {
        format!("/fret/{}/{}", network_name, self.name())
    }
}

/// Service configuration (§6).
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster size target (cohort assembly size, bound on `want_k`).
    pub k: usize,
    /// S/P set size per side (stabilization probe count, snapshot caps).
    pub m: usize,
    /// Digitree max entries (triggers eviction).
    pub capacity: usize,
    pub profile: Profile,
    /// Seed peer ids, re-seeded every stabilization tick.
    pub bootstraps: Vec<String>,
    /// Namespaces protocol identifiers so unrelated rings don't cross-talk.
    pub network_name: String,
    /// Maximum TTL a RouteAndMaybeAct message may carry.
    pub ttl_ceiling: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: 8,
            m: 4,
            capacity: 256,
            profile: Profile::Edge,
            bootstraps: Vec::new(),
            network_name: "main".to_string(),
            ttl_ceiling: 32,
        }
    }
}

impl Config {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            ..Self::default()
        }
    }

    /// Stabilization cadence: passive ~1500ms, active ~300ms (§4.10
    /// "States").
    pub fn tick_interval_ms(&self, active: bool) -> u64 {
        if active {
            300
        } else {
            1500
        }
    }
}

/// Resolve a peer id to its ring coordinate. Implemented by the host's
/// stable identifier hashing capability (§1, capability 4).
pub fn coord_of(id: &str) -> Coord {
    Coord::hash(id.as_bytes())
}
