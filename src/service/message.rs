//! Wire message types (§3 "Routing message" / "Neighbor snapshot", §6
//! "Wire format").
//!
//! 32-byte binary fields are carried as base64url strings without padding
//! via [`crate::ring::Coord`]'s own `Serialize`/`Deserialize` impls. All
//! versioned messages carry `v: 1`. The `sig`/`signature` fields are
//! reserved per spec §9's open question: always an empty string, never
//! read (see `SPEC_FULL.md` §12).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ring::Coord;

pub const WIRE_VERSION: u8 = 1;

/// One sample entry carried inside a [`NeighborSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleEntry {
    pub id: String,
    pub coord: Coord,
    pub relevance: f64,
}

/// Push or pull snapshot of a peer's S/P neighborhood (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborSnapshot {
    pub v: u8,
    pub from: String,
    pub timestamp: u64,
    pub successors: Vec<String>,
    pub predecessors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Vec<SampleEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_estimate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub sig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl NeighborSnapshot {
    pub const MAX_SUCCESSORS: usize = 12;
    pub const MAX_PREDECESSORS: usize = 12;
    pub const MAX_SAMPLE: usize = 8;
}

/// A request to assemble the cohort responsible for `key`, and optionally
/// deliver `activity` to it (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteAndMaybeAct {
    pub v: u8,
    pub key: Coord,
    pub want_k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wants: Option<usize>,
    pub ttl: u32,
    pub min_sigs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breadcrumbs: Vec<String>,
    pub correlation_id: String,
    pub timestamp: u64,
    #[serde(default)]
    pub signature: String,
}

impl RouteAndMaybeAct {
    /// §4.11 "If activity payload > 128 KiB".
    pub const MAX_ACTIVITY_BYTES: usize = 128 * 1024;

    pub fn activity_size_bytes(&self) -> usize {
        self.activity
            .as_ref()
            .map(|v| serde_json::to_vec(v).map(|b| b.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

/// Invitation to resend to one of the returned anchors, or a hint of the
/// cohort to the client (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearAnchor {
    pub v: u8,
    pub anchors: Vec<String>,
    pub cohort_hint: Vec<String>,
    pub estimated_cluster_size: u64,
    pub confidence: f64,
}

/// Graceful departure notice (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveNotice {
    pub v: u8,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacements: Option<Vec<String>>,
    pub timestamp: u64,
}

impl LeaveNotice {
    /// §4.10 "Graceful leave (receiver)": sanitized replacement lists are
    /// truncated to 12.
    pub const MAX_REPLACEMENTS: usize = 12;
}

/// Backpressure response shape, carrying a retry-after hint (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusyResponse {
    pub v: u8,
    pub busy: bool,
    pub retry_after_ms: u64,
}

impl BusyResponse {
    pub fn new(retry_after_ms: u64) -> Self {
        Self {
            v: WIRE_VERSION,
            busy: true,
            retry_after_ms,
        }
    }
}

/// `{ ok, ts, size_estimate?, confidence? }` (§6 "PingResponse").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub ok: bool,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_estimate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub v: u8,
    pub ts: u64,
}

/// An opaque activity result returned by the application-supplied activity
/// handler (§9 "Dynamic dispatch"). The commit certificate's shape is
/// entirely application-defined and out of scope here; it is carried
/// as-is.
pub type CommitCertificate = serde_json::Value;

/// `handleMaybeAct`'s polymorphic reply: clients must check `busy` before
/// interpreting further, then distinguish a commit certificate from a
/// `NearAnchor` by the presence of `anchors` (§9 "Polymorphic replies").
#[derive(Debug, Clone)]
pub enum MaybeActResponse {
    Busy(BusyResponse),
    NearAnchor(NearAnchor),
    Committed(CommitCertificate),
}

impl Serialize for MaybeActResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            MaybeActResponse::Busy(b) => b.serialize(serializer),
            MaybeActResponse::NearAnchor(n) => n.serialize(serializer),
            MaybeActResponse::Committed(c) => c.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for MaybeActResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        if value.get("busy").and_then(|b| b.as_bool()) == Some(true) {
            let busy: BusyResponse =
                serde_json::from_value(value).map_err(serde::de::Error::custom)?;
            return Ok(MaybeActResponse::Busy(busy));
        }
        if value.get("anchors").is_some() {
            let anchor: NearAnchor =
                serde_json::from_value(value).map_err(serde::de::Error::custom)?;
            return Ok(MaybeActResponse::NearAnchor(anchor));
        }
        Ok(MaybeActResponse::Committed(value))
    }
}

/// `{ v:1, peerId, timestamp, entries: [...] }` (§6 "Persisted state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub v: u8,
    pub peer_id: String,
    pub timestamp: u64,
    pub entries: Vec<crate::digitree::PeerEntry>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_maybe_act_response_busy_round_trips() {
        let resp = MaybeActResponse::Busy(BusyResponse::new(500));
        let json = serde_json::to_value(&resp).unwrap();
        let back: MaybeActResponse = serde_json::from_value(json).unwrap();
        assert!(matches!(back, MaybeActResponse::Busy(b) if b.retry_after_ms == 500));
    }

    #[test]
    fn test_maybe_act_response_near_anchor_round_trips() {
        let resp = MaybeActResponse::NearAnchor(NearAnchor {
            v: WIRE_VERSION,
            anchors: vec!["a".into()],
            cohort_hint: vec!["a".into(), "b".into()],
            estimated_cluster_size: 10,
            confidence: 0.5,
        });
        let json = serde_json::to_value(&resp).unwrap();
        let back: MaybeActResponse = serde_json::from_value(json).unwrap();
        assert!(matches!(back, MaybeActResponse::NearAnchor(n) if n.anchors == vec!["a".to_string()]));
    }

    #[test]
    fn test_maybe_act_response_commit_falls_through() {
        let resp = MaybeActResponse::Committed(serde_json::json!({"sig_count": 3}));
        let json = serde_json::to_value(&resp).unwrap();
        let back: MaybeActResponse = serde_json::from_value(json).unwrap();
        assert!(matches!(back, MaybeActResponse::Committed(_)));
    }

    #[test]
    fn test_route_and_maybe_act_coord_base64url() {
        let msg = RouteAndMaybeAct {
            v: WIRE_VERSION,
            key: Coord::hash("key"),
            want_k: 8,
            wants: None,
            ttl: 10,
            min_sigs: 1,
            digest: None,
            activity: None,
            breadcrumbs: vec![],
            correlation_id: "abc".into(),
            timestamp: 0,
            signature: String::new(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains('='), "base64url must be unpadded");
        let back: RouteAndMaybeAct = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, msg.key);
    }

    #[test]
    fn test_activity_size_bytes() {
        let mut msg = RouteAndMaybeAct {
            v: WIRE_VERSION,
            key: Coord::ZERO,
            want_k: 1,
            wants: None,
            ttl: 1,
            min_sigs: 1,
            digest: None,
            activity: None,
            breadcrumbs: vec![],
            correlation_id: "x".into(),
            timestamp: 0,
            signature: String::new(),
        };
        assert_eq!(msg.activity_size_bytes(), 0);
        msg.activity = Some(serde_json::json!({"payload": "x".repeat(100)}));
        assert!(msg.activity_size_bytes() > 100);
    }
}
