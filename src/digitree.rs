//! Digitree store (C2): an ordered map of known peers by ring coordinate,
//! with neighbor walks, a relevance index, and capacity eviction.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::ring::Coord;

/// Liveness state of a peer entry, as observed through the host runtime's
/// connect/disconnect notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Connected,
    Disconnected,
}

/// A known peer (§3 "Peer entry").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: String,
    pub coord: Coord,
    pub state: PeerState,
    pub relevance: f64,
    pub last_access: u64,
    pub access_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_ms: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl PeerEntry {
    pub fn new(id: String, coord: Coord) -> Self {
        Self {
            id,
            coord,
            state: PeerState::Disconnected,
            relevance: 0.0,
            last_access: 0,
            access_count: 0,
            success_count: 0,
            failure_count: 0,
            avg_latency_ms: 0.0,
            metadata: HashMap::new(),
        }
    }
}

/// A mutable patch applied via [`Digitree::update`]. Fields left `None` are
/// left untouched.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub relevance: Option<f64>,
    pub metadata: Option<HashMap<String, String>>,
}

/// Ordered-by-coordinate peer cache with relevance-driven eviction (C2).
#[derive(Debug)]
pub struct Digitree {
    /// id -> entry. Source of truth for entry data.
    entries: HashMap<String, PeerEntry>,
    /// (coord, id) -> () total order, used for neighbor walks (I5).
    order: BTreeMap<(Coord, String), ()>,
    capacity: usize,
}

impl Digitree {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Insert or update a peer at the given coordinate (I2: ids are unique).
    /// Returns the (possibly pre-existing) entry. If this upsert pushes the
    /// store over capacity, the caller should follow up with
    /// [`Digitree::enforce_capacity`].
    pub fn upsert(&mut self, id: impl Into<String>, coord: Coord) -> &mut PeerEntry {
        let id = id.into();
        if let Some(existing) = self.entries.get(&id) {
            if existing.coord != coord {
                self.order.remove(&(existing.coord, id.clone()));
                self.order.insert((coord, id.clone()), ());
                self.entries.get_mut(&id).unwrap().coord = coord;
            }
        } else {
            self.order.insert((coord, id.clone()), ());
            self.entries.insert(id.clone(), PeerEntry::new(id.clone(), coord));
        }
        self.entries.get_mut(&id).unwrap()
    }

    pub fn remove(&mut self, id: &str) -> Option<PeerEntry> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&(entry.coord, id.to_string()));
        Some(entry)
    }

    pub fn update(&mut self, id: &str, patch: EntryPatch) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                if let Some(r) = patch.relevance {
                    entry.relevance = r;
                }
                if let Some(m) = patch.metadata {
                    entry.metadata = m;
                }
                true
            }
            None => false,
        }
    }

    pub fn get_by_id(&self, id: &str) -> Option<&PeerEntry> {
        self.entries.get(id)
    }

    pub fn get_by_id_mut(&mut self, id: &str) -> Option<&mut PeerEntry> {
        self.entries.get_mut(id)
    }

    pub fn set_state(&mut self, id: &str, state: PeerState) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// All entries, in ascending coordinate order (I5).
    pub fn list(&self) -> Vec<&PeerEntry> {
        self.order
            .keys()
            .filter_map(|(_, id)| self.entries.get(id))
            .collect()
    }

    /// Up to `k` ids in strictly increasing coordinate order starting at the
    /// first entry whose coordinate is >= `coord`, wrapping past 2^256 back
    /// to 0 (§4.1, §4.2). Runs in O(k + log(size)).
    pub fn neighbors_right(&self, coord: Coord, k: usize) -> Vec<&PeerEntry> {
        if k == 0 || self.entries.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(k);
        let mut seen = std::collections::HashSet::new();
        let tail = self
            .order
            .range((coord, String::new())..)
            .chain(self.order.range(..(coord, String::new())));
        for ((_, id), _) in tail {
            if seen.insert(id.clone()) {
                if let Some(e) = self.entries.get(id) {
                    out.push(e);
                    if out.len() == k {
                        break;
                    }
                }
            }
        }
        out
    }

    /// Mirror of [`Digitree::neighbors_right`] in decreasing coordinate
    /// order, wrapping from 0 to 2^256.
    pub fn neighbors_left(&self, coord: Coord, k: usize) -> Vec<&PeerEntry> {
        if k == 0 || self.entries.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(k);
        let mut seen = std::collections::HashSet::new();
        let head = self
            .order
            .range(..(coord, String::new()))
            .rev()
            .chain(self.order.range((coord, String::new())..).rev());
        for ((_, id), _) in head {
            if seen.insert(id.clone()) {
                if let Some(e) = self.entries.get(id) {
                    out.push(e);
                    if out.len() == k {
                        break;
                    }
                }
            }
        }
        out
    }

    pub fn successor_of_coord(&self, coord: Coord) -> Option<&PeerEntry> {
        self.neighbors_right(coord, 1).into_iter().next()
    }

    pub fn predecessor_of_coord(&self, coord: Coord) -> Option<&PeerEntry> {
        self.neighbors_left(coord, 1).into_iter().next()
    }

    /// The union of the `m` nearest successors and `m` nearest predecessors
    /// of `self_coord` (I3: these ids are protected from eviction).
    pub fn protected_ids_around(&self, self_coord: Coord, m: usize) -> std::collections::HashSet<String> {
        let mut ids = std::collections::HashSet::new();
        for e in self.neighbors_right(self_coord, m) {
            ids.insert(e.id.clone());
        }
        for e in self.neighbors_left(self_coord, m) {
            ids.insert(e.id.clone());
        }
        ids
    }

    /// Enforce capacity by evicting the lowest-relevance non-protected
    /// entries (§4.2 "Eviction"). Synchronous and idempotent.
    pub fn enforce_capacity(&mut self, self_coord: Coord, m: usize) {
        let m = m.max(2);
        if self.entries.len() <= self.capacity {
            return;
        }
        let protected = self.protected_ids_around(self_coord, m);
        let mut candidates: Vec<(String, f64)> = self
            .entries
            .iter()
            .filter(|(id, _)| !protected.contains(*id))
            .map(|(id, e)| (id.clone(), e.relevance))
            .collect();
        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut idx = 0;
        while self.entries.len() > self.capacity && idx < candidates.len() {
            self.remove(&candidates[idx].0);
            idx += 1;
        }
    }

    /// JSON-safe export (§4.2 "Serialization", §6 persisted state).
    pub fn export_entries(&self) -> Vec<PeerEntry> {
        self.list().into_iter().cloned().collect()
    }

    /// Re-insert every record, forcing `state = Disconnected` (I4), then
    /// enforce capacity. Returns the count inserted.
    pub fn import_entries(&mut self, entries: Vec<PeerEntry>, self_coord: Coord, m: usize) -> usize {
        let mut count = 0;
        for mut entry in entries {
            entry.state = PeerState::Disconnected;
            let id = entry.id.clone();
            let coord = entry.coord;
            self.order.insert((coord, id.clone()), ());
            self.entries.insert(id, entry);
            count += 1;
        }
        self.enforce_capacity(self_coord, m);
        count
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn coord(byte: u8) -> Coord {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        Coord::from_bytes(bytes)
    }

    fn populated(n: u8) -> Digitree {
        let mut tree = Digitree::new(1000);
        for i in 0..n {
            tree.upsert(format!("peer-{i}"), coord(i));
        }
        tree
    }

    #[test]
    fn test_upsert_and_get() {
        let mut tree = Digitree::new(10);
        tree.upsert("a", coord(1));
        assert_eq!(tree.size(), 1);
        assert_eq!(tree.get_by_id("a").unwrap().coord, coord(1));
    }

    #[test]
    fn test_remove() {
        let mut tree = populated(5);
        assert!(tree.remove("peer-2").is_some());
        assert_eq!(tree.size(), 4);
        assert!(tree.get_by_id("peer-2").is_none());
    }

    #[test]
    fn test_neighbors_right_wraps() {
        let tree = populated(5);
        // Probe above the highest coordinate should wrap to the smallest.
        let probe = coord(250);
        let got = tree.neighbors_right(probe, 2);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, "peer-0");
        assert_eq!(got[1].id, "peer-1");
    }

    #[test]
    fn test_neighbors_left_wraps() {
        let tree = populated(5);
        let probe = Coord::ZERO;
        let got = tree.neighbors_left(probe, 2);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].id, "peer-4");
        assert_eq!(got[1].id, "peer-3");
    }

    #[test]
    fn test_no_duplicate_ids_in_small_store() {
        let tree = populated(3);
        let right = tree.neighbors_right(coord(0), 10);
        let mut ids: Vec<_> = right.iter().map(|e| e.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), right.len());
    }

    #[test]
    fn test_eviction_protects_successor_predecessor() {
        let mut tree = populated(10);
        let self_coord = coord(5);
        // Drop capacity below current size to force eviction.
        tree.capacity = 4;
        for id in tree.list().iter().map(|e| e.id.clone()).collect::<Vec<_>>() {
            tree.update(&id, EntryPatch { relevance: Some(-5.0), metadata: None });
        }
        let protected = tree.protected_ids_around(self_coord, 2);
        tree.enforce_capacity(self_coord, 2);
        for id in &protected {
            assert!(tree.get_by_id(id).is_some(), "{id} should survive eviction");
        }
        assert!(tree.size() <= 4.max(protected.len()));
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut tree = populated(6);
        tree.get_by_id_mut("peer-2").unwrap().relevance = 3.5;
        tree.get_by_id_mut("peer-2").unwrap().state = PeerState::Connected;
        let exported = tree.export_entries();

        let mut restored = Digitree::new(1000);
        let count = restored.import_entries(exported, coord(0), 2);
        assert_eq!(count, 6);

        for e in restored.list() {
            assert_eq!(e.state, PeerState::Disconnected, "I4: imported entries are disconnected");
        }
        assert_eq!(restored.get_by_id("peer-2").unwrap().relevance, 3.5);
        assert_eq!(
            tree.list().iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            restored.list().iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
        );
    }

    #[test]
    fn test_update_unknown_id_returns_false() {
        let mut tree = Digitree::new(10);
        assert!(!tree.update("ghost", EntryPatch::default()));
    }
}
