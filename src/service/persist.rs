//! Export/import persistence helpers (§10 "Export/import persistence
//! helpers"). Convenience glue around [`Digitree::export_entries`] /
//! [`Digitree::import_entries`]; the host application owns actual storage.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::digitree::Digitree;
use crate::ring::Coord;
use crate::service::message::{PersistedState, WIRE_VERSION};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed persisted state: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Write `{ v:1, peerId, timestamp, entries }` to `path` (§6 "Persisted
/// state").
pub fn save_to_path(
    tree: &Digitree,
    peer_id: &str,
    timestamp: u64,
    path: impl AsRef<Path>,
) -> Result<(), PersistError> {
    let state = PersistedState {
        v: WIRE_VERSION,
        peer_id: peer_id.to_string(),
        timestamp,
        entries: tree.export_entries(),
    };
    let json = serde_json::to_vec_pretty(&state)?;
    fs::write(path, json)?;
    Ok(())
}

/// Read a persisted document and import every entry into `tree`, forcing
/// `state = disconnected` per I4. Returns the count inserted.
pub fn load_from_path(
    tree: &mut Digitree,
    self_coord: Coord,
    m: usize,
    path: impl AsRef<Path>,
) -> Result<usize, PersistError> {
    let bytes = fs::read(path)?;
    let state: PersistedState = serde_json::from_slice(&bytes)?;
    Ok(tree.import_entries(state.entries, self_coord, m))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::digitree::PeerState;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut tree = Digitree::new(100);
        tree.upsert("peer-a", Coord::hash("peer-a"));
        tree.upsert("peer-b", Coord::hash("peer-b"));
        tree.get_by_id_mut("peer-a").unwrap().relevance = 2.5;

        save_to_path(&tree, "self", 1000, &path).unwrap();

        let mut restored = Digitree::new(100);
        let count = load_from_path(&mut restored, Coord::hash("self"), 2, &path).unwrap();
        assert_eq!(count, 2);
        assert_eq!(restored.get_by_id("peer-a").unwrap().relevance, 2.5);
        assert_eq!(
            restored.get_by_id("peer-a").unwrap().state,
            PeerState::Disconnected
        );
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = load_from_path(&mut Digitree::new(10), Coord::ZERO, 2, "/nonexistent/path.json");
        assert!(matches!(result, Err(PersistError::Io(_))));
    }
}
