//! Synthetic peer mesh: evenly-spaced ring coordinates so the correct
//! successor/predecessor structure is known a priori (§4.12).

use crate::ring::Coord;

#[derive(Debug, Clone)]
pub struct SimPeer {
    pub id: String,
    pub coord: Coord,
    pub alive: bool,
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
}

/// `N` synthetic peers evenly spaced around the ring, with stabilization
/// and greedy routing modeled directly over peer indices (§4.12).
pub struct Mesh {
    pub peers: Vec<SimPeer>,
    pub m: usize,
}

impl Mesh {
    pub fn new(n: usize, m: usize) -> Self {
        let unit = Coord::MAX.div_u64(n as u64);
        let peers = (0..n)
            .map(|i| SimPeer {
                id: format!("peer-{i}"),
                coord: unit.saturating_mul_u64(i as u64),
                alive: true,
                successors: Vec::new(),
                predecessors: Vec::new(),
            })
            .collect();
        Self { peers, m }
    }

    pub fn alive_count(&self) -> usize {
        self.peers.iter().filter(|p| p.alive).count()
    }

    pub fn alive_indices(&self) -> Vec<usize> {
        (0..self.peers.len()).filter(|&i| self.peers[i].alive).collect()
    }

    fn alive_neighbors(&self, idx: usize, right: bool, k: usize) -> Vec<usize> {
        let n = self.peers.len();
        let mut out = Vec::with_capacity(k);
        for step in 1..n {
            let candidate = if right {
                (idx + step) % n
            } else {
                (idx + n - step) % n
            };
            if candidate == idx {
                continue;
            }
            if self.peers[candidate].alive {
                out.push(candidate);
                if out.len() == k {
                    break;
                }
            }
        }
        out
    }

    /// Full S/P bidirectional merge between each live peer and its
    /// `m`-sized neighborhood, then prune entries whose ids no longer map
    /// to live peers (§4.12 "Stabilization ticks").
    pub fn stabilize(&mut self) {
        let m = self.m;
        let mut updates = Vec::with_capacity(self.peers.len());
        for idx in self.alive_indices() {
            updates.push((idx, self.alive_neighbors(idx, true, m), self.alive_neighbors(idx, false, m)));
        }
        for (idx, successors, predecessors) in updates {
            self.peers[idx].successors = successors;
            self.peers[idx].predecessors = predecessors;
        }
        let alive: Vec<bool> = self.peers.iter().map(|p| p.alive).collect();
        let peers_alive_at = |idx: usize| alive.get(idx).copied().unwrap_or(false);
        for peer in &mut self.peers {
            peer.successors.retain(|&i| peers_alive_at(i));
            peer.predecessors.retain(|&i| peers_alive_at(i));
        }
    }

    fn peers_alive_at(&self, idx: usize) -> bool {
        self.peers.get(idx).map(|p| p.alive).unwrap_or(false)
    }

    /// Greedy ring routing from `from` toward `key`, bounded by
    /// `ceil(2*log2(alive)) + 4` hops (§4.12 "`handleRoute`"). Returns the
    /// hop count on success, `None` if the bound was exceeded.
    pub fn route(&self, from: usize, key: Coord) -> Option<usize> {
        let alive = self.alive_count().max(1);
        let bound = (2.0 * (alive as f64).log2()).ceil() as usize + 4;

        let mut current = from;
        let mut visited = std::collections::HashSet::new();
        visited.insert(current);

        for hop in 0..bound {
            if self.is_in_cluster(current, key) {
                return Some(hop);
            }
            let next = self.next_hop(current, key, &visited)?;
            visited.insert(next);
            current = next;
        }
        None
    }

    fn is_in_cluster(&self, idx: usize, key: Coord) -> bool {
        let peer = &self.peers[idx];
        let mut all: Vec<usize> = peer.successors.iter().chain(peer.predecessors.iter()).cloned().collect();
        all.push(idx);
        all.sort_by_key(|&i| self.peers[i].coord.xor_distance(&key).as_bytes().to_vec());
        all.first() == Some(&idx) || all.get(1) == Some(&idx)
    }

    fn next_hop(&self, idx: usize, key: Coord, visited: &std::collections::HashSet<usize>) -> Option<usize> {
        let peer = &self.peers[idx];
        peer.successors
            .iter()
            .chain(peer.predecessors.iter())
            .filter(|&&c| !visited.contains(&c))
            .min_by(|&&a, &&b| {
                self.peers[a]
                    .coord
                    .xor_distance(&key)
                    .as_bytes()
                    .cmp(self.peers[b].coord.xor_distance(&key).as_bytes())
            })
            .copied()
    }

    /// `|alive ids in S∪P| / min(2m, alive-1)` for one peer, mean across
    /// live peers is the reported metric (§4.12 "Coverage").
    pub fn coverage(&self, idx: usize) -> f64 {
        let alive = self.alive_count();
        if alive <= 1 {
            return 1.0;
        }
        let denom = (2 * self.m).min(alive - 1) as f64;
        if denom <= 0.0 {
            return 1.0;
        }
        let peer = &self.peers[idx];
        let present = peer
            .successors
            .iter()
            .chain(peer.predecessors.iter())
            .filter(|&&i| self.peers[i].alive)
            .count();
        (present as f64 / denom).min(1.0)
    }

    pub fn mean_coverage(&self) -> f64 {
        let alive = self.alive_indices();
        if alive.is_empty() {
            return 1.0;
        }
        alive.iter().map(|&i| self.coverage(i)).sum::<f64>() / alive.len() as f64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_evenly_spaced_coords_are_distinct() {
        let mesh = Mesh::new(10, 2);
        let mut coords: Vec<Coord> = mesh.peers.iter().map(|p| p.coord).collect();
        coords.sort();
        coords.dedup();
        assert_eq!(coords.len(), 10);
    }

    #[test]
    fn test_stabilize_builds_symmetric_sp_sets() {
        let mut mesh = Mesh::new(8, 2);
        mesh.stabilize();
        for peer in &mesh.peers {
            assert_eq!(peer.successors.len(), 2);
            assert_eq!(peer.predecessors.len(), 2);
        }
    }

    #[test]
    fn test_route_reaches_cluster_within_hop_bound() {
        let mut mesh = Mesh::new(20, 3);
        mesh.stabilize();
        let key = mesh.peers[10].coord;
        let hops = mesh.route(0, key);
        assert!(hops.is_some(), "route should succeed on a fully stabilized ring");
        let bound = (2.0 * 20f64.log2()).ceil() as usize + 4;
        assert!(hops.unwrap() <= bound);
    }

    #[test]
    fn test_coverage_drops_after_batched_departure() {
        let mut mesh = Mesh::new(30, 3);
        mesh.stabilize();
        let before = mesh.mean_coverage();
        for i in 0..9 {
            mesh.peers[i].alive = false;
        }
        mesh.stabilize();
        let after = mesh.mean_coverage();
        assert!(after <= before + 1e-9);
    }
}
