use nakamoto_net::LocalTime;

use crate::clock::RefClock;
use crate::digitree::Digitree;
use crate::ring::Coord;
use crate::service::config::Config;
use crate::service::Service;

pub fn coord_at(byte: u8) -> Coord {
    let mut bytes = [0u8; 32];
    bytes[0] = byte;
    Coord::from_bytes(bytes)
}

/// A [`Digitree`] populated with `n` evenly-spaced synthetic peers, for
/// tests exercising neighbor walks and eviction directly.
pub fn populated_tree(n: u8, capacity: usize) -> Digitree {
    let mut tree = Digitree::new(capacity);
    for i in 0..n {
        tree.upsert(format!("peer-{i}"), coord_at(i));
    }
    tree
}

/// A [`Service`] with a fresh clock at `t=0` and the given id, for tests
/// driving the state machine end to end.
pub fn service_with_id(id: &str) -> Service {
    let clock: RefClock = LocalTime::from_secs(0).into();
    Service::new(Config::default(), id, clock)
}
