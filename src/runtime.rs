//! Host runtime capabilities (§1): the four externally-supplied abilities
//! this crate never implements itself — framed request/reply, protocol
//! handler registration, connect/disconnect notification, and stable peer
//! identifier hashing. [`crate::service::Service`] is generic over an
//! implementation of [`HostRuntime`].

use crate::ring::Coord;
use crate::service::config::Protocol;

/// A host-supplied byte-stream reply: exactly one framed payload per
/// request, as seen by the handler that produced it (§6 "Wire format").
pub type Frame = Vec<u8>;

/// The externally-supplied capabilities a [`crate::service::Service`] is
/// built on top of (§1, capabilities 1-4). Implemented by the embedding
/// application; never by this crate.
pub trait HostRuntime {
    /// Send a framed request to `peer_id` on `protocol` and block for the
    /// framed reply, or `None` on any transport-level failure (§7
    /// "Propagation policy": these never propagate as errors).
    fn send(&mut self, peer_id: &str, protocol: Protocol, body: Frame) -> Option<Frame>;

    /// Register this service's handler for `protocol`, namespaced under
    /// `network_name` at the host's discretion (§4.10 "Startup").
    fn register_handler(&mut self, protocol: Protocol);

    /// True if the host currently holds a live connection to `peer_id`
    /// (§4.1 "PeerState").
    fn is_connected(&self, peer_id: &str) -> bool;

    /// Stable peer-id -> ring-coordinate hashing (§1 capability 4).
    fn coord_of(&self, peer_id: &str) -> Coord {
        crate::service::config::coord_of(peer_id)
    }
}
