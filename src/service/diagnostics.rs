//! Diagnostics counters (§4.9, §4.11, §7). Not named by spec.md's module
//! table, but referenced throughout as `diagnostics.rejected.*` and as the
//! `pingsSent`/`announcementsSent` counters of scenario 5; this gives them
//! a home, in the spirit of the teacher's `service::Metrics` struct.

/// Counts of rejected requests, broken down by reason (§4.9, §7).
#[derive(Debug, Clone, Default)]
pub struct Rejected {
    pub payload_too_large: u64,
    pub timestamp_bounds: u64,
    pub ttl_expired: u64,
    pub rate_limited: u64,
    pub malformed_message: u64,
}

/// Transient peer-fault counters, logged rather than surfaced to callers
/// (§7 "Propagation policy").
#[derive(Debug, Clone, Default)]
pub struct PeerFaults {
    pub peer_unreachable: u64,
    pub stream_closed_early: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub rejected: Rejected,
    pub peer_faults: PeerFaults,
    pub pings_sent: u64,
    pub announcements_sent: u64,
    pub discovery_events: u64,
}
