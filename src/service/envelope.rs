//! RPC envelope (C9): the outer shape every protocol handler follows —
//! bounded read, decode, timestamp validation, rate limiting.

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::service::limiter::TokenBucket;
use nakamoto_net::LocalTime;

/// Idle gap after which a stream with no remote-close signal is treated as
/// end-of-message, to work around multiplexers that don't surface
/// remote-close as EOF (§4.9 step 1).
pub const READ_IDLE_TIMEOUT_MS: u64 = 100;

/// Maximum allowed clock drift between a message's timestamp and now
/// (§4.9 step 3, P5).
pub const TIMESTAMP_WINDOW_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("payload exceeds the per-protocol byte limit")]
    PayloadTooLarge,
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// One inbound chunk, paired with the number of milliseconds elapsed since
/// the previous chunk (0 for the first chunk).
pub type Chunk = (Vec<u8>, u64);

/// Accumulate chunks from an inbound byte stream, aborting if the
/// cumulative byte count would exceed `max_bytes`, and treating an idle gap
/// of more than [`READ_IDLE_TIMEOUT_MS`] after the first chunk as
/// end-of-message (§4.9 step 1, P6).
pub fn read_all_bounded(
    chunks: impl IntoIterator<Item = Chunk>,
    max_bytes: usize,
) -> Result<Vec<u8>, EnvelopeError> {
    let mut buf = Vec::new();
    let mut first = true;
    for (chunk, gap_ms) in chunks {
        if !first && gap_ms > READ_IDLE_TIMEOUT_MS {
            break;
        }
        first = false;
        buf.extend_from_slice(&chunk);
        if buf.len() > max_bytes {
            return Err(EnvelopeError::PayloadTooLarge);
        }
    }
    Ok(buf)
}

/// Decode one framed JSON object (§4.9 step 2).
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EnvelopeError> {
    serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

/// `|now_ms - ts_ms| <= window_ms` (§4.9 step 3, P5).
pub fn validate_timestamp(now_ms: u64, ts_ms: u64, window_ms: u64) -> bool {
    let delta = if now_ms >= ts_ms {
        now_ms - ts_ms
    } else {
        ts_ms - now_ms
    };
    delta <= window_ms
}

/// Outcome of the rate-limit step (§4.9 step 4).
pub enum RateLimitOutcome {
    Allowed,
    Limited { retry_after_ms: u64 },
}

pub fn rate_limit(bucket: &mut TokenBucket, now: LocalTime) -> RateLimitOutcome {
    if bucket.try_take(now) {
        RateLimitOutcome::Allowed
    } else {
        RateLimitOutcome::Limited {
            retry_after_ms: bucket.retry_after_ms(now),
        }
    }
}
