//! Store key derivation.
//!
//! Fixed window keys embed the window index, so a counter is never consulted
//! outside its own window; stale windows simply expire. Token bucket keys are
//! stable per client.

use super::ClientKey;
use std::num::NonZeroU64;

const FIXED_WINDOW_PREFIX: &str = "fixed-window:";
const TOKEN_BUCKET_PREFIX: &str = "rate-limit:";

/// Index of the window containing `now_ms`.
pub fn window_index(window_ms: NonZeroU64, now_ms: u64) -> u64 {
    now_ms / window_ms
}

/// `fixed-window:<client>:<windowIndex>`
pub fn fixed_window_key(client: &ClientKey, window_ms: NonZeroU64, now_ms: u64) -> String {
    format!("{}{}:{}", FIXED_WINDOW_PREFIX, client, window_index(window_ms, now_ms))
}

/// `rate-limit:<client>`
pub fn token_bucket_key(client: &ClientKey) -> String {
    format!("{}{}", TOKEN_BUCKET_PREFIX, client)
}
