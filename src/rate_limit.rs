//! Rate limiting primitives.
//!
//! This module provides the building blocks for admission control:
//! - [`RateLimiter`]: The core trait for rate limiting logic.
//! - [`AdmissionLayer`]: Tower middleware that enforces the limit.
//! - [`Decision`]: The result of a rate limit check.
//!
//! # Architecture
//!
//! The system is designed to be modular:
//! - **Middleware**: `AdmissionLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should ask a `RateLimiter` about a [`ClientKey`].
//! - **Logic**: [`FixedWindow`] and [`TokenBucket`] handle the math.
//! - **Storage**: [`SharedStore`] (in `store` module) holds all state, so every process
//!   talking to the same backend enforces the same limit. Engines keep nothing between calls.

use crate::error::StoreError;
use std::fmt;

pub mod fixed_window;
pub mod keys;
pub mod middleware;
pub mod store;
pub mod token_bucket;

pub use fixed_window::{FixedWindow, FixedWindowConfig};
pub use keys::{fixed_window_key, token_bucket_key, window_index};
pub use middleware::{
    apply_headers, client_key, evaluate, AdmissionLayer, AdmissionService, PeerAddr, Rejection,
    Verdict,
};
pub use store::{InMemoryStore, InMemoryStoreError, SharedStore};
pub use token_bucket::{BucketState, Consistency, TokenBucket, TokenBucketConfig};

/// Opaque, non-empty identifier used to partition limiter state per caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Build a key, rejecting empty or whitespace-only input.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.len() == raw.len() {
            Some(Self(raw))
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The decision returned by a rate limiter.
///
/// Every field is reported on denials as well as admissions so callers can
/// emit the `X-RateLimit-*` headers unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Configured capacity.
    pub limit: u64,
    /// Permits left after this decision.
    pub remaining: u64,
    /// Seconds reported in `X-RateLimit-Reset`; meaning depends on the strategy.
    pub reset_seconds: u64,
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Core interface for rate limiting logic.
///
/// This trait decouples the middleware from the strategy (Token Bucket, Fixed Window)
/// and the storage (memory, Redis). Implementations read "now" from their own clock.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether `client` may proceed, consuming one permit if so.
    async fn check(&self, client: &ClientKey) -> Result<Decision, StoreError>;
}
