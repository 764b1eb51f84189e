#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tollgate
//!
//! Cluster-wide request admission control for async Rust. Every process that
//! shares a store enforces the same per-client limit.
//!
//! ## Features
//!
//! - **Fixed window counter**: one atomic increment per decision, self-expiring keys
//! - **Token bucket**: continuous refill with compare-and-swap commits
//! - **Shared store abstraction** with an in-memory TTL store (and Redis in `tollgate-redis`)
//! - **Tower middleware** emitting `X-RateLimit-*` headers and 400/429/500 outcomes
//! - **Injectable clocks** for deterministic window and refill tests
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{ClientKey, InMemoryStore, RateLimiter, TokenBucket, TokenBucketConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TokenBucketConfig::new(3, 1.0, 60_000).unwrap();
//!     let limiter = TokenBucket::new(InMemoryStore::new(), config).unwrap();
//!
//!     let client = ClientKey::new("203.0.113.7").unwrap();
//!     let decision = limiter.check(&client).await.unwrap();
//!     assert!(decision.is_allowed());
//!     assert_eq!(decision.remaining, 2);
//! }
//! ```

pub mod clock;
pub mod error;
pub mod prelude;
pub mod rate_limit;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AdmissionError, BoxError, ConfigError, StoreError};
pub use rate_limit::{
    AdmissionLayer, AdmissionService, BucketState, ClientKey, Consistency, Decision, FixedWindow,
    FixedWindowConfig, InMemoryStore, InMemoryStoreError, RateLimiter, SharedStore, TokenBucket,
    TokenBucketConfig,
};
