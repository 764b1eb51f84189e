//! Convenient re-exports for common tollgate types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    error::{AdmissionError, ConfigError, StoreError},
    rate_limit::{
        apply_headers, client_key, evaluate, AdmissionLayer, AdmissionService, ClientKey,
        Consistency, Decision, FixedWindow, FixedWindowConfig, InMemoryStore, PeerAddr,
        RateLimiter, Rejection, SharedStore, TokenBucket, TokenBucketConfig, Verdict,
    },
};
