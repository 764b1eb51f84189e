//! Token bucket with continuous refill.
//!
//! Each decision is a read-modify-write over a persisted [`BucketState`]:
//! load (or create full), refill by elapsed wall-clock time, take one token if
//! available, persist with the idle TTL refreshed. How that cycle is made safe
//! against concurrent deciders is selected by [`Consistency`].

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, StoreError};
use crate::rate_limit::keys::token_bucket_key;
use crate::rate_limit::store::SharedStore;
use crate::rate_limit::{ClientKey, Decision, RateLimiter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persisted bucket snapshot, one per client.
///
/// Serialized with camelCase names (`tokens`, `capacity`, `refillRate`,
/// `lastRefillTimestamp`) so other services can read the same records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketState {
    pub tokens: f64,
    pub capacity: u64,
    /// Tokens per second.
    pub refill_rate: f64,
    /// Epoch milliseconds of the last refill.
    pub last_refill_timestamp: u64,
}

impl BucketState {
    /// A freshly observed client starts with a full bucket.
    pub fn full(capacity: u64, refill_rate: f64, now_ms: u64) -> Self {
        Self { tokens: capacity as f64, capacity, refill_rate, last_refill_timestamp: now_ms }
    }

    /// Add tokens for the time elapsed since the last refill, clamped to `[0, capacity]`.
    ///
    /// A clock reading earlier than the stored timestamp adds nothing and keeps
    /// the stored timestamp.
    pub fn refill(&mut self, now_ms: u64) {
        let elapsed_secs = now_ms.saturating_sub(self.last_refill_timestamp) as f64 / 1000.0;
        let refilled = self.tokens + elapsed_secs * self.refill_rate;
        // `max` first so NaN tokens collapse to 0.
        self.tokens = refilled.max(0.0).min(self.capacity as f64);
        self.last_refill_timestamp = self.last_refill_timestamp.max(now_ms);
    }

    /// Field-wise bitwise equality, the comparison used by compare-and-swap.
    ///
    /// Unlike `==`, a record holding NaN tokens matches itself, so a corrupt
    /// record can still be replaced by its refilled successor.
    pub fn same_snapshot(&self, other: &Self) -> bool {
        self.tokens.to_bits() == other.tokens.to_bits()
            && self.capacity == other.capacity
            && self.refill_rate.to_bits() == other.refill_rate.to_bits()
            && self.last_refill_timestamp == other.last_refill_timestamp
    }

    /// Take one token if a whole one is available.
    pub fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whole tokens left.
    pub fn remaining(&self) -> u64 {
        self.tokens.floor() as u64
    }

    /// Seconds until the bucket is full again (not until the next token).
    ///
    /// A zero refill rate never refills, which saturates to `u64::MAX`; a full
    /// bucket reports 0 regardless of rate.
    pub fn reset_seconds(&self) -> u64 {
        let missing = self.capacity as f64 - self.tokens;
        if missing <= 0.0 {
            return 0;
        }
        (missing / self.refill_rate).ceil() as u64
    }
}

/// How the load → refill → take → persist cycle is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Consistency {
    /// Commit with [`SharedStore::swap_bucket`] and retry until a swap lands.
    /// Never admits more than the bucket holds, however many processes race,
    /// and never denies while a token is available.
    #[default]
    Atomic,
    /// Plain read then overwrite. Concurrent deciders can read the same snapshot
    /// and each admit, so the limit may be exceeded. Only for stores without
    /// compare-and-swap.
    LastWriteWins,
}

/// Configuration for [`TokenBucket`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenBucketConfig {
    capacity: u64,
    refill_rate: f64,
    ttl_ms: u64,
    debug: bool,
    consistency: Consistency,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            refill_rate: 1.0,
            ttl_ms: 60 * 1000,
            debug: false,
            consistency: Consistency::Atomic,
        }
    }
}

impl TokenBucketConfig {
    /// Create a config with validation.
    ///
    /// `refill_rate` of 0 is legal: the bucket never replenishes.
    pub fn new(capacity: u64, refill_rate: f64, ttl_ms: u64) -> Result<Self, ConfigError> {
        let cfg = Self { capacity, refill_rate, ttl_ms, ..Self::default() };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Log every decision at `info` instead of `trace`. No effect on admission.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.refill_rate.is_finite() || self.refill_rate < 0.0 {
            return Err(ConfigError::InvalidRefillRate { provided: self.refill_rate });
        }
        if self.ttl_ms == 0 {
            return Err(ConfigError::InvalidTtl { provided: self.ttl_ms });
        }
        Ok(())
    }

    /// Maximum tokens held.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Idle expiry of a bucket, refreshed on every write.
    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }
}

/// A Token Bucket rate limiter.
///
/// Replenishes tokens at `refill_rate` per second, up to `capacity`, with
/// state kept per client in a [`SharedStore`].
pub struct TokenBucket<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: TokenBucketConfig,
}

impl<S> std::fmt::Debug for TokenBucket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<S> TokenBucket<S>
where
    S: SharedStore + 'static,
{
    /// Create a limiter using the wall clock.
    pub fn new(store: S, config: TokenBucketConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { store: Arc::new(store), clock: Arc::new(SystemClock), config })
    }

    /// Replace the time source used by [`RateLimiter::check`].
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Decide for `client` as of `now_ms`.
    pub async fn decide(&self, client: &ClientKey, now_ms: u64) -> Result<Decision, StoreError> {
        let key = token_bucket_key(client);
        let (state, allowed) = match self.config.consistency {
            Consistency::Atomic => self.cycle_atomic(&key, now_ms).await?,
            Consistency::LastWriteWins => self.cycle_last_write_wins(&key, now_ms).await?,
        };

        let tokens = state.tokens;
        if self.config.debug {
            tracing::info!(client = %client, tokens, allowed, "token bucket decision");
        } else {
            tracing::trace!(client = %client, tokens, allowed, "token bucket decision");
        }

        Ok(Decision {
            allowed,
            limit: self.config.capacity,
            remaining: state.remaining(),
            reset_seconds: state.reset_seconds(),
        })
    }

    /// Bring a loaded (or missing) snapshot up to `now_ms` under the current configuration.
    fn refilled(&self, loaded: Option<BucketState>, now_ms: u64) -> BucketState {
        let mut state = match loaded {
            Some(mut state) => {
                state.capacity = self.config.capacity;
                state.refill_rate = self.config.refill_rate;
                state
            }
            None => BucketState::full(self.config.capacity, self.config.refill_rate, now_ms),
        };
        state.refill(now_ms);
        state
    }

    async fn cycle_atomic(
        &self,
        key: &str,
        now_ms: u64,
    ) -> Result<(BucketState, bool), StoreError> {
        let mut conflicts: u32 = 0;

        // Optimistic locking loop. A lost swap means another decider committed,
        // so every round makes progress cluster-wide.
        loop {
            let loaded = self.store.load_bucket(key).await.map_err(StoreError::new)?;
            let mut next = self.refilled(loaded.clone(), now_ms);
            let allowed = next.try_take();
            if self
                .store
                .swap_bucket(key, loaded.as_ref(), &next, self.config.ttl_ms)
                .await
                .map_err(StoreError::new)?
            {
                if conflicts > 0 {
                    tracing::debug!(key, conflicts, "token bucket committed after contention");
                }
                return Ok((next, allowed));
            }
            // Race detected, loop again
            conflicts = conflicts.saturating_add(1);
        }
    }

    async fn cycle_last_write_wins(
        &self,
        key: &str,
        now_ms: u64,
    ) -> Result<(BucketState, bool), StoreError> {
        let loaded = self.store.load_bucket(key).await.map_err(StoreError::new)?;
        let mut state = self.refilled(loaded, now_ms);
        let allowed = state.try_take();
        self.store
            .store_bucket(key, &state, self.config.ttl_ms)
            .await
            .map_err(StoreError::new)?;
        Ok((state, allowed))
    }
}

#[async_trait]
impl<S> RateLimiter for TokenBucket<S>
where
    S: SharedStore + 'static,
{
    async fn check(&self, client: &ClientKey) -> Result<Decision, StoreError> {
        let now = self.clock.now_millis();
        self.decide(client, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::store::InMemoryStore;

    fn client() -> ClientKey {
        ClientKey::new("198.51.100.4").unwrap()
    }

    #[test]
    fn refill_is_proportional_and_clamped() {
        let mut state =
            BucketState { tokens: 0.0, capacity: 3, refill_rate: 2.0, last_refill_timestamp: 0 };
        state.refill(250);
        assert!((state.tokens - 0.5).abs() < 1e-9);
        state.refill(60_000);
        assert_eq!(state.tokens, 3.0);
        assert_eq!(state.last_refill_timestamp, 60_000);
    }

    #[test]
    fn backwards_clock_adds_nothing() {
        let mut state = BucketState {
            tokens: 1.0,
            capacity: 3,
            refill_rate: 1.0,
            last_refill_timestamp: 5_000,
        };
        state.refill(1_000);
        assert_eq!(state.tokens, 1.0);
        assert_eq!(state.last_refill_timestamp, 5_000);
    }

    #[test]
    fn nan_tokens_collapse_to_zero() {
        let mut state = BucketState {
            tokens: f64::NAN,
            capacity: 3,
            refill_rate: 1.0,
            last_refill_timestamp: 0,
        };
        assert!(state.same_snapshot(&state.clone()));
        assert_ne!(state, state.clone());
        state.refill(0);
        assert_eq!(state.tokens, 0.0);
    }

    #[test]
    fn reset_is_time_to_full() {
        let state =
            BucketState { tokens: 0.5, capacity: 3, refill_rate: 1.0, last_refill_timestamp: 0 };
        assert_eq!(state.reset_seconds(), 3);
        assert_eq!(state.remaining(), 0);

        let full = BucketState::full(3, 0.0, 0);
        assert_eq!(full.reset_seconds(), 0);

        let frozen =
            BucketState { tokens: 1.0, capacity: 3, refill_rate: 0.0, last_refill_timestamp: 0 };
        assert_eq!(frozen.reset_seconds(), u64::MAX);
    }

    #[test]
    fn state_serializes_camel_case() {
        let state = BucketState::full(3, 1.5, 42);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["refillRate"], 1.5);
        assert_eq!(json["lastRefillTimestamp"], 42);
        let back: BucketState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(matches!(
            TokenBucketConfig::new(3, -1.0, 1_000),
            Err(ConfigError::InvalidRefillRate { .. })
        ));
        assert!(matches!(
            TokenBucketConfig::new(3, f64::INFINITY, 1_000),
            Err(ConfigError::InvalidRefillRate { .. })
        ));
        assert_eq!(
            TokenBucketConfig::new(3, 1.0, 0).unwrap_err(),
            ConfigError::InvalidTtl { provided: 0 }
        );
        let cfg: TokenBucketConfig = serde_json::from_str(r#"{"ttlMs":0}"#).unwrap();
        assert!(TokenBucket::new(InMemoryStore::new(), cfg).is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: TokenBucketConfig =
            serde_json::from_str(r#"{"refillRate":0.5,"consistency":"lastWriteWins"}"#).unwrap();
        assert_eq!(cfg.capacity(), 3);
        assert_eq!(cfg.refill_rate(), 0.5);
        assert_eq!(cfg.ttl_ms(), 60_000);
        assert_eq!(cfg.consistency(), Consistency::LastWriteWins);
    }

    #[tokio::test]
    async fn denial_still_refreshes_ttl() {
        let clock = ManualClock::new(0);
        let store = InMemoryStore::with_clock(clock.clone());
        let limiter =
            TokenBucket::new(store.clone(), TokenBucketConfig::new(1, 0.0, 1_000).unwrap())
                .unwrap();
        let key = token_bucket_key(&client());

        assert!(limiter.decide(&client(), 0).await.unwrap().is_allowed());
        clock.advance(900);
        assert!(!limiter.decide(&client(), 900).await.unwrap().is_allowed());
        assert_eq!(store.ttl_remaining_ms(&key), Some(1_000));
    }

    #[tokio::test]
    async fn idle_bucket_expires_and_restarts_full() {
        let clock = ManualClock::new(0);
        let store = InMemoryStore::with_clock(clock.clone());
        let limiter =
            TokenBucket::new(store.clone(), TokenBucketConfig::new(2, 0.0, 1_000).unwrap())
                .unwrap();

        limiter.decide(&client(), 0).await.unwrap();
        limiter.decide(&client(), 0).await.unwrap();
        assert!(!limiter.decide(&client(), 0).await.unwrap().is_allowed());

        clock.advance(1_000);
        assert!(!store.exists(&token_bucket_key(&client())));
        let d = limiter.decide(&client(), 1_000).await.unwrap();
        assert!(d.is_allowed());
        assert_eq!(d.remaining, 1);
    }

    #[tokio::test]
    async fn corrupt_record_is_replaced_instead_of_spinning() {
        let store = InMemoryStore::new();
        let key = token_bucket_key(&client());
        let corrupt = BucketState {
            tokens: f64::NAN,
            capacity: 3,
            refill_rate: 1.0,
            last_refill_timestamp: 0,
        };
        store.store_bucket(&key, &corrupt, 60_000).await.unwrap();

        let limiter =
            TokenBucket::new(store.clone(), TokenBucketConfig::new(3, 1.0, 60_000).unwrap())
                .unwrap();
        let d = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            limiter.decide(&client(), 0),
        )
        .await
        .expect("compare-and-swap against a NaN record must commit")
        .unwrap();
        assert!(!d.is_allowed());

        let stored = store.load_bucket(&key).await.unwrap().unwrap();
        assert_eq!(stored.tokens, 0.0);
    }

    #[tokio::test]
    async fn lowered_capacity_clamps_stored_tokens() {
        let store = InMemoryStore::new();
        let key = token_bucket_key(&client());
        store.store_bucket(&key, &BucketState::full(10, 1.0, 0), 60_000).await.unwrap();

        let limiter =
            TokenBucket::new(store.clone(), TokenBucketConfig::new(2, 1.0, 60_000).unwrap())
                .unwrap();
        let d = limiter.decide(&client(), 0).await.unwrap();
        assert_eq!(d, Decision { allowed: true, limit: 2, remaining: 1, reset_seconds: 1 });
        let stored = store.load_bucket(&key).await.unwrap().unwrap();
        assert_eq!(stored.capacity, 2);
        assert_eq!(stored.tokens, 1.0);
    }
}
