//! Fixed window counter.
//!
//! One atomic increment per decision against a key that embeds the window
//! index. The counter's TTL is set when the increment returns 1, so each
//! window's counter cleans itself up without a sweep.
//!
//! The expiry is a second store call and is not atomic with the increment.
//! Concurrent first requests may each see a count of 1 and each set the same
//! TTL, which is harmless.

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, StoreError};
use crate::rate_limit::keys::fixed_window_key;
use crate::rate_limit::store::SharedStore;
use crate::rate_limit::{ClientKey, Decision, RateLimiter};
use async_trait::async_trait;
use serde::Deserialize;
use std::num::NonZeroU64;
use std::sync::Arc;

/// Configuration for [`FixedWindow`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FixedWindowConfig {
    capacity: u64,
    window_ms: u64,
    debug: bool,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self { capacity: 3, window_ms: 60 * 1000, debug: false }
    }
}

impl FixedWindowConfig {
    /// Create a config with validation. A capacity of 0 denies every request.
    pub fn new(capacity: u64, window_ms: u64) -> Result<Self, ConfigError> {
        let cfg = Self { capacity, window_ms, debug: false };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Log every decision at `info` instead of `trace`. No effect on admission.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.window().map(|_| ())
    }

    /// Window length as a divisor; a zero window is rejected.
    pub fn window(&self) -> Result<NonZeroU64, ConfigError> {
        NonZeroU64::new(self.window_ms)
            .ok_or(ConfigError::InvalidWindow { provided: self.window_ms })
    }

    /// Requests admitted per window.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

/// Fixed window counter limiter backed by a [`SharedStore`].
pub struct FixedWindow<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    config: FixedWindowConfig,
    window: NonZeroU64,
}

impl<S> std::fmt::Debug for FixedWindow<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindow")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<S> FixedWindow<S>
where
    S: SharedStore + 'static,
{
    /// Create a limiter using the wall clock.
    pub fn new(store: S, config: FixedWindowConfig) -> Result<Self, ConfigError> {
        let window = config.window()?;
        Ok(Self { store: Arc::new(store), clock: Arc::new(SystemClock), config, window })
    }

    /// Replace the time source used by [`RateLimiter::check`].
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &FixedWindowConfig {
        &self.config
    }

    /// Decide for `client` as of `now_ms`.
    pub async fn decide(&self, client: &ClientKey, now_ms: u64) -> Result<Decision, StoreError> {
        let key = fixed_window_key(client, self.window, now_ms);
        let count = self.store.incr(&key).await.map_err(StoreError::new)?;

        if count == 1 {
            self.store.expire_ms(&key, self.config.window_ms).await.map_err(StoreError::new)?;
        }

        let capacity = self.config.capacity;
        let allowed = count <= capacity;

        if self.config.debug {
            tracing::info!(client = %client, count, capacity, allowed, "fixed window decision");
        } else {
            tracing::trace!(client = %client, count, capacity, allowed, "fixed window decision");
        }

        Ok(Decision {
            allowed,
            limit: capacity,
            remaining: capacity.saturating_sub(count),
            // Full window length, not the time left in the current window.
            reset_seconds: self.config.window_ms.div_ceil(1000),
        })
    }
}

#[async_trait]
impl<S> RateLimiter for FixedWindow<S>
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
        ClientKey::new("203.0.113.9").unwrap()
    }

    #[test]
    fn zero_window_is_rejected() {
        assert_eq!(
            FixedWindowConfig::new(3, 0).unwrap_err(),
            ConfigError::InvalidWindow { provided: 0 }
        );
        let cfg: FixedWindowConfig = serde_json::from_str(r#"{"windowMs":0}"#).unwrap();
        assert_eq!(cfg.window(), Err(ConfigError::InvalidWindow { provided: 0 }));
        assert!(FixedWindow::new(InMemoryStore::new(), cfg).is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: FixedWindowConfig =
            serde_json::from_str(r#"{"capacity":5,"debug":true}"#).unwrap();
        assert_eq!(cfg.capacity(), 5);
        assert_eq!(cfg.window_ms(), 60_000);
        assert!(cfg.debug());
    }

    #[tokio::test]
    async fn first_request_sets_window_ttl() {
        let clock = ManualClock::new(1_000);
        let store = InMemoryStore::with_clock(clock.clone());
        let limiter =
            FixedWindow::new(store.clone(), FixedWindowConfig::new(3, 10_000).unwrap()).unwrap();

        limiter.decide(&client(), 1_000).await.unwrap();
        let key = fixed_window_key(&client(), limiter.config().window().unwrap(), 1_000);
        assert_eq!(store.ttl_remaining_ms(&key), Some(10_000));

        clock.advance(4_000);
        limiter.decide(&client(), 5_000).await.unwrap();
        assert_eq!(store.ttl_remaining_ms(&key), Some(6_000), "later hits must not extend the TTL");
    }

    #[tokio::test]
    async fn reports_full_window_as_reset() {
        let limiter =
            FixedWindow::new(InMemoryStore::new(), FixedWindowConfig::new(3, 1_500).unwrap())
                .unwrap();
        let d = limiter.decide(&client(), 0).await.unwrap();
        assert_eq!(d, Decision { allowed: true, limit: 3, remaining: 2, reset_seconds: 2 });
    }

    #[tokio::test]
    async fn zero_capacity_denies_everything() {
        let limiter =
            FixedWindow::new(InMemoryStore::new(), FixedWindowConfig::new(0, 1_000).unwrap())
                .unwrap();
        let d = limiter.decide(&client(), 0).await.unwrap();
        assert!(!d.is_allowed());
        assert_eq!(d.remaining, 0);
        assert_eq!(d.limit, 0);
    }

    #[tokio::test]
    async fn check_reads_injected_clock() {
        let clock = ManualClock::new(0);
        let limiter = FixedWindow::new(
            InMemoryStore::with_clock(clock.clone()),
            FixedWindowConfig::new(1, 1_000).unwrap(),
        )
        .unwrap()
        .with_clock(clock.clone());

        assert!(limiter.check(&client()).await.unwrap().is_allowed());
        assert!(!limiter.check(&client()).await.unwrap().is_allowed());
        clock.advance(1_000);
        assert!(limiter.check(&client()).await.unwrap().is_allowed());
    }
}
