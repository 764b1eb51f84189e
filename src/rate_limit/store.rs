use crate::clock::{Clock, SystemClock};
use crate::rate_limit::token_bucket::BucketState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Abstract storage interface for rate limit state.
///
/// Models a network key-value store with per-key expiry (Redis being the
/// canonical backend). All cross-request state lives here; engines hold only a
/// transient copy for the duration of one decision.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Atomically increment the counter at `key`, creating it at 1 if absent.
    ///
    /// Returns the post-increment value. An existing expiry is kept.
    async fn incr(&self, key: &str) -> Result<u64, Self::Error>;

    /// Expire `key` after `ttl_ms`. A missing key is not an error.
    async fn expire_ms(&self, key: &str, ttl_ms: u64) -> Result<(), Self::Error>;

    /// Fetch the bucket snapshot stored at `key`.
    async fn load_bucket(&self, key: &str) -> Result<Option<BucketState>, Self::Error>;

    /// Unconditionally overwrite the bucket at `key`, refreshing its expiry.
    async fn store_bucket(
        &self,
        key: &str,
        state: &BucketState,
        ttl_ms: u64,
    ) -> Result<(), Self::Error>;

    /// Write `next` only if the stored bucket still equals `expected`.
    ///
    /// * `expected = None`: succeed only if the key is absent (first write).
    /// * Records are compared with [`BucketState::same_snapshot`], so a record
    ///   that was read back can always be matched.
    ///
    /// The comparison and the write must be a single atomic step on the backend.
    /// Returns `Ok(true)` if the write happened, `Ok(false)` if a concurrent writer won.
    async fn swap_bucket(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        next: &BucketState,
        ttl_ms: u64,
    ) -> Result<bool, Self::Error>;
}

/// Errors raised by [`InMemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InMemoryStoreError {
    /// A counter key was used as a bucket or vice versa.
    #[error("key `{key}` holds a value of the wrong type")]
    WrongType {
        /// Offending key.
        key: String,
    },
}

#[derive(Debug, Clone)]
enum Value {
    Counter(u64),
    Bucket(BucketState),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Writes between two sweeps of expired entries.
const SWEEP_EVERY: u64 = 64;

/// In-memory store with TTL expiry.
///
/// Every operation runs under one mutex, which makes `incr` and `swap_bucket`
/// atomic. Expiry is evaluated against the injected clock on access, so tests
/// driving a [`crate::ManualClock`] observe keys disappearing deterministically.
/// Every 64th write also drops all expired entries, so keys that
/// are never touched again (past fixed windows) do not pile up.
/// Clones share the same data.
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
    writes: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate expiry against `clock` instead of the wall clock.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            writes: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(clock),
        }
    }

    /// Whether `key` holds a live (unexpired) value.
    pub fn exists(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        purge_expired(&mut guard, key, now);
        guard.contains_key(key)
    }

    /// Milliseconds until `key` expires; `None` if absent or without expiry.
    pub fn ttl_remaining_ms(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        purge_expired(&mut guard, key, now);
        guard.get(key).and_then(|e| e.expires_at).map(|at| at.saturating_sub(now))
    }

    /// Current value of a counter key.
    pub fn counter(&self, key: &str) -> Option<u64> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        purge_expired(&mut guard, key, now);
        match guard.get(key).map(|e| &e.value) {
            Some(Value::Counter(n)) => Some(*n),
            _ => None,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        guard.retain(|_, e| !e.is_expired(now));
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic elsewhere cannot leave an entry half-written; keep serving.
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expiry(&self, ttl_ms: u64) -> Option<u64> {
        Some(self.clock.now_millis().saturating_add(ttl_ms))
    }

    fn note_write(&self, map: &mut HashMap<String, Entry>, now: u64) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            map.retain(|_, e| !e.is_expired(now));
        }
    }
}

fn purge_expired(map: &mut HashMap<String, Entry>, key: &str, now: u64) {
    if map.get(key).is_some_and(|e| e.is_expired(now)) {
        map.remove(key);
    }
}

fn wrong_type(key: &str) -> InMemoryStoreError {
    InMemoryStoreError::WrongType { key: key.to_string() }
}

fn current_bucket<'a>(
    map: &'a HashMap<String, Entry>,
    key: &str,
) -> Result<Option<&'a BucketState>, InMemoryStoreError> {
    match map.get(key).map(|e| &e.value) {
        None => Ok(None),
        Some(Value::Bucket(state)) => Ok(Some(state)),
        Some(Value::Counter(_)) => Err(wrong_type(key)),
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    type Error = InMemoryStoreError;

    async fn incr(&self, key: &str) -> Result<u64, Self::Error> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        purge_expired(&mut guard, key, now);
        let entry = guard
            .entry(key.to_string())
            .or_insert(Entry { value: Value::Counter(0), expires_at: None });
        let count = match &mut entry.value {
            Value::Counter(n) => {
                *n += 1;
                *n
            }
            Value::Bucket(_) => return Err(wrong_type(key)),
        };
        self.note_write(&mut guard, now);
        Ok(count)
    }

    async fn expire_ms(&self, key: &str, ttl_ms: u64) -> Result<(), Self::Error> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry(ttl_ms);
        let mut guard = self.lock();
        purge_expired(&mut guard, key, now);
        if let Some(entry) = guard.get_mut(key) {
            entry.expires_at = expires_at;
        }
        Ok(())
    }

    async fn load_bucket(&self, key: &str) -> Result<Option<BucketState>, Self::Error> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        purge_expired(&mut guard, key, now);
        let state = current_bucket(&guard, key)?.cloned();
        Ok(state)
    }

    async fn store_bucket(
        &self,
        key: &str,
        state: &BucketState,
        ttl_ms: u64,
    ) -> Result<(), Self::Error> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry(ttl_ms);
        let mut guard = self.lock();
        guard.insert(key.to_string(), Entry { value: Value::Bucket(state.clone()), expires_at });
        self.note_write(&mut guard, now);
        Ok(())
    }

    async fn swap_bucket(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        next: &BucketState,
        ttl_ms: u64,
    ) -> Result<bool, Self::Error> {
        let now = self.clock.now_millis();
        let expires_at = self.expiry(ttl_ms);
        let mut guard = self.lock();
        purge_expired(&mut guard, key, now);

        let unchanged = match (current_bucket(&guard, key)?, expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => current.same_snapshot(expected),
            _ => false,
        };
        if !unchanged {
            return Ok(false); // Race detected
        }

        guard.insert(key.to_string(), Entry { value: Value::Bucket(next.clone()), expires_at });
        self.note_write(&mut guard, now);
        Ok(true)
    }
}
