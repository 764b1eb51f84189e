#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tollgate::{BucketState, ClientKey, SharedStore};

pub fn client(raw: &str) -> ClientKey {
    ClientKey::new(raw).expect("non-empty client key")
}

/// Delegating store that yields to the scheduler before every operation.
///
/// On a current-thread runtime this interleaves concurrent deciders between
/// their load and their write, which is where lost updates happen.
#[derive(Clone, Debug)]
pub struct YieldingStore<S> {
    inner: S,
}

impl<S> YieldingStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: SharedStore> SharedStore for YieldingStore<S> {
    type Error = S::Error;

    async fn incr(&self, key: &str) -> Result<u64, Self::Error> {
        tokio::task::yield_now().await;
        self.inner.incr(key).await
    }

    async fn expire_ms(&self, key: &str, ttl_ms: u64) -> Result<(), Self::Error> {
        tokio::task::yield_now().await;
        self.inner.expire_ms(key, ttl_ms).await
    }

    async fn load_bucket(&self, key: &str) -> Result<Option<BucketState>, Self::Error> {
        tokio::task::yield_now().await;
        self.inner.load_bucket(key).await
    }

    async fn store_bucket(
        &self,
        key: &str,
        state: &BucketState,
        ttl_ms: u64,
    ) -> Result<(), Self::Error> {
        tokio::task::yield_now().await;
        self.inner.store_bucket(key, state, ttl_ms).await
    }

    async fn swap_bucket(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        next: &BucketState,
        ttl_ms: u64,
    ) -> Result<bool, Self::Error> {
        tokio::task::yield_now().await;
        self.inner.swap_bucket(key, expected, next, ttl_ms).await
    }
}

/// Store whose every operation fails as if the backend were unreachable.
#[derive(Clone, Debug, Default)]
pub struct FailingStore {
    calls: Arc<AtomicUsize>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T, std::io::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"))
    }
}

#[async_trait]
impl SharedStore for FailingStore {
    type Error = std::io::Error;

    async fn incr(&self, _key: &str) -> Result<u64, Self::Error> {
        self.fail()
    }

    async fn expire_ms(&self, _key: &str, _ttl_ms: u64) -> Result<(), Self::Error> {
        self.fail()
    }

    async fn load_bucket(&self, _key: &str) -> Result<Option<BucketState>, Self::Error> {
        self.fail()
    }

    async fn store_bucket(
        &self,
        _key: &str,
        _state: &BucketState,
        _ttl_ms: u64,
    ) -> Result<(), Self::Error> {
        self.fail()
    }

    async fn swap_bucket(
        &self,
        _key: &str,
        _expected: Option<&BucketState>,
        _next: &BucketState,
        _ttl_ms: u64,
    ) -> Result<bool, Self::Error> {
        self.fail()
    }
}
