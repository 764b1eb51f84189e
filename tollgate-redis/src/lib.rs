//! Redis shared store for `tollgate` (companion crate).
//! Bring your own `redis::aio::ConnectionManager`; counters are plain integers
//! and buckets are JSON strings, both with millisecond expiries.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;
use thiserror::Error;
use tollgate::{BucketState, SharedStore};

/// Compare-and-swap of a bucket record, executed atomically by Redis.
///
/// ARGV[1] is the expected record ('' for "key must be absent"), ARGV[2] the
/// new record, ARGV[3] the TTL in ms. Records are compared field by field after
/// decoding, so formatting differences between writers do not cause conflicts.
const SWAP_BUCKET_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
  if current then return 0 end
elseif not current then
  return 0
else
  local a = cjson.decode(current)
  local b = cjson.decode(ARGV[1])
  if a.tokens ~= b.tokens or a.capacity ~= b.capacity
     or a.refillRate ~= b.refillRate
     or a.lastRefillTimestamp ~= b.lastRefillTimestamp then
    return 0
  end
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    /// A bucket key held something that is not a bucket record.
    #[error("malformed bucket record at `{key}`: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    swap: Arc<Script>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("conn", &"<redis::aio::ConnectionManager>").finish()
    }
}

impl RedisStore {
    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, swap: Arc::new(Script::new(SWAP_BUCKET_LUA)) }
    }

    /// Open a managed connection to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, RedisStoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }
}

fn encode(key: &str, state: &BucketState) -> Result<String, RedisStoreError> {
    serde_json::to_string(state)
        .map_err(|source| RedisStoreError::Codec { key: key.to_string(), source })
}

#[async_trait]
impl SharedStore for RedisStore {
    type Error = RedisStoreError;

    async fn incr(&self, key: &str) -> Result<u64, Self::Error> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn expire_ms(&self, key: &str, ttl_ms: u64) -> Result<(), Self::Error> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PEXPIRE").arg(key).arg(ttl_ms).query_async(&mut conn).await?;
        Ok(())
    }

    async fn load_bucket(&self, key: &str) -> Result<Option<BucketState>, Self::Error> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|source| {
                tracing::warn!(
                    target: "tollgate::redis",
                    key = %key,
                    error = %source,
                    "unreadable bucket record"
                );
                RedisStoreError::Codec { key: key.to_string(), source }
            })
        })
        .transpose()
    }

    async fn store_bucket(
        &self,
        key: &str,
        state: &BucketState,
        ttl_ms: u64,
    ) -> Result<(), Self::Error> {
        let value = encode(key, state)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn swap_bucket(
        &self,
        key: &str,
        expected: Option<&BucketState>,
        next: &BucketState,
        ttl_ms: u64,
    ) -> Result<bool, Self::Error> {
        let expected = match expected {
            Some(state) => encode(key, state)?,
            None => String::new(),
        };
        let next = encode(key, next)?;
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .swap
            .key(key)
            .arg(expected)
            .arg(next)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}
