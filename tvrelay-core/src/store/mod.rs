// Shared state store
//
// Registry, session and failover state must be visible to every worker and,
// with Redis, to every node. Two backends share one atomic contract:
// - RedisStateStore: production, multi-node
// - MemoryStateStore: single-node mode and tests

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::Result;

pub use self::memory::MemoryStateStore;
pub use self::redis::RedisStateStore;

/// Key-value store with the handful of atomic primitives the engine needs.
///
/// Every method is a single atomic operation on the backend. Callers compose
/// them so that no read-modify-write sequence spans two calls, except where
/// guarded by a [`StateStore::set_nx`] lock.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set only if absent. Returns true if this call created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    async fn delete(&self, keys: &[String]) -> Result<()>;

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>>;

    /// Batched read; the result has one slot per requested key.
    async fn get_bytes_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>>;

    async fn set_bytes(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Overwrite `field` only if it is already present. Returns false
    /// (and writes nothing) when the field is missing.
    async fn hset_if_exists(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Returns true if the field existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    async fn srem(&self, key: &str, member: &str) -> Result<()>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn get_i64(&self, key: &str) -> Result<i64> {
        Ok(self
            .get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}

/// Key layout. All engine keys go through here so the namespace stays in
/// one place.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn stream(&self, stream_key: &str, field: &str) -> String {
        format!("{}stream:{stream_key}:{field}", self.prefix)
    }

    #[must_use]
    pub fn status(&self, stream_key: &str) -> String {
        self.stream(stream_key, "status")
    }

    #[must_use]
    pub fn clients(&self, stream_key: &str) -> String {
        self.stream(stream_key, "clients")
    }

    #[must_use]
    pub fn info(&self, stream_key: &str) -> String {
        self.stream(stream_key, "info")
    }

    #[must_use]
    pub fn lock(&self, stream_key: &str) -> String {
        self.stream(stream_key, "lock")
    }

    #[must_use]
    pub fn error(&self, stream_key: &str) -> String {
        self.stream(stream_key, "error")
    }

    #[must_use]
    pub fn bytes(&self, stream_key: &str) -> String {
        self.stream(stream_key, "bytes")
    }

    #[must_use]
    pub fn last_activity(&self, stream_key: &str) -> String {
        self.stream(stream_key, "last_activity")
    }

    #[must_use]
    pub fn sessions(&self, stream_key: &str) -> String {
        self.stream(stream_key, "sessions")
    }

    #[must_use]
    pub fn failover(&self, stream_key: &str) -> String {
        self.stream(stream_key, "failover")
    }

    #[must_use]
    pub fn stop(&self, stream_key: &str) -> String {
        self.stream(stream_key, "stop")
    }

    #[must_use]
    pub fn switch(&self, stream_key: &str) -> String {
        self.stream(stream_key, "switch")
    }

    #[must_use]
    pub fn buffer_index(&self, stream_key: &str) -> String {
        self.stream(stream_key, "index")
    }

    #[must_use]
    pub fn chunk(&self, stream_key: &str, seq: u64) -> String {
        format!("{}stream:{stream_key}:chunk:{seq}", self.prefix)
    }

    #[must_use]
    pub fn active_streams(&self) -> String {
        format!("{}streams:active", self.prefix)
    }

    #[must_use]
    pub fn hls_last_seen(&self, channel_id: &str) -> String {
        format!("{}hls:{channel_id}:last_seen", self.prefix)
    }

    /// Every per-stream key except chunks, for teardown.
    #[must_use]
    pub fn stream_state(&self, stream_key: &str) -> Vec<String> {
        [
            "status",
            "clients",
            "info",
            "error",
            "bytes",
            "last_activity",
            "sessions",
            "failover",
            "stop",
            "switch",
            "index",
        ]
        .iter()
        .map(|field| self.stream(stream_key, field))
        .collect()
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("tvrelay:")
    }
}
