//! Redis-backed state store.
//!
//! Each trait method maps to one Redis command (or one Lua script), so the
//! atomicity of the trait contract comes straight from Redis.

use async_trait::async_trait;
use bytes::Bytes;
use ::redis::aio::ConnectionManager as RedisConnectionManager;
use ::redis::Script;
use std::time::Duration;

use super::StateStore;
use crate::error::Result;

const COMPARE_AND_DELETE: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

const HSET_IF_EXISTS: &str = r#"
    if redis.call("HEXISTS", KEYS[1], ARGV[1]) == 1 then
        redis.call("HSET", KEYS[1], ARGV[1], ARGV[2])
        return 1
    else
        return 0
    end
"#;

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[derive(Clone)]
pub struct RedisStateStore {
    redis: RedisConnectionManager,
}

impl RedisStateStore {
    #[must_use]
    pub const fn new(redis: RedisConnectionManager) -> Self {
        Self { redis }
    }

    /// Open a client for `url` and wrap it in a connection manager.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let redis = client.get_connection_manager().await?;
        tracing::info!("Connected to Redis state store");
        Ok(Self::new(redis))
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.redis.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.redis.clone();
        let result: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let deleted: i64 = Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        ::redis::cmd("DEL")
            .arg(keys)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.redis.clone();
        let value: i64 = ::redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.redis.clone();
        ::redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.redis.clone();
        let value: Option<Vec<u8>> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.map(Bytes::from))
    }

    async fn get_bytes_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let values: Vec<Option<Vec<u8>>> = ::redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    async fn set_bytes(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.redis.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        ::redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hset_if_exists(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let written: i64 = Script::new(HSET_IF_EXISTS)
            .key(key)
            .arg(field)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = ::redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = ::redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut conn = self.redis.clone();
        let entries: Vec<(String, String)> = ::redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        ::redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        ::redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let mut members: Vec<String> = ::redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        members.sort();
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }

    // Requires a running Redis; enable with REDIS_URL.
    #[tokio::test]
    #[ignore = "requires redis"]
    async fn test_lock_roundtrip_against_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let store = RedisStateStore::connect(&url).await.unwrap();
        let key = format!("tvrelay:test:lock:{}", std::process::id());

        assert!(store.set_nx(&key, "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx(&key, "b", Duration::from_secs(5)).await.unwrap());
        assert!(!store.compare_and_delete(&key, "b").await.unwrap());
        assert!(store.compare_and_delete(&key, "a").await.unwrap());

        let sessions = format!("tvrelay:test:sessions:{}", std::process::id());
        assert!(!store.hset_if_exists(&sessions, "c1", "{}").await.unwrap());
        store.hset(&sessions, "c1", "{}").await.unwrap();
        assert!(store.hset_if_exists(&sessions, "c1", "{\"cursor\":1}").await.unwrap());
        store.delete(&[sessions]).await.unwrap();
    }
}
