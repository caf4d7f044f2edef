// In-process state store with the same atomic contract as Redis.
//
// Every operation takes the map lock once and never awaits while holding it,
// which makes each call atomic with respect to every other call. Expiry is
// lazy: an operation only expires the key it touches, and a full sweep runs
// at most once per SWEEP_INTERVAL so untouched expired keys do not pile up.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use super::StateStore;
use crate::error::{Error, Result};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Bytes(Bytes),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn wrong_type(key: &str) -> Error {
    Error::Store(format!("WRONGTYPE operation against key {key}"))
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_sweep: Option<Instant>,
}

impl Inner {
    /// Drop `key` if it has expired, and sweep everything if a sweep is due.
    fn expire(&mut self, key: &str) -> &mut HashMap<String, Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        if self.next_sweep.is_none_or(|at| at <= now) {
            self.entries.retain(|_, e| !e.is_expired(now));
            self.next_sweep = Some(now + SWEEP_INTERVAL);
        }
        &mut self.entries
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys (expired entries are not counted).
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys starting with `prefix`, for assertions in tests.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .lock()
            .entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> R) -> R {
        let mut inner = self.inner.lock();
        f(inner.expire(key).get_mut(key))
    }

    fn with_map<R>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, Entry>) -> R) -> R {
        let mut inner = self.inner.lock();
        f(inner.expire(key))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_live(key, |entry| match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.inner
            .lock()
            .entries
            .insert(key.to_string(), Entry::new(Value::Str(value.to_string()), ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.with_map(key, |entries| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry::new(Value::Str(value.to_string()), Some(ttl)),
            );
            Ok(true)
        })
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.with_map(key, |entries| match entries.get(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) if s == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.entries.remove(key);
        }
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.with_map(key, |entries| {
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Value::Str("0".to_string()), None));
            match &mut entry.value {
                Value::Str(s) => {
                    let current: i64 = s
                        .parse()
                        .map_err(|_| Error::Store(format!("value at {key} is not an integer")))?;
                    let next = current + delta;
                    *s = next.to_string();
                    Ok(next)
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_live(key, |entry| {
            if let Some(entry) = entry {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Bytes>> {
        self.with_live(key, |entry| match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Bytes(b),
                ..
            }) => Ok(Some(b.clone())),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(Bytes::from(s.clone()))),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn get_bytes_many(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        let now = Instant::now();
        let inner = self.inner.lock();
        Ok(keys
            .iter()
            .map(|key| match inner.entries.get(key) {
                Some(e) if !e.is_expired(now) => match &e.value {
                    Value::Bytes(b) => Some(b.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect())
    }

    async fn set_bytes(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        self.inner
            .lock()
            .entries
            .insert(key.to_string(), Entry::new(Value::Bytes(value), ttl));
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_map(key, |entries| {
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Value::Hash(HashMap::new()), None));
            match &mut entry.value {
                Value::Hash(h) => {
                    h.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn hset_if_exists(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.with_live(key, |entry| match entry {
            None => Ok(false),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => match h.get_mut(field) {
                Some(current) => {
                    *current = value.to_string();
                    Ok(true)
                }
                None => Ok(false),
            },
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_live(key, |entry| match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.with_map(key, |entries| {
            let Some(entry) = entries.get_mut(key) else {
                return Ok(false);
            };
            let Value::Hash(h) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            let removed = h.remove(field).is_some();
            if h.is_empty() {
                entries.remove(key);
            }
            Ok(removed)
        })
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        self.with_live(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.with_map(key, |entries| {
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(Value::Set(HashSet::new()), None));
            match &mut entry.value {
                Value::Set(s) => {
                    s.insert(member.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            }
        })
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        self.with_map(key, |entries| {
            let Some(entry) = entries.get_mut(key) else {
                return Ok(());
            };
            let Value::Set(s) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            s.remove(member);
            if s.is_empty() {
                entries.remove(key);
            }
            Ok(())
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.with_live(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(s),
                ..
            }) => {
                let mut members: Vec<String> = s.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_nx_single_winner() {
        let store = Arc::new(MemoryStateStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .set_nx("lock", &format!("owner-{i}"), Duration::from_secs(5))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStateStore::new();
        assert!(store.set_nx("lock", "a", Duration::from_secs(1)).await.unwrap());
        assert!(!store.set_nx("lock", "b", Duration::from_secs(1)).await.unwrap());

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(store.get("lock").await.unwrap().is_none());
        assert!(store.set_nx("lock", "b", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = MemoryStateStore::new();
        store.set("lock", "owner-a", None).await.unwrap();
        assert!(!store.compare_and_delete("lock", "owner-b").await.unwrap());
        assert!(store.compare_and_delete("lock", "owner-a").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incr_and_get_i64() {
        let store = MemoryStateStore::new();
        assert_eq!(store.get_i64("clients").await.unwrap(), 0);
        assert_eq!(store.incr_by("clients", 1).await.unwrap(), 1);
        assert_eq!(store.incr_by("clients", 1).await.unwrap(), 2);
        assert_eq!(store.incr_by("clients", -1).await.unwrap(), 1);
        assert_eq!(store.get_i64("clients").await.unwrap(), 1);

        store.hset("h", "f", "v").await.unwrap();
        assert!(store.incr_by("h", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_hash_and_set() {
        let store = MemoryStateStore::new();
        store.hset("sessions", "c1", "{}").await.unwrap();
        store.hset("sessions", "c2", "{}").await.unwrap();
        assert_eq!(store.hgetall("sessions").await.unwrap().len(), 2);
        assert!(store.hdel("sessions", "c1").await.unwrap());
        assert!(!store.hdel("sessions", "c1").await.unwrap());
        assert_eq!(store.hget("sessions", "c2").await.unwrap().as_deref(), Some("{}"));

        store.sadd("active", "b").await.unwrap();
        store.sadd("active", "a").await.unwrap();
        assert_eq!(store.smembers("active").await.unwrap(), vec!["a", "b"]);
        store.srem("active", "a").await.unwrap();
        store.srem("active", "b").await.unwrap();
        assert_eq!(store.keys_with_prefix(""), vec!["sessions"]);

        assert!(store.hdel("sessions", "c2").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_hset_if_exists_never_recreates() {
        let store = MemoryStateStore::new();
        assert!(!store.hset_if_exists("sessions", "c1", "{}").await.unwrap());
        assert!(store.is_empty());

        store.hset("sessions", "c1", "old").await.unwrap();
        store.hset("sessions", "c2", "old").await.unwrap();
        assert!(store.hset_if_exists("sessions", "c1", "new").await.unwrap());
        assert_eq!(store.hget("sessions", "c1").await.unwrap().as_deref(), Some("new"));

        assert!(store.hdel("sessions", "c2").await.unwrap());
        assert!(!store.hset_if_exists("sessions", "c2", "new").await.unwrap());
        assert!(store.hget("sessions", "c2").await.unwrap().is_none());

        store.set("plain", "v", None).await.unwrap();
        assert!(store.hset_if_exists("plain", "f", "v").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_expire_only_the_touched_key() {
        let store = MemoryStateStore::new();
        store.incr_by("clients", 1).await.unwrap();
        store
            .set_bytes("chunk:1", Bytes::from_static(b"ts"), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        store.set("counter", "7", Some(Duration::from_secs(1))).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        // The counter expired, so it restarts from zero.
        assert_eq!(store.incr_by("counter", 1).await.unwrap(), 1);
        // The untouched chunk is invisible but not yet swept.
        assert_eq!(store.len(), 2);
        assert_eq!(store.inner.lock().entries.len(), 3);

        tokio::time::advance(SWEEP_INTERVAL).await;
        store.incr_by("clients", 1).await.unwrap();
        assert!(!store.inner.lock().entries.contains_key("chunk:1"));
    }

    #[tokio::test]
    async fn test_bytes_batch() {
        let store = MemoryStateStore::new();
        store.set_bytes("c:1", Bytes::from_static(b"one"), None).await.unwrap();
        store.set_bytes("c:3", Bytes::from_static(b"three"), None).await.unwrap();

        let keys = vec!["c:1".to_string(), "c:2".to_string(), "c:3".to_string()];
        let values = store.get_bytes_many(&keys).await.unwrap();
        assert_eq!(values[0].as_deref(), Some(&b"one"[..]));
        assert!(values[1].is_none());
        assert_eq!(values[2].as_deref(), Some(&b"three"[..]));
    }
}
