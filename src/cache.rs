//! Typed, TTL'd cache in front of the metadata store.
//!
//! [`CacheClient`] is the object-safe seam: string keys, JSON string values,
//! atomic counters, and SETNX-style locks. [`Cache`] wraps a client with the
//! typed read/write surface the rest of the pipeline uses; a payload that no
//! longer deserializes to its declared shape is deleted and reported as a
//! miss, so stale shapes never propagate across deploys.
//!
//! All keys live under the `fpai:` namespace. Cache failures degrade: read
//! paths fall through to the store and writes are never blocked.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Namespace prefix applied to every key.
pub const KEY_PREFIX: &str = "fpai:";

/// Object-safe cache operations.
///
/// Implementations must make `incr` and `acquire_lock` atomic; they are the
/// only operations used for concurrency-critical state.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Raw read. `None` on miss or expiry.
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;

    /// Raw write with TTL.
    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Delete one key.
    async fn invalidate(&self, key: &str) -> Result<()>;

    /// Delete every key with the given prefix.
    async fn invalidate_prefix(&self, prefix: &str) -> Result<()>;

    /// Atomically advance a windowed counter by `amount`. The TTL is applied
    /// on the first increment of the window; the post-increment count is
    /// returned.
    async fn incr_by(&self, key: &str, amount: i64, window: Duration) -> Result<i64>;

    /// SETNX-style lock. Returns a token when acquired, `None` when another
    /// holder owns the key.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Release a held lock. Releasing an expired or stolen lock is a no-op.
    async fn release_lock(&self, token: &LockToken) -> Result<()>;
}

/// Proof of lock ownership, passed back on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub owner: Uuid,
}

// ─── Typed facade ────────────────────────────────────────────────────────────

/// Typed cache wrapper used by the pipeline.
#[derive(Clone)]
pub struct Cache {
    client: Arc<dyn CacheClient>,
}

impl Cache {
    pub fn new(client: Arc<dyn CacheClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn CacheClient> {
        &self.client
    }

    fn namespaced(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    /// Typed read. A value that fails to deserialize as `T` is treated as a
    /// schema mismatch: the entry is deleted and a miss is reported.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full = Self::namespaced(key);
        let Some(raw) = self.client.get_raw(&full).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<T>(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                log::warn!("cache entry {full} has a stale shape ({e}); dropping");
                self.client.invalidate(&full).await?;
                Ok(None)
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.client.set_raw(&Self::namespaced(key), raw, ttl).await
    }

    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.client.invalidate(&Self::namespaced(key)).await
    }

    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<()> {
        self.client.invalidate_prefix(&Self::namespaced(prefix)).await
    }

    pub async fn incr(&self, key: &str, window: Duration) -> Result<i64> {
        self.client.incr_by(&Self::namespaced(key), 1, window).await
    }

    pub async fn incr_by(&self, key: &str, amount: i64, window: Duration) -> Result<i64> {
        self.client.incr_by(&Self::namespaced(key), amount, window).await
    }

    pub async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        self.client.acquire_lock(&Self::namespaced(key), ttl).await
    }

    pub async fn release_lock(&self, token: &LockToken) -> Result<()> {
        self.client.release_lock(token).await
    }
}

// ─── In-memory implementation ────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Counter {
    count: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct LockSlot {
    owner: Uuid,
    expires_at: DateTime<Utc>,
}

/// Process-local cache backend.
///
/// The default backend for single-node deployments and tests; a shared
/// cache service implements the same trait for multi-node setups.
#[derive(Default)]
pub struct MemoryCache {
    slots: DashMap<String, Slot>,
    counters: DashMap<String, Counter>,
    locks: DashMap<String, LockSlot>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Called by the runtime's maintenance task.
    pub fn sweep(&self) {
        let now = Utc::now();
        self.slots.retain(|_, s| s.expires_at > now);
        self.counters.retain(|_, c| c.expires_at > now);
        self.locks.retain(|_, l| l.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn ttl_deadline(ttl: Duration) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        // The read guard must drop before the expired-entry removal touches
        // the same shard.
        let expired = match self.slots.get(key) {
            Some(slot) if slot.expires_at > Utc::now() => return Ok(Some(slot.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.slots.remove_if(key, |_, slot| slot.expires_at <= Utc::now());
        }
        Ok(None)
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: Self::ttl_deadline(ttl),
            },
        );
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.slots.remove(key);
        Ok(())
    }

    async fn invalidate_prefix(&self, prefix: &str) -> Result<()> {
        self.slots.retain(|k, _| !k.starts_with(prefix));
        self.counters.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    async fn incr_by(&self, key: &str, amount: i64, window: Duration) -> Result<i64> {
        let now = Utc::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert_with(|| Counter {
            count: 0,
            expires_at: Self::ttl_deadline(window),
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = Self::ttl_deadline(window);
        }
        entry.count += amount;
        Ok(entry.count)
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = Utc::now();
        let owner = Uuid::new_v4();
        let mut acquired = false;

        self.locks
            .entry(key.to_string())
            .and_modify(|slot| {
                if slot.expires_at <= now {
                    slot.owner = owner;
                    slot.expires_at = Self::ttl_deadline(ttl);
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                LockSlot {
                    owner,
                    expires_at: Self::ttl_deadline(ttl),
                }
            });

        Ok(acquired.then(|| LockToken {
            key: key.to_string(),
            owner,
        }))
    }

    async fn release_lock(&self, token: &LockToken) -> Result<()> {
        self.locks
            .remove_if(&token.key, |_, slot| slot.owner == token.owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn cache() -> Cache {
        Cache::new(Arc::new(MemoryCache::new()))
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Meta {
        id: u32,
        title: String,
    }

    #[tokio::test]
    async fn typed_round_trip() {
        let cache = cache();
        let meta = Meta { id: 7, title: "tos".into() };
        cache.set("doc_meta:abc", &meta, Duration::from_secs(60)).await.unwrap();
        let got: Option<Meta> = cache.get("doc_meta:abc").await.unwrap();
        assert_eq!(got, Some(meta));
    }

    #[tokio::test]
    async fn schema_mismatch_reads_as_miss_and_deletes() {
        let cache = cache();
        cache
            .set("doc_meta:abc", &"just a string", Duration::from_secs(60))
            .await
            .unwrap();

        let got: Option<Meta> = cache.get("doc_meta:abc").await.unwrap();
        assert_eq!(got, None);

        // The bad entry is gone entirely.
        let raw: Option<String> = cache.get("doc_meta:abc").await.unwrap();
        assert_eq!(raw, None);
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = cache();
        cache
            .set("session:tok", &1u32, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let got: Option<u32> = cache.get("session:tok").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn counters_increment_within_a_window() {
        let cache = cache();
        assert_eq!(cache.incr("rate_limit:h", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(cache.incr("rate_limit:h", Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(cache.incr("rate_limit:h", Duration::from_secs(60)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let cache = cache();
        let ttl = Duration::from_secs(600);

        let token = cache.acquire_lock("dedup_lock:fp", ttl).await.unwrap();
        assert!(token.is_some());
        assert!(cache.acquire_lock("dedup_lock:fp", ttl).await.unwrap().is_none());

        cache.release_lock(&token.unwrap()).await.unwrap();
        assert!(cache.acquire_lock("dedup_lock:fp", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let cache = cache();
        let first = cache
            .acquire_lock("dedup_lock:fp", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = cache
            .acquire_lock("dedup_lock:fp", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(second.is_some());

        // Releasing the stolen lock must not free the new holder's claim.
        cache.release_lock(&first).await.unwrap();
        assert!(cache
            .acquire_lock("dedup_lock:fp", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn prefix_invalidation() {
        let cache = cache();
        cache.set("doc_meta:a", &1u32, Duration::from_secs(60)).await.unwrap();
        cache.set("doc_meta:b", &2u32, Duration::from_secs(60)).await.unwrap();
        cache.set("analysis:x", &3u32, Duration::from_secs(60)).await.unwrap();

        cache.invalidate_prefix("doc_meta:").await.unwrap();

        assert_eq!(cache.get::<u32>("doc_meta:a").await.unwrap(), None);
        assert_eq!(cache.get::<u32>("doc_meta:b").await.unwrap(), None);
        assert_eq!(cache.get::<u32>("analysis:x").await.unwrap(), Some(3));
    }
}
