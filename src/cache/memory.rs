use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{BoxFuture, CachedResponse, ResponseCache};
use crate::config::settings::CacheConfig;
use crate::error::Result;

struct Entry {
    response: CachedResponse,
    tick: u64,
    inserted: Instant,
}

#[derive(Default)]
struct Lru {
    entries: HashMap<String, Entry>,
    /// tick -> key, oldest first
    order: BTreeMap<u64, String>,
    next_tick: u64,
}

impl Lru {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }
}

/// Bounded in-process LRU with a TTL.
pub struct MemoryCache {
    inner: Mutex<Lru>,
    capacity: usize,
    ttl: Duration,
    max_entry_bytes: usize,
}

impl MemoryCache {
    pub fn new(capacity: usize, ttl: Duration, max_entry_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Lru::default()),
            capacity,
            ttl,
            max_entry_bytes,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.capacity,
            Duration::from_secs(config.ttl_secs),
            config.max_entry_bytes,
        )
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<CachedResponse> {
        let mut lru = self.inner.lock();
        let expired = {
            let entry = lru.entries.get(key)?;
            now.duration_since(entry.inserted) >= self.ttl
        };
        if expired {
            lru.remove(key);
            return None;
        }
        let tick = lru.bump();
        let entry = lru.entries.get_mut(key)?;
        let old = std::mem::replace(&mut entry.tick, tick);
        let response = entry.response.clone();
        lru.order.remove(&old);
        lru.order.insert(tick, key.to_string());
        Some(response)
    }

    fn put_at(&self, key: String, response: CachedResponse, now: Instant) {
        if self.capacity == 0 || response.body.len() > self.max_entry_bytes {
            return;
        }
        let mut lru = self.inner.lock();
        lru.remove(&key);
        let tick = lru.bump();
        lru.order.insert(tick, key.clone());
        lru.entries.insert(
            key,
            Entry {
                response,
                tick,
                inserted: now,
            },
        );
        while lru.entries.len() > self.capacity {
            let Some((_, oldest)) = lru.order.pop_first() else {
                break;
            };
            lru.entries.remove(&oldest);
        }
    }
}

impl ResponseCache for MemoryCache {
    fn get<'a>(&'a self, fingerprint: &'a str) -> BoxFuture<'a, Result<Option<CachedResponse>>> {
        Box::pin(async move { Ok(self.get_at(fingerprint, Instant::now())) })
    }

    fn put<'a>(&'a self, fingerprint: String, response: CachedResponse) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.put_at(fingerprint, response, Instant::now());
            Ok(())
        })
    }

    fn clear<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut lru = self.inner.lock();
            lru.entries.clear();
            lru.order.clear();
            Ok(())
        })
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use chrono::Utc;

    fn response(body: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            content_type: Some("application/json".into()),
            body: Bytes::from(body.to_string()),
            provider_id: "a".into(),
            provider_name: "A".into(),
            upstream_model: None,
            stored_at: Utc::now(),
        }
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = MemoryCache::new(2, Duration::from_secs(60), 1024);
        let now = Instant::now();
        cache.put_at("k1".into(), response("1"), now);
        cache.put_at("k2".into(), response("2"), now);
        assert!(cache.get_at("k1", now).is_some());
        cache.put_at("k3".into(), response("3"), now);

        assert!(cache.get_at("k2", now).is_none());
        assert!(cache.get_at("k1", now).is_some());
        assert!(cache.get_at("k3", now).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = MemoryCache::new(4, Duration::from_secs(10), 1024);
        let now = Instant::now();
        cache.put_at("k".into(), response("x"), now);
        assert!(cache.get_at("k", now + Duration::from_secs(9)).is_some());
        assert!(cache.get_at("k", now + Duration::from_secs(10)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn oversized_bodies_are_not_stored() {
        let cache = MemoryCache::new(4, Duration::from_secs(10), 4);
        cache.put_at("k".into(), response("too long"), Instant::now());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let cache = MemoryCache::new(4, Duration::from_secs(10), 1024);
        cache.put("a".into(), response("1")).await.unwrap();
        cache.put("b".into(), response("2")).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().unwrap().body, "1");
        cache.clear().await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
    }
}
