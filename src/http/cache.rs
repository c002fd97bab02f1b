//! Response cache for JSON requests.
//!
//! Entries are keyed by method, URL and request body, and each entry carries
//! the TTL its caller asked for, so one cache serves sources with different
//! freshness needs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;

/// Maximum number of cached responses.
const MAX_ENTRIES: u64 = 2_048;

#[derive(Clone)]
struct CachedResponse {
    body: Arc<String>,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedResponse> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedResponse,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Async-safe response cache with per-entry expiry.
#[derive(Clone)]
pub struct ResponseCache {
    cache: Cache<String, CachedResponse>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        let cache = Cache::builder()
            .max_capacity(MAX_ENTRIES)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    pub fn key(method: &str, url: &str, body: Option<&str>) -> String {
        match body {
            Some(body) => format!("{} {} {}", method, url, body),
            None => format!("{} {}", method, url),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<String>> {
        self.cache.get(key).await.map(|entry| entry.body)
    }

    pub async fn insert(&self, key: String, body: String, ttl: Duration) {
        let entry = CachedResponse {
            body: Arc::new(body),
            ttl,
        };
        self.cache.insert(key, entry).await;
    }

    /// Drop every cached response.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let cache = ResponseCache::new();
        let key = ResponseCache::key("GET", "https://api/x", None);
        cache
            .insert(key.clone(), "{}".into(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get(&key).await.as_deref().map(String::as_str), Some("{}"));
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = ResponseCache::new();
        let key = ResponseCache::key("GET", "https://api/x", None);
        cache
            .insert(key.clone(), "{}".into(), Duration::from_millis(20))
            .await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = ResponseCache::new();
        let key = ResponseCache::key("POST", "https://api/x", Some("[1]"));
        cache
            .insert(key.clone(), "{}".into(), Duration::from_secs(60))
            .await;
        cache.invalidate_all();
        assert!(cache.get(&key).await.is_none());
    }

    #[test]
    fn test_key_includes_body() {
        assert_ne!(
            ResponseCache::key("POST", "u", Some("a")),
            ResponseCache::key("POST", "u", Some("b"))
        );
        assert_eq!(ResponseCache::key("GET", "u", None), "GET u");
    }
}
