//! Query response cache.
//!
//! Answers are memoized under a key derived from the normalized question and
//! the canonical filter, so "What is X?" and "  what   is x? " share an
//! entry. Entries expire `ttl` after creation; expiry is checked lazily on
//! read, and an optional sweeper task purges expired entries periodically.
//!
//! Every [`clear`](ResponseCache::clear) starts a new generation. Writers that
//! computed their answer under an older generation are turned away by
//! [`put_if_generation`](ResponseCache::put_if_generation).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::index::Filter;
use crate::models::SearchResult;

/// A memoized answer.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub cache_key: String,
    pub answer: String,
    pub sources: Vec<SearchResult>,
    pub confidence: f32,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lower-cases, trims and collapses internal whitespace.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Hex SHA-256 of the normalized query and canonical filter.
///
/// Total over all Unicode input.
pub fn cache_key(query: &str, filter: &Filter) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    hasher.update([0x1f]);
    hasher.update(filter.canonical().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ResponseCache {
    entries: RwLock<HashMap<String, CachedResponse>>,
    ttl: chrono::Duration,
    generation: AtomicU64,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            generation: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        self.get_at(key, Utc::now())
    }

    /// Like [`get`](Self::get) with an explicit clock.
    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<CachedResponse> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|entry| !self.expired(entry, now))
            .cloned()
    }

    /// Inserts or overwrites the entry for `response.cache_key`.
    pub fn put(&self, response: CachedResponse) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(response.cache_key.clone(), response);
    }

    /// Number of clears so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Inserts `response` only if no clear happened since `generation` was
    /// read. Returns whether the entry was stored.
    pub fn put_if_generation(&self, response: CachedResponse, generation: u64) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        entries.insert(response.cache_key.clone(), response);
        true
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !self.expired(entry, now));
        before - entries.len()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, entry: &CachedResponse, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.created_at) > self.ttl
    }

    /// Spawns a task that purges expired entries every `interval`.
    ///
    /// The task holds only a weak reference and exits once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "purged expired cache entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(key: &str, created_at: DateTime<Utc>) -> CachedResponse {
        CachedResponse {
            cache_key: key.to_string(),
            answer: "30 days".to_string(),
            sources: Vec::new(),
            confidence: 0.9,
            model: None,
            created_at,
        }
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(
            normalize_query("  What IS\tthe   refund\nwindow? "),
            "what is the refund window?"
        );
    }

    #[test]
    fn test_key_shared_across_casing_and_whitespace() {
        let f = Filter::default();
        assert_eq!(
            cache_key("What is the refund window?", &f),
            cache_key("  what is THE refund   window? ", &f)
        );
        assert_ne!(cache_key("refund", &f), cache_key("refunds", &f));
    }

    #[test]
    fn test_key_depends_on_filter() {
        let hr = Filter {
            department: Some("hr".into()),
            ..Default::default()
        };
        assert_ne!(cache_key("q", &Filter::default()), cache_key("q", &hr));
    }

    #[test]
    fn test_key_total_over_unicode() {
        for q in ["வணக்கம் உலகம்", "مرحبا بالعالم", "你好，世界", "🦀  RUST ", ""] {
            let key = cache_key(q, &Filter::default());
            assert_eq!(key.len(), 64);
            assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_hit_within_ttl_miss_after() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let created = Utc::now();
        cache.put(response("k", created));

        assert!(cache
            .get_at("k", created + chrono::Duration::seconds(59))
            .is_some());
        assert!(cache
            .get_at("k", created + chrono::Duration::seconds(61))
            .is_none());
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_expired_entry_overwritten() {
        let cache = ResponseCache::new(Duration::from_secs(1));
        cache.put(response("k", Utc::now() - chrono::Duration::seconds(10)));
        assert!(cache.get("k").is_none());

        cache.put(response("k", Utc::now()));
        assert!(cache.get("k").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_purge_and_clear() {
        let cache = ResponseCache::new(Duration::from_secs(5));
        cache.put(response("old", Utc::now() - chrono::Duration::seconds(30)));
        cache.put(response("new", Utc::now()));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_put_after_clear_is_refused() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let before = cache.generation();
        cache.clear();

        assert!(!cache.put_if_generation(response("k", Utc::now()), before));
        assert!(cache.get("k").is_none());

        let current = cache.generation();
        assert_eq!(current, before + 1);
        assert!(cache.put_if_generation(response("k", Utc::now()), current));
        assert!(cache.get("k").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges() {
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(1)));
        cache.put(response("old", Utc::now() - chrono::Duration::seconds(30)));
        let handle = cache.spawn_sweeper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(cache.is_empty());

        drop(cache);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(handle.is_finished());
    }
}
