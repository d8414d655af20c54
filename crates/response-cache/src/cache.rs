//! The response cache itself
//!
//! All state lives behind one `tokio::sync::Mutex`: a map of entries, the
//! recency list, and the running counters. A `dirty` flag records whether
//! anything changed since the last successful write so periodic saves of
//! an idle cache cost nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{JsonStore, now_millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::lru::LruList;

/// Store document holding the persisted cache.
pub const CACHE_DOCUMENT: &str = "cache-entries";

/// How often the background task writes a dirty cache.
pub const PERSIST_INTERVAL: Duration = Duration::from_secs(300);

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum number of entries before the least recently used is evicted
    pub max_size: usize,
    /// Age after which an entry is treated as absent, measured from creation
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// A memoized upstream response.
///
/// `response` is the upstream (OpenAI-shaped) body so one entry can be
/// replayed to either client protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub response: Value,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub created_at: u64,
    pub last_accessed: u64,
    #[serde(default)]
    pub hits: u64,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        response: Value,
        model: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Self {
        let now = now_millis();
        Self {
            key: key.into(),
            response,
            model: model.into(),
            input_tokens,
            output_tokens,
            created_at: now,
            last_accessed: now,
            hits: 0,
        }
    }

    fn is_expired(&self, ttl: Duration, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_at) > ttl.as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 before the first lookup
    pub hit_rate: f64,
    /// Sum of input and output tokens of every entry served from cache
    pub tokens_saved: u64,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
struct Counters {
    hits: u64,
    misses: u64,
    tokens_saved: u64,
}

#[derive(Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    #[serde(default)]
    counters: Counters,
    entries: Vec<CacheEntry>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    order: LruList,
    counters: Counters,
}

impl Inner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.order.remove(key);
        self.entries.remove(key)
    }

    fn insert(&mut self, entry: CacheEntry, max_size: usize) -> usize {
        self.order.push_front(&entry.key);
        self.entries.insert(entry.key.clone(), entry);
        let mut evicted = 0;
        while self.entries.len() > max_size {
            let Some(coldest) = self.order.pop_back() else {
                break;
            };
            self.entries.remove(&coldest);
            evicted += 1;
        }
        evicted
    }
}

pub struct ResponseCache {
    inner: Mutex<Inner>,
    config: CacheConfig,
    store: Option<Arc<JsonStore>>,
    dirty: AtomicBool,
}

impl ResponseCache {
    /// An empty, memory-only cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            store: None,
            dirty: AtomicBool::new(false),
        }
    }

    /// Restore the cache from `store`.
    ///
    /// Expired entries are dropped and recency is rebuilt from
    /// `last_accessed`. A corrupt document is logged, deleted, and replaced
    /// by an empty cache; it never prevents startup.
    pub async fn load(store: Arc<JsonStore>, config: CacheConfig) -> Self {
        let mut inner = Inner::default();

        match store.read::<CacheDocument>(CACHE_DOCUMENT).await {
            Ok(Some(document)) => {
                let now = now_millis();
                let total = document.entries.len();
                let mut live: Vec<CacheEntry> = document
                    .entries
                    .into_iter()
                    .filter(|e| !e.is_expired(config.ttl, now))
                    .collect();
                live.sort_by_key(|e| e.last_accessed);
                let restored = live.len();
                for entry in live {
                    inner.insert(entry, config.max_size);
                }
                inner.counters = document.counters;
                info!(
                    restored,
                    expired = total - restored,
                    kept = inner.entries.len(),
                    "response cache restored"
                );
            }
            Ok(None) => debug!("no persisted response cache"),
            Err(e) => {
                let e = common::Error::CacheCorrupt(e.to_string());
                warn!(error = %e, "discarding persisted response cache");
                if let Err(e) = store.remove(CACHE_DOCUMENT).await {
                    warn!(error = %e, "failed to remove corrupt cache document");
                }
            }
        }

        Self {
            inner: Mutex::new(inner),
            config,
            store: Some(store),
            dirty: AtomicBool::new(false),
        }
    }

    /// Look up `key`. A hit refreshes the entry's recency and credits its
    /// tokens to `tokens_saved`; an expired entry is removed and counts as
    /// a miss.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.get_at(key, now_millis()).await
    }

    async fn get_at(&self, key: &str, now_ms: u64) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().await;
        self.dirty.store(true, Ordering::Relaxed);

        let expired = inner
            .entries
            .get(key)
            .map(|e| e.is_expired(self.config.ttl, now_ms));
        match expired {
            Some(false) => {
                inner.order.touch(key);
                let entry = inner.entries.get_mut(key)?;
                entry.hits += 1;
                entry.last_accessed = now_ms;
                let entry = entry.clone();
                inner.counters.hits += 1;
                inner.counters.tokens_saved += entry.input_tokens + entry.output_tokens;
                metrics::counter!("gateway_cache_hits_total").increment(1);
                Some(entry)
            }
            Some(true) => {
                inner.remove(key);
                inner.counters.misses += 1;
                metrics::counter!("gateway_cache_misses_total").increment(1);
                debug!(key, "cache entry expired");
                None
            }
            None => {
                inner.counters.misses += 1;
                metrics::counter!("gateway_cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Insert or replace an entry, evicting the least recently used entries
    /// beyond `max_size`.
    pub async fn put(&self, entry: CacheEntry) {
        let key = entry.key.clone();
        let evicted = self.inner.lock().await.insert(entry, self.config.max_size);
        self.dirty.store(true, Ordering::Relaxed);
        if evicted > 0 {
            metrics::counter!("gateway_cache_evictions_total").increment(evicted as u64);
            debug!(key, evicted, "cache full, evicted coldest entries");
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let removed = self.inner.lock().await.remove(key).is_some();
        if removed {
            self.dirty.store(true, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every entry. Counters are kept. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.order.clear();
        self.dirty.store(true, Ordering::Relaxed);
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let Counters {
            hits,
            misses,
            tokens_saved,
        } = inner.counters;
        let total = hits + misses;
        CacheStats {
            size: inner.entries.len(),
            max_size: self.config.max_size,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            tokens_saved,
        }
    }

    #[cfg(test)]
    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    /// Write the cache if it changed since the last write. Returns whether
    /// anything was written.
    pub async fn flush(&self) -> common::Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(false);
        }

        let document = {
            let inner = self.inner.lock().await;
            CacheDocument {
                version: DOCUMENT_VERSION,
                counters: inner.counters,
                entries: inner.entries.values().cloned().collect(),
            }
        };

        if let Err(e) = store.write(CACHE_DOCUMENT, &document).await {
            self.dirty.store(true, Ordering::Relaxed);
            return Err(e);
        }
        debug!(entries = document.entries.len(), "response cache persisted");
        Ok(true)
    }

    /// Spawn the periodic writer. The task holds a weak reference and exits
    /// once the cache is dropped.
    pub fn spawn_persistence(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = cache.flush().await {
                    warn!(error = %e, "failed to persist response cache");
                }
            }
        })
    }
}
