// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! TTL-based response and embedding cache
//!
//! Keys are SHA-256 digests of the operation kind plus its inputs. Each value
//! carries its own expiry; an expired entry is never returned and is removed
//! on the lookup that finds it. A background sweeper bounds memory between
//! lookups. Disabling the cache turns every `get` into a miss and every `put`
//! into a no-op.

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::metrics::MetricsCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Embedding,
    Completion,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Embedding => "embedding",
            CacheKind::Completion => "completion",
        }
    }
}

/// Content-addressed cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: CacheKind,
    digest: String,
}

impl CacheKey {
    /// Hash `parts` under `kind`; parts are length-prefixed so boundaries matter
    pub fn new(kind: CacheKind, parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Self {
            kind,
            digest: hex::encode(hasher.finalize()),
        }
    }

    pub fn embedding(text: &str, model: &str) -> Self {
        Self::new(CacheKind::Embedding, &[model, text])
    }

    pub fn completion(backend: &str, normalized_prompt: &str) -> Self {
        Self::new(CacheKind::Completion, &[backend, normalized_prompt])
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), &self.digest[..12])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Embedding(Vec<f32>),
    Completion(String),
}

struct CacheEntry {
    value: CachedValue,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Total entries in cache
    pub total: usize,
    /// Expired entries (not yet evicted)
    pub expired: usize,
    pub hits: u64,
    pub misses: u64,
    /// Maximum cache capacity
    pub max: usize,
}

pub struct ResponseCache {
    enabled: bool,
    embedding_ttl: Duration,
    completion_ttl: Duration,
    max_entries: usize,
    entries: DashMap<CacheKey, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            embedding_ttl: config.embedding_ttl(),
            completion_ttl: config.completion_ttl(),
            max_entries: config.max_entries.max(1),
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn ttl_for(&self, kind: CacheKind) -> Duration {
        match kind {
            CacheKind::Embedding => self.embedding_ttl,
            CacheKind::Completion => self.completion_ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        self.get_at(key, Instant::now())
    }

    /// Lookup against an explicit clock reading
    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<CachedValue> {
        if !self.enabled {
            return None;
        }

        let found = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            _ => None,
        };

        if found.is_none() {
            // Lazy eviction of an expired entry, if that is what we saw
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        self.note_lookup(key.kind, found.is_some());
        found
    }

    pub fn get_embedding(&self, key: &CacheKey) -> Option<Vec<f32>> {
        match self.get(key)? {
            CachedValue::Embedding(vector) => Some(vector),
            CachedValue::Completion(_) => None,
        }
    }

    pub fn get_completion(&self, key: &CacheKey) -> Option<String> {
        match self.get(key)? {
            CachedValue::Completion(text) => Some(text),
            CachedValue::Embedding(_) => None,
        }
    }

    /// Store `value` with `ttl`, or with the kind's configured TTL
    pub fn put(&self, key: CacheKey, value: CachedValue, ttl: Option<Duration>) {
        self.put_at(key, value, ttl, Instant::now());
    }

    pub fn put_at(&self, key: CacheKey, value: CachedValue, ttl: Option<Duration>, now: Instant) {
        if !self.enabled {
            return;
        }
        let ttl = ttl.unwrap_or_else(|| self.ttl_for(key.kind));

        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.evict_oldest();
        }

        debug!("Caching {} for {:?}", key, ttl);
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Clear all cache entries
    pub fn clear(&self) {
        self.entries.clear();
        info!("Response cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        CacheStats {
            total: self.entries.len(),
            expired: self
                .entries
                .iter()
                .filter(|e| e.expires_at <= now)
                .count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            max: self.max_entries,
        }
    }

    /// Remove expired entries from cache
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Instant::now())
    }

    pub fn cleanup_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Periodically sweep expired entries until `shutdown` is cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Cache sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = cache.cleanup_expired();
                        if removed > 0 {
                            debug!("Cache sweep removed {} expired entries", removed);
                        }
                    }
                }
            }
        })
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.inserted_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    fn note_lookup(&self, kind: CacheKind, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(kind.as_str(), hit);
        }
    }
}
