//! Template Cache Engine
//!
//! Four independently configured tiers (raw source, compiled template,
//! rendered output, metadata), each with its own capacity, TTL and LRU
//! eviction. Values are immutable text payloads shared as `Arc<str>`.
//! Invalidation works by key fragment, by regex pattern, or by dependency
//! tag. Expired entries are dropped lazily on lookup and eagerly by the
//! sweep task.

use std::collections::HashSet;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Raw,
    Compiled,
    Rendered,
    Metadata,
}

impl CacheTier {
    pub const ALL: [CacheTier; 4] = [
        CacheTier::Raw,
        CacheTier::Compiled,
        CacheTier::Rendered,
        CacheTier::Metadata,
    ];
}

impl std::fmt::Display for CacheTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheTier::Raw => write!(f, "raw"),
            CacheTier::Compiled => write!(f, "compiled"),
            CacheTier::Rendered => write!(f, "rendered"),
            CacheTier::Metadata => write!(f, "metadata"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TierConfig {
    pub capacity: NonZeroUsize,
    pub ttl: Duration,
}

impl TierConfig {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1"),
            ttl,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub raw: TierConfig,
    pub compiled: TierConfig,
    pub rendered: TierConfig,
    pub metadata: TierConfig,
    /// Ceiling on total cached payload bytes before the health check trips.
    pub max_total_bytes: u64,
    /// Lookups required before the hit-rate health rule applies.
    pub min_lookups_for_health: u64,
    pub min_hit_rate: f64,
    pub sweep_interval: Duration,
    pub metrics_reset_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            raw: TierConfig::new(500, Duration::from_secs(3600)),
            compiled: TierConfig::new(500, Duration::from_secs(3600)),
            rendered: TierConfig::new(2000, Duration::from_secs(300)),
            metadata: TierConfig::new(1000, Duration::from_secs(1800)),
            max_total_bytes: 64 * 1024 * 1024,
            min_lookups_for_health: 100,
            min_hit_rate: 0.30,
            sweep_interval: Duration::from_secs(60),
            metrics_reset_interval: Duration::from_secs(3600),
        }
    }
}

/// Per-call options for `get_or_compute`.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Bypass both read and write for this call (request-specific renders).
    pub skip_cache: bool,
    pub ttl_override: Option<Duration>,
    /// Dependency tags this entry should be invalidated by.
    pub tags: Vec<String>,
}

impl CacheOptions {
    pub fn skip() -> Self {
        Self {
            skip_cache: true,
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

struct CacheEntry {
    value: Arc<str>,
    inserted_at: Instant,
    ttl: Duration,
    size_bytes: u64,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

struct Tier {
    tier: CacheTier,
    entries: Mutex<LruCache<String, CacheEntry>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    bytes: AtomicU64,
}

impl Tier {
    fn new(tier: CacheTier, config: &TierConfig) -> Self {
        Self {
            tier,
            entries: Mutex::new(LruCache::new(config.capacity)),
            default_ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Unexpired hit refreshes recency; an expired entry is dropped and
    /// counted as a miss.
    fn get(&self, key: &str) -> Option<Arc<str>> {
        let mut entries = self.entries.lock();

        let expired = match entries.get(key) {
            Some(entry) if entry.expired() => true,
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.value));
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            if let Some(old) = entries.pop(key) {
                self.bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert, evicting the least recently accessed entry when at capacity.
    fn insert(&self, key: String, entry: CacheEntry) {
        let mut entries = self.entries.lock();
        self.bytes.fetch_add(entry.size_bytes, Ordering::Relaxed);

        if let Some((evicted_key, evicted)) = entries.push(key.clone(), entry) {
            self.bytes.fetch_sub(evicted.size_bytes, Ordering::Relaxed);
            // A returned pair with a different key is a capacity eviction;
            // the same key is just a value replacement.
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(tier = %self.tier, key = %evicted_key, "Evicted least recently used entry");
            }
        }
    }

    fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.lock();
        if let Some(old) = entries.pop(key) {
            self.bytes.fetch_sub(old.size_bytes, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn remove_matching<F: Fn(&str) -> bool>(&self, matches: F) -> usize {
        let keys: Vec<String> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(key, _)| matches(key))
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut removed = 0;
        for key in keys {
            if self.remove(&key) {
                removed += 1;
            }
        }
        removed
    }

    fn sweep_expired(&self) -> usize {
        let keys: Vec<String> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, entry)| entry.expired())
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut removed = 0;
        for key in keys {
            if self.remove(&key) {
                removed += 1;
            }
        }
        removed
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Per-tier counters snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierMetrics {
    pub tier: CacheTier,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub tiers: Vec<TierMetrics>,
    pub total_hits: u64,
    pub total_misses: u64,
    /// Aggregate hit rate over the current metrics window. 1.0 when no
    /// lookups were recorded yet.
    pub hit_rate: f64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHealth {
    pub healthy: bool,
    pub hit_rate: f64,
    pub lookups: u64,
    pub total_bytes: u64,
}

/// An entry to pre-populate via `warm_cache`.
#[derive(Debug, Clone)]
pub struct WarmEntry {
    pub tier: CacheTier,
    pub key: String,
    pub value: String,
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

pub struct TemplateCache {
    config: CacheConfig,
    tiers: [Tier; 4],
    /// Dependency tag to the (tier, key) pairs that carried it. Entries
    /// removed by other means are cleaned up lazily; invalidating an
    /// already absent key is a no-op.
    tag_index: DashMap<String, HashSet<(CacheTier, String)>>,
    task_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TemplateCache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        let tiers = [
            Tier::new(CacheTier::Raw, &config.raw),
            Tier::new(CacheTier::Compiled, &config.compiled),
            Tier::new(CacheTier::Rendered, &config.rendered),
            Tier::new(CacheTier::Metadata, &config.metadata),
        ];
        Arc::new(Self {
            config,
            tiers,
            tag_index: DashMap::new(),
            task_handles: Mutex::new(Vec::new()),
        })
    }

    fn tier(&self, tier: CacheTier) -> &Tier {
        match tier {
            CacheTier::Raw => &self.tiers[0],
            CacheTier::Compiled => &self.tiers[1],
            CacheTier::Rendered => &self.tiers[2],
            CacheTier::Metadata => &self.tiers[3],
        }
    }

    /// Return the cached value for `key` or invoke `compute`, store the
    /// result and return it. Compute failures propagate unchanged and leave
    /// the cache untouched. The tier lock is never held across the compute
    /// await.
    pub async fn get_or_compute<F, Fut>(
        &self,
        tier: CacheTier,
        key: &str,
        compute: F,
        options: CacheOptions,
    ) -> Result<Arc<str>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<String>>,
    {
        if options.skip_cache {
            let value = compute().await.map_err(CacheError::ComputeFailed)?;
            return Ok(Arc::from(value));
        }

        if let Some(value) = self.tier(tier).get(key) {
            return Ok(value);
        }

        let value = compute().await.map_err(CacheError::ComputeFailed)?;
        let shared: Arc<str> = Arc::from(value);
        self.store(tier, key.to_string(), Arc::clone(&shared), options.ttl_override, &options.tags);
        Ok(shared)
    }

    fn store(
        &self,
        tier: CacheTier,
        key: String,
        value: Arc<str>,
        ttl_override: Option<Duration>,
        tags: &[String],
    ) {
        let tier_ref = self.tier(tier);
        let entry = CacheEntry {
            size_bytes: value.len() as u64,
            value,
            inserted_at: Instant::now(),
            ttl: ttl_override.unwrap_or(tier_ref.default_ttl),
        };

        for tag in tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert((tier, key.clone()));
        }

        tier_ref.insert(key, entry);
    }

    /// Pre-populate tiers, bypassing hit/miss accounting.
    pub fn warm_cache(&self, entries: Vec<WarmEntry>) {
        let count = entries.len();
        for warm in entries {
            self.store(
                warm.tier,
                warm.key,
                Arc::from(warm.value),
                warm.ttl,
                &warm.tags,
            );
        }
        info!(entries = count, "Cache warmed");
    }

    /// Remove every entry whose key contains `fragment`, across all tiers.
    pub fn invalidate_key_fragment(&self, fragment: &str) -> usize {
        let removed: usize = self
            .tiers
            .iter()
            .map(|tier| tier.remove_matching(|key| key.contains(fragment)))
            .sum();
        info!(fragment = %fragment, removed = removed, "Invalidated by key fragment");
        removed
    }

    /// Remove every entry whose key matches the regex, across all tiers.
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let re = Regex::new(pattern)?;
        let removed: usize = self
            .tiers
            .iter()
            .map(|tier| tier.remove_matching(|key| re.is_match(key)))
            .sum();
        info!(pattern = %pattern, removed = removed, "Invalidated by pattern");
        Ok(removed)
    }

    /// Remove every entry that declared a dependency on any of `tags`.
    pub fn invalidate_tags(&self, tags: &[&str]) -> usize {
        let mut removed = 0;
        for tag in tags {
            let Some((_, dependents)) = self.tag_index.remove(*tag) else {
                continue;
            };
            for (tier, key) in dependents {
                if self.tier(tier).remove(&key) {
                    removed += 1;
                }
            }
        }
        info!(tags = ?tags, removed = removed, "Invalidated by dependency tags");
        removed
    }

    pub fn get_metrics(&self) -> CacheMetrics {
        let tiers: Vec<TierMetrics> = self
            .tiers
            .iter()
            .map(|tier| TierMetrics {
                tier: tier.tier,
                hits: tier.hits.load(Ordering::Relaxed),
                misses: tier.misses.load(Ordering::Relaxed),
                evictions: tier.evictions.load(Ordering::Relaxed),
                entries: tier.len(),
                bytes: tier.bytes.load(Ordering::Relaxed),
            })
            .collect();

        let total_hits: u64 = tiers.iter().map(|t| t.hits).sum();
        let total_misses: u64 = tiers.iter().map(|t| t.misses).sum();
        let lookups = total_hits + total_misses;
        let hit_rate = if lookups == 0 {
            1.0
        } else {
            total_hits as f64 / lookups as f64
        };
        let total_bytes: u64 = tiers.iter().map(|t| t.bytes).sum();

        CacheMetrics {
            tiers,
            total_hits,
            total_misses,
            hit_rate,
            total_bytes,
        }
    }

    /// Unhealthy when the hit rate is below the floor with statistically
    /// significant volume, or cached bytes exceed the ceiling.
    pub fn health_check(&self) -> CacheHealth {
        let metrics = self.get_metrics();
        let lookups = metrics.total_hits + metrics.total_misses;

        let low_hit_rate = lookups >= self.config.min_lookups_for_health
            && metrics.hit_rate < self.config.min_hit_rate;
        let over_budget = metrics.total_bytes > self.config.max_total_bytes;

        if low_hit_rate {
            warn!(
                hit_rate = metrics.hit_rate,
                lookups = lookups,
                "Cache hit rate below healthy floor"
            );
        }
        if over_budget {
            warn!(
                total_bytes = metrics.total_bytes,
                ceiling = self.config.max_total_bytes,
                "Cached payload bytes over ceiling"
            );
        }

        CacheHealth {
            healthy: !low_hit_rate && !over_budget,
            hit_rate: metrics.hit_rate,
            lookups,
            total_bytes: metrics.total_bytes,
        }
    }

    /// Eagerly drop entries past their TTL. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let removed: usize = self.tiers.iter().map(|tier| tier.sweep_expired()).sum();
        if removed > 0 {
            debug!(removed = removed, "TTL sweep removed expired entries");
        }
        removed
    }

    /// Reset the rolling hit/miss window.
    pub fn reset_metrics(&self) {
        for tier in &self.tiers {
            tier.hits.store(0, Ordering::Relaxed);
            tier.misses.store(0, Ordering::Relaxed);
        }
        debug!("Cache hit/miss window reset");
    }

    /// Start the TTL sweep and metrics reset tasks.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.task_handles.lock();
        if !handles.is_empty() {
            return;
        }

        let cache = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.config.sweep_interval);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                cache.sweep_expired();
            }
        }));

        let cache = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.config.metrics_reset_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                cache.reset_metrics();
            }
        }));

        info!("TemplateCache maintenance tasks started");
    }

    pub fn shutdown(&self) {
        let mut handles = self.task_handles.lock();
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("TemplateCache maintenance tasks stopped");
    }
}
