// Cache eviction strategies.
//
// A strategy wraps a backend and layers an eviction/expiry discipline on
// top of it: TTL tracks its own expiry map for backends without native
// TTL, LRU keeps an access order bounded by max_size, LFU keeps aged
// frequency counters. All three expose the backend interface plus their
// strategy name in stats.

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::cache::backends::{glob_to_regex, CacheBackend};
use crate::error::CacheBackendError;

type BackendResult<T> = Result<T, CacheBackendError>;

/// Strategy interface, mirroring the backend operations.
#[async_trait]
pub trait CacheStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> BackendResult<Option<Json>>;

    async fn set(&self, key: &str, value: Json, ttl: Option<Duration>) -> BackendResult<bool>;

    async fn delete(&self, key: &str) -> BackendResult<bool>;

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn clear(&self) -> BackendResult<bool>;

    async fn invalidate_pattern(&self, pattern: &str) -> BackendResult<usize>;

    async fn stats(&self) -> BackendResult<Json>;
}

// ============================================================================
// TTL strategy
// ============================================================================

/// Time-to-live strategy with a default TTL and lazy expiry.
///
/// Keeps its own expiry map so backends without native TTL still expire;
/// a lightweight sweep runs opportunistically when the cleanup interval
/// has elapsed.
pub struct TtlStrategy {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
    cleanup_interval: Duration,
    tracking: parking_lot::Mutex<TtlTracking>,
}

struct TtlTracking {
    expiry: HashMap<String, Instant>,
    last_cleanup: Instant,
}

impl TtlStrategy {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        default_ttl: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            backend,
            default_ttl,
            cleanup_interval,
            tracking: parking_lot::Mutex::new(TtlTracking {
                expiry: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    fn is_expired(&self, key: &str) -> bool {
        let tracking = self.tracking.lock();
        tracking
            .expiry
            .get(key)
            .is_some_and(|deadline| *deadline <= Instant::now())
    }

    /// Collect expired keys if the cleanup interval has elapsed.
    fn take_expired(&self) -> Vec<String> {
        let mut tracking = self.tracking.lock();
        let now = Instant::now();
        if now.duration_since(tracking.last_cleanup) < self.cleanup_interval {
            return Vec::new();
        }
        tracking.last_cleanup = now;

        let expired: Vec<String> = tracking
            .expiry
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            tracking.expiry.remove(key);
        }
        expired
    }
}

#[async_trait]
impl CacheStrategy for TtlStrategy {
    fn name(&self) -> &'static str {
        "ttl"
    }

    async fn get(&self, key: &str) -> BackendResult<Option<Json>> {
        if self.is_expired(key) {
            self.delete(key).await?;
            return Ok(None);
        }

        for expired in self.take_expired() {
            let _ = self.backend.delete(&expired).await;
        }

        self.backend.get(key).await
    }

    async fn set(&self, key: &str, value: Json, ttl: Option<Duration>) -> BackendResult<bool> {
        let effective = ttl.filter(|d| !d.is_zero()).unwrap_or(self.default_ttl);
        if !effective.is_zero() {
            self.tracking
                .lock()
                .expiry
                .insert(key.to_string(), Instant::now() + effective);
        }
        self.backend.set(key, value, Some(effective)).await
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        self.tracking.lock().expiry.remove(key);
        self.backend.delete(key).await
    }

    async fn clear(&self) -> BackendResult<bool> {
        self.tracking.lock().expiry.clear();
        self.backend.clear().await
    }

    async fn invalidate_pattern(&self, pattern: &str) -> BackendResult<usize> {
        if let Some(regex) = glob_to_regex(pattern) {
            self.tracking.lock().expiry.retain(|k, _| !regex.is_match(k));
        }
        self.backend.invalidate_pattern(pattern).await
    }

    async fn stats(&self) -> BackendResult<Json> {
        let mut stats = self.backend.stats().await?;
        let tracking = self.tracking.lock();
        let now = Instant::now();
        let expired = tracking
            .expiry
            .values()
            .filter(|deadline| **deadline <= now)
            .count();
        stats["strategy"] = json!("ttl");
        stats["default_ttl_secs"] = json!(self.default_ttl.as_secs());
        stats["tracked_expiries"] = json!(tracking.expiry.len());
        stats["expired_items"] = json!(expired);
        Ok(stats)
    }
}

// ============================================================================
// LRU strategy
// ============================================================================

/// Least-recently-used strategy bounded by `max_size`.
pub struct LruStrategy {
    backend: Arc<dyn CacheBackend>,
    max_size: usize,
    /// Keys in access order; last entry is most recently used.
    access_order: parking_lot::Mutex<Vec<String>>,
}

impl LruStrategy {
    pub fn new(backend: Arc<dyn CacheBackend>, max_size: usize) -> Self {
        Self {
            backend,
            max_size,
            access_order: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn touch(&self, key: &str) {
        let mut order = self.access_order.lock();
        order.retain(|k| k != key);
        order.push(key.to_string());
    }

    /// Keys to evict so the tracked set fits `max_size`.
    fn take_eviction_victims(&self) -> Vec<String> {
        let mut order = self.access_order.lock();
        let mut victims = Vec::new();
        while order.len() > self.max_size {
            victims.push(order.remove(0));
        }
        victims
    }
}

#[async_trait]
impl CacheStrategy for LruStrategy {
    fn name(&self) -> &'static str {
        "lru"
    }

    async fn get(&self, key: &str) -> BackendResult<Option<Json>> {
        let value = self.backend.get(key).await?;
        if value.is_some() {
            self.touch(key);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Json, ttl: Option<Duration>) -> BackendResult<bool> {
        let stored = self.backend.set(key, value, ttl).await?;
        if stored {
            self.touch(key);
            for victim in self.take_eviction_victims() {
                debug!(key = %victim, "lru strategy evicting");
                let _ = self.backend.delete(&victim).await;
            }
        }
        Ok(stored)
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        self.access_order.lock().retain(|k| k != key);
        self.backend.delete(key).await
    }

    async fn clear(&self) -> BackendResult<bool> {
        self.access_order.lock().clear();
        self.backend.clear().await
    }

    async fn invalidate_pattern(&self, pattern: &str) -> BackendResult<usize> {
        if let Some(regex) = glob_to_regex(pattern) {
            self.access_order.lock().retain(|k| !regex.is_match(k));
        }
        self.backend.invalidate_pattern(pattern).await
    }

    async fn stats(&self) -> BackendResult<Json> {
        let mut stats = self.backend.stats().await?;
        let tracked = self.access_order.lock().len();
        stats["strategy"] = json!("lru");
        stats["max_size"] = json!(self.max_size);
        stats["tracked_keys"] = json!(tracked);
        stats["utilization"] = json!(
            ((tracked as f64 / self.max_size as f64) * 10000.0).round() / 100.0
        );
        Ok(stats)
    }
}

// ============================================================================
// LFU strategy
// ============================================================================

/// Least-frequently-used strategy with frequency aging.
///
/// Between agings the minimum-frequency key is the eviction victim; the
/// periodic aging multiplies every counter by `aging_factor` so stale
/// popularity decays.
pub struct LfuStrategy {
    backend: Arc<dyn CacheBackend>,
    max_size: usize,
    aging_factor: f64,
    aging_interval: Duration,
    tracking: parking_lot::Mutex<LfuTracking>,
}

struct LfuTracking {
    frequencies: HashMap<String, u64>,
    last_aging: Instant,
}

impl LfuStrategy {
    pub fn new(backend: Arc<dyn CacheBackend>, max_size: usize, aging_factor: f64) -> Self {
        Self {
            backend,
            max_size,
            aging_factor: aging_factor.clamp(0.0, 1.0),
            aging_interval: Duration::from_secs(3600),
            tracking: parking_lot::Mutex::new(LfuTracking {
                frequencies: HashMap::new(),
                last_aging: Instant::now(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_aging_interval(mut self, interval: Duration) -> Self {
        self.aging_interval = interval;
        self
    }

    fn bump(&self, key: &str) {
        let mut tracking = self.tracking.lock();
        *tracking.frequencies.entry(key.to_string()).or_insert(0) += 1;
        self.age_if_due(&mut tracking);
    }

    fn age_if_due(&self, tracking: &mut LfuTracking) {
        let now = Instant::now();
        if now.duration_since(tracking.last_aging) < self.aging_interval {
            return;
        }
        tracking.last_aging = now;
        for freq in tracking.frequencies.values_mut() {
            *freq = (*freq as f64 * self.aging_factor) as u64;
        }
        tracking.frequencies.retain(|_, freq| *freq > 0);
        debug!("lfu strategy aged frequencies");
    }

    fn take_eviction_victims(&self) -> Vec<String> {
        let mut tracking = self.tracking.lock();
        let mut victims = Vec::new();
        while tracking.frequencies.len() > self.max_size {
            let Some(victim) = tracking
                .frequencies
                .iter()
                .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            tracking.frequencies.remove(&victim);
            victims.push(victim);
        }
        victims
    }
}

#[async_trait]
impl CacheStrategy for LfuStrategy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    async fn get(&self, key: &str) -> BackendResult<Option<Json>> {
        let value = self.backend.get(key).await?;
        if value.is_some() {
            self.bump(key);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Json, ttl: Option<Duration>) -> BackendResult<bool> {
        let stored = self.backend.set(key, value, ttl).await?;
        if stored {
            {
                let mut tracking = self.tracking.lock();
                tracking.frequencies.entry(key.to_string()).or_insert(1);
            }
            for victim in self.take_eviction_victims() {
                debug!(key = %victim, "lfu strategy evicting");
                let _ = self.backend.delete(&victim).await;
            }
        }
        Ok(stored)
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        self.tracking.lock().frequencies.remove(key);
        self.backend.delete(key).await
    }

    async fn clear(&self) -> BackendResult<bool> {
        self.tracking.lock().frequencies.clear();
        self.backend.clear().await
    }

    async fn invalidate_pattern(&self, pattern: &str) -> BackendResult<usize> {
        if let Some(regex) = glob_to_regex(pattern) {
            self.tracking
                .lock()
                .frequencies
                .retain(|k, _| !regex.is_match(k));
        }
        self.backend.invalidate_pattern(pattern).await
    }

    async fn stats(&self) -> BackendResult<Json> {
        let mut stats = self.backend.stats().await?;
        let tracking = self.tracking.lock();
        let freqs: Vec<u64> = tracking.frequencies.values().copied().collect();
        let avg = if freqs.is_empty() {
            0.0
        } else {
            freqs.iter().sum::<u64>() as f64 / freqs.len() as f64
        };
        stats["strategy"] = json!("lfu");
        stats["max_size"] = json!(self.max_size);
        stats["tracked_keys"] = json!(tracking.frequencies.len());
        stats["aging_factor"] = json!(self.aging_factor);
        stats["avg_frequency"] = json!((avg * 100.0).round() / 100.0);
        stats["max_frequency"] = json!(freqs.iter().max().copied().unwrap_or(0));
        stats["min_frequency"] = json!(freqs.iter().min().copied().unwrap_or(0));
        Ok(stats)
    }
}
