// Cache manager.
//
// The facade callers use. Owns named {backend, strategy} pairs and a
// default pick, gates everything behind a process-level enabled flag,
// and keeps cache failures off the hot path: a backend error on get/set
// degrades to a miss/no-op and is counted, never raised.

use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cache::backends::{CacheBackend, MemoryCache, RedisCache, RedisCacheConfig};
use crate::cache::keys::{make_query_cache_key, make_record_cache_key, CacheKey};
use crate::cache::stampede::StampedeGuard;
use crate::cache::strategies::{CacheStrategy, LfuStrategy, LruStrategy, TtlStrategy};
use crate::common::DEFAULT_CACHE_TTL_SECS;
use crate::error::{CacheError, Result};
use crate::Domain;

/// Eviction strategy selector for `CacheManager` setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Ttl,
    Lru,
    Lfu,
}

struct CachePair {
    backend: Arc<dyn CacheBackend>,
    strategy: Arc<dyn CacheStrategy>,
}

#[derive(Default)]
struct ManagerStats {
    total_gets: u64,
    total_sets: u64,
    total_deletes: u64,
    total_hits: u64,
    total_misses: u64,
    degraded_errors: u64,
}

/// Facade over cache backends and strategies.
pub struct CacheManager {
    pairs: parking_lot::RwLock<HashMap<String, Arc<CachePair>>>,
    default_backend: parking_lot::RwLock<String>,
    enabled: parking_lot::RwLock<bool>,
    default_ttl: Duration,
    stats: parking_lot::Mutex<ManagerStats>,
    stampede: StampedeGuard,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager {
    pub fn new() -> Self {
        Self {
            pairs: parking_lot::RwLock::new(HashMap::new()),
            default_backend: parking_lot::RwLock::new("memory".to_string()),
            enabled: parking_lot::RwLock::new(true),
            default_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            stats: parking_lot::Mutex::new(ManagerStats::default()),
            stampede: StampedeGuard::default(),
        }
    }

    /// Register an in-memory backend under `name` with the given
    /// strategy.
    pub fn setup_memory_cache(
        &self,
        name: &str,
        max_size: usize,
        default_ttl: Option<Duration>,
        strategy: StrategyKind,
    ) {
        let backend: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new(
            max_size,
            default_ttl.or(Some(self.default_ttl)),
            Duration::from_secs(60),
        ));
        let strategy = self.build_strategy(strategy, Arc::clone(&backend), max_size);
        self.register(name, backend, strategy);
    }

    /// Register a Redis backend under `name`. Connects and pings before
    /// the backend is considered usable.
    pub async fn setup_redis_cache(
        &self,
        name: &str,
        config: RedisCacheConfig,
        strategy: StrategyKind,
    ) -> Result<()> {
        let backend = RedisCache::new(config);
        backend.connect().await.map_err(CacheError::from)?;
        let backend: Arc<dyn CacheBackend> = Arc::new(backend);
        let strategy = self.build_strategy(strategy, Arc::clone(&backend), 1000);
        self.register(name, backend, strategy);
        info!(name, "redis cache backend registered");
        Ok(())
    }

    fn build_strategy(
        &self,
        kind: StrategyKind,
        backend: Arc<dyn CacheBackend>,
        max_size: usize,
    ) -> Arc<dyn CacheStrategy> {
        match kind {
            StrategyKind::Ttl => Arc::new(TtlStrategy::new(
                backend,
                self.default_ttl,
                Duration::from_secs(60),
            )),
            StrategyKind::Lru => Arc::new(LruStrategy::new(backend, max_size)),
            StrategyKind::Lfu => Arc::new(LfuStrategy::new(backend, max_size, 0.9)),
        }
    }

    fn register(
        &self,
        name: &str,
        backend: Arc<dyn CacheBackend>,
        strategy: Arc<dyn CacheStrategy>,
    ) {
        self.pairs
            .write()
            .insert(name.to_string(), Arc::new(CachePair { backend, strategy }));
    }

    pub fn set_default_backend(&self, name: &str) -> Result<()> {
        if !self.pairs.read().contains_key(name) {
            return Err(CacheError::Key(format!("backend '{}' not found", name)).into());
        }
        *self.default_backend.write() = name.to_string();
        Ok(())
    }

    fn pair(&self, backend: Option<&str>) -> Option<Arc<CachePair>> {
        let pairs = self.pairs.read();
        let name = backend
            .map(str::to_string)
            .unwrap_or_else(|| self.default_backend.read().clone());
        let pair = pairs.get(&name).cloned();
        if pair.is_none() {
            warn!(backend = %name, "cache backend not found");
        }
        pair
    }

    pub fn enable(&self) {
        *self.enabled.write() = true;
        info!("cache enabled");
    }

    pub fn disable(&self) {
        *self.enabled.write() = false;
        info!("cache disabled");
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.read()
    }

    /// Shared stampede guard for callers that want origin deduplication.
    pub fn stampede_guard(&self) -> &StampedeGuard {
        &self.stampede
    }

    /// Get a value. Disabled manager or backend failure reads as a miss.
    pub async fn get(&self, key: &CacheKey, backend: Option<&str>) -> Option<Json> {
        if !self.is_enabled() {
            return None;
        }
        let pair = self.pair(backend)?;

        self.stats.lock().total_gets += 1;
        match pair.strategy.get(&key.key).await {
            Ok(Some(value)) => {
                self.stats.lock().total_hits += 1;
                Some(value)
            }
            Ok(None) => {
                self.stats.lock().total_misses += 1;
                None
            }
            Err(err) => {
                let mut stats = self.stats.lock();
                stats.total_misses += 1;
                stats.degraded_errors += 1;
                drop(stats);
                error!(key = %key.key, error = %err, "cache get degraded to miss");
                None
            }
        }
    }

    /// Set a value. Disabled manager or backend failure is a no-op
    /// returning false.
    pub async fn set(
        &self,
        key: &CacheKey,
        value: Json,
        ttl: Option<Duration>,
        backend: Option<&str>,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let Some(pair) = self.pair(backend) else {
            return false;
        };

        self.stats.lock().total_sets += 1;
        match pair.strategy.set(&key.key, value, ttl).await {
            Ok(stored) => stored,
            Err(err) => {
                self.stats.lock().degraded_errors += 1;
                error!(key = %key.key, error = %err, "cache set degraded to no-op");
                false
            }
        }
    }

    pub async fn delete(&self, key: &CacheKey, backend: Option<&str>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let Some(pair) = self.pair(backend) else {
            return false;
        };

        self.stats.lock().total_deletes += 1;
        match pair.strategy.delete(&key.key).await {
            Ok(existed) => existed,
            Err(err) => {
                self.stats.lock().degraded_errors += 1;
                error!(key = %key.key, error = %err, "cache delete degraded");
                false
            }
        }
    }

    pub async fn exists(&self, key: &CacheKey, backend: Option<&str>) -> bool {
        self.get(key, backend).await.is_some()
    }

    /// Clear one backend, or every backend when `backend` is None.
    pub async fn clear(&self, backend: Option<&str>) -> bool {
        if let Some(name) = backend {
            let Some(pair) = self.pair(Some(name)) else {
                return false;
            };
            return pair.strategy.clear().await.unwrap_or(false);
        }

        let pairs: Vec<Arc<CachePair>> = self.pairs.read().values().cloned().collect();
        let mut all_ok = true;
        for pair in pairs {
            all_ok &= pair.strategy.clear().await.unwrap_or(false);
        }
        all_ok
    }

    /// Remove every key matching a glob pattern; returns the count.
    pub async fn invalidate_pattern(&self, pattern: &str, backend: Option<&str>) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let Some(pair) = self.pair(backend) else {
            return 0;
        };

        match pair.strategy.invalidate_pattern(pattern).await {
            Ok(count) => count,
            Err(err) => {
                error!(pattern, error = %err, "pattern invalidation failed");
                0
            }
        }
    }

    /// Invalidate every key scoped to a model (`{model}:*`).
    pub async fn invalidate_model(&self, model: &str, backend: Option<&str>) -> usize {
        self.invalidate_pattern(&format!("{}:*", model), backend)
            .await
    }

    /// Cache a query result under its structured key.
    pub async fn cache_query_result(
        &self,
        model: &str,
        domain: &Domain,
        fields: Option<&[String]>,
        result: Json,
        ttl: Option<Duration>,
    ) -> bool {
        let Ok(key) = make_query_cache_key(model, domain, fields) else {
            return false;
        };
        self.set(&key, result, ttl, None).await
    }

    /// Look up a cached query result by its structured key.
    pub async fn get_cached_query_result(
        &self,
        model: &str,
        domain: &Domain,
        fields: Option<&[String]>,
    ) -> Option<Json> {
        let key = make_query_cache_key(model, domain, fields).ok()?;
        self.get(&key, None).await
    }

    /// Cache record data under `{model}:record:{ids}[:{fields}]`.
    pub async fn cache_model_record(
        &self,
        model: &str,
        ids: &[i64],
        fields: Option<&[String]>,
        data: Json,
        ttl: Option<Duration>,
    ) -> bool {
        let Ok(key) = make_record_cache_key(model, ids, fields) else {
            return false;
        };
        self.set(&key, data, ttl, None).await
    }

    /// Look up cached record data.
    pub async fn get_cached_model_record(
        &self,
        model: &str,
        ids: &[i64],
        fields: Option<&[String]>,
    ) -> Option<Json> {
        let key = make_record_cache_key(model, ids, fields).ok()?;
        self.get(&key, None).await
    }

    /// Aggregate statistics across the manager and every backend.
    pub async fn stats(&self) -> Json {
        let manager = {
            let stats = self.stats.lock();
            json!({
                "total_gets": stats.total_gets,
                "total_sets": stats.total_sets,
                "total_deletes": stats.total_deletes,
                "total_hits": stats.total_hits,
                "total_misses": stats.total_misses,
                "degraded_errors": stats.degraded_errors,
                "stampede_prevented": self.stampede.prevented_count(),
            })
        };

        let pairs: Vec<(String, Arc<CachePair>)> = self
            .pairs
            .read()
            .iter()
            .map(|(name, pair)| (name.clone(), Arc::clone(pair)))
            .collect();

        let mut backends = serde_json::Map::new();
        for (name, pair) in pairs {
            let stats = pair.strategy.stats().await.unwrap_or_else(|err| {
                json!({"error": err.to_string()})
            });
            backends.insert(name, stats);
        }

        json!({
            "manager": manager,
            "backends": Json::Object(backends),
        })
    }

    /// Shut down every backend and drop inflight promises.
    pub async fn close(&self) {
        let pairs: Vec<Arc<CachePair>> = self.pairs.read().values().cloned().collect();
        for pair in pairs {
            pair.backend.close().await;
        }
        self.stampede.clear();
        info!("cache manager closed");
    }
}
