// Caching call wrappers.
//
// The behaviors the source exposed as function decorators, lifted into
// explicit wrapper types owned by the caller: plain read-through caching
// with optional stampede protection, sliding expiration, a per-function
// circuit breaker that can serve stale values, and detailed call
// metrics. None of them affect functional behavior beyond caching.

use serde_json::{json, Value as Json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::cache::backends::CircuitBreaker;
use crate::cache::keys::{hash_params, CacheKey};
use crate::cache::manager::CacheManager;
use crate::error::{CacheError, ClientError, Result};

/// Build a cache key for a named function call: `[prefix:]name[:hash8]`.
///
/// The hash covers the call arguments; argument-free calls omit it.
pub fn function_cache_key(
    name: &str,
    args: Option<&Json>,
    prefix: Option<&str>,
) -> Result<CacheKey> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(prefix) = prefix {
        parts.push(prefix.to_string());
    }
    parts.push(name.to_string());
    if let Some(args) = args {
        parts.push(hash_params(args));
    }
    let key = parts.join(":");
    CacheKey::new(key).map_err(ClientError::from)
}

// ============================================================================
// Call metrics
// ============================================================================

#[derive(Default)]
struct MetricsInner {
    hits: u64,
    misses: u64,
    errors: u64,
    stampede_prevented: u64,
    total_requests: u64,
    total_response_time: Duration,
    min_response_time: Option<Duration>,
    max_response_time: Duration,
    key_access_counts: HashMap<String, u64>,
    error_types: HashMap<String, u64>,
}

/// Per-wrapper call metrics.
pub struct CallMetrics {
    inner: parking_lot::Mutex<MetricsInner>,
}

impl Default for CallMetrics {
    fn default() -> Self {
        Self {
            inner: parking_lot::Mutex::new(MetricsInner::default()),
        }
    }
}

impl CallMetrics {
    fn record_request(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;
        *inner.key_access_counts.entry(key.to_string()).or_insert(0) += 1;
    }

    fn record_hit(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.hits += 1;
        Self::record_time(&mut inner, elapsed);
    }

    fn record_miss(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        inner.misses += 1;
        Self::record_time(&mut inner, elapsed);
    }

    fn record_error(&self, err: &ClientError) {
        let mut inner = self.inner.lock();
        inner.errors += 1;
        let kind = error_kind(err);
        *inner.error_types.entry(kind.to_string()).or_insert(0) += 1;
    }

    fn record_stampede_prevented(&self) {
        self.inner.lock().stampede_prevented += 1;
    }

    fn record_time(inner: &mut MetricsInner, elapsed: Duration) {
        inner.total_response_time += elapsed;
        inner.max_response_time = inner.max_response_time.max(elapsed);
        inner.min_response_time = Some(match inner.min_response_time {
            Some(min) => min.min(elapsed),
            None => elapsed,
        });
    }

    /// Snapshot of the collected metrics.
    pub fn snapshot(&self) -> Json {
        let inner = self.inner.lock();
        let avg = if inner.total_requests > 0 {
            inner.total_response_time.as_secs_f64() / inner.total_requests as f64
        } else {
            0.0
        };
        let hit_rate = if inner.total_requests > 0 {
            inner.hits as f64 / inner.total_requests as f64
        } else {
            0.0
        };
        json!({
            "hits": inner.hits,
            "misses": inner.misses,
            "errors": inner.errors,
            "stampede_prevented": inner.stampede_prevented,
            "total_requests": inner.total_requests,
            "hit_rate": hit_rate,
            "avg_response_time_secs": avg,
            "min_response_time_secs": inner.min_response_time.map(|d| d.as_secs_f64()),
            "max_response_time_secs": inner.max_response_time.as_secs_f64(),
            "key_access_counts": inner.key_access_counts,
            "error_types": inner.error_types,
        })
    }

    pub fn reset(&self) {
        *self.inner.lock() = MetricsInner::default();
    }
}

fn error_kind(err: &ClientError) -> &'static str {
    match err {
        ClientError::Authentication(_) => "authentication",
        ClientError::Access(_) => "access",
        ClientError::Validation(_) => "validation",
        ClientError::Connection(_) => "connection",
        ClientError::Timeout(_) => "timeout",
        ClientError::NotFound(_) => "not_found",
        ClientError::MultipleMatches(_) => "multiple_matches",
        ClientError::Server(_) => "server",
        ClientError::Session(_) => "session",
        ClientError::Cache(_) => "cache",
        ClientError::Transaction(_) => "transaction",
        ClientError::Internal(_) => "internal",
    }
}

// ============================================================================
// Read-through caching with optional stampede protection
// ============================================================================

/// Read-through cache around an async origin computation.
pub struct CachedCall {
    manager: Arc<CacheManager>,
    ttl: Option<Duration>,
    backend: Option<String>,
    prevent_stampede: bool,
    metrics: CallMetrics,
}

impl CachedCall {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self {
            manager,
            ttl: None,
            backend: None,
            prevent_stampede: true,
            metrics: CallMetrics::default(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn without_stampede_protection(mut self) -> Self {
        self.prevent_stampede = false;
        self
    }

    pub fn metrics(&self) -> &CallMetrics {
        &self.metrics
    }

    /// Return the cached value for `key`, or run `origin` once, cache
    /// the result, and return it. Under stampede protection, N
    /// concurrent misses share a single origin run.
    pub async fn get_or_compute<F, Fut>(&self, key: &CacheKey, origin: F) -> Result<Json>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Json>>,
    {
        let start = Instant::now();
        self.metrics.record_request(&key.key);

        if let Some(value) = self.manager.get(key, self.backend.as_deref()).await {
            self.metrics.record_hit(start.elapsed());
            debug!(key = %key.key, "cached call hit");
            return Ok(value);
        }

        let manager = Arc::clone(&self.manager);
        let ttl = self.ttl;
        let backend = self.backend.clone();
        let store_key = key.clone();
        let fetch = move || async move {
            let value = origin().await?;
            manager
                .set(&store_key, value.clone(), ttl, backend.as_deref())
                .await;
            Ok(value)
        };

        let result = if self.prevent_stampede {
            let (result, prevented) = self
                .manager
                .stampede_guard()
                .get_or_run(&key.key, fetch)
                .await;
            if prevented {
                self.metrics.record_stampede_prevented();
            }
            result
        } else {
            fetch().await
        };

        match &result {
            Ok(_) => self.metrics.record_miss(start.elapsed()),
            Err(err) => {
                self.metrics.record_miss(start.elapsed());
                self.metrics.record_error(err);
            }
        }
        result
    }
}

// ============================================================================
// Sliding expiration
// ============================================================================

/// Read-through cache that extends the TTL of entries on every hit.
pub struct SlidingCache {
    manager: Arc<CacheManager>,
    ttl: Duration,
    max_ttl: Option<Duration>,
    slide_factor: f64,
    backend: Option<String>,
}

impl SlidingCache {
    pub fn new(manager: Arc<CacheManager>, ttl: Duration, slide_factor: f64) -> Self {
        Self {
            manager,
            ttl,
            max_ttl: None,
            slide_factor,
            backend: None,
        }
    }

    pub fn with_max_ttl(mut self, max_ttl: Duration) -> Self {
        self.max_ttl = Some(max_ttl);
        self
    }

    fn slid_ttl(&self) -> Duration {
        let slid = self.ttl.as_secs_f64() * self.slide_factor;
        let capped = match self.max_ttl {
            Some(max) => slid.min(max.as_secs_f64()),
            None => slid,
        };
        Duration::from_secs_f64(capped)
    }

    pub async fn get_or_compute<F, Fut>(&self, key: &CacheKey, origin: F) -> Result<Json>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Json>>,
    {
        if let Some(value) = self.manager.get(key, self.backend.as_deref()).await {
            let slid = self.slid_ttl();
            self.manager
                .set(key, value.clone(), Some(slid), self.backend.as_deref())
                .await;
            debug!(key = %key.key, slid_secs = slid.as_secs(), "slid cache ttl");
            return Ok(value);
        }

        let value = origin().await?;
        self.manager
            .set(key, value.clone(), Some(self.ttl), self.backend.as_deref())
            .await;
        Ok(value)
    }
}

// ============================================================================
// Circuit-breaking cache
// ============================================================================

struct StaleEntry {
    value: Json,
    stored_at: Instant,
}

/// Circuit-wrapped caching.
///
/// After `threshold` consecutive origin failures the circuit opens and
/// the wrapper serves the last known value (even past its TTL) for up to
/// `fallback_ttl` from the trip; with nothing to serve it fails fast.
/// After `recovery_timeout` one probe call re-enters the origin.
pub struct CircuitCache {
    manager: Arc<CacheManager>,
    ttl: Option<Duration>,
    fallback_ttl: Duration,
    breaker: parking_lot::Mutex<CircuitBreaker>,
    stale: parking_lot::Mutex<HashMap<String, StaleEntry>>,
    backend: Option<String>,
}

impl CircuitCache {
    pub fn new(
        manager: Arc<CacheManager>,
        ttl: Option<Duration>,
        threshold: u32,
        recovery_timeout: Duration,
        fallback_ttl: Duration,
    ) -> Self {
        Self {
            manager,
            ttl,
            fallback_ttl,
            breaker: parking_lot::Mutex::new(CircuitBreaker::new(threshold, recovery_timeout)),
            stale: parking_lot::Mutex::new(HashMap::new()),
            backend: None,
        }
    }

    /// Circuit status for observability: state, failure count, trips.
    pub fn circuit_status(&self) -> Json {
        let breaker = self.breaker.lock();
        json!({
            "state": breaker.state().as_str(),
            "failure_count": breaker.failure_count(),
            "trips": breaker.trips(),
        })
    }

    fn stale_value(&self, key: &str) -> Option<Json> {
        self.stale.lock().get(key).map(|entry| entry.value.clone())
    }

    fn remember(&self, key: &str, value: &Json) {
        self.stale.lock().insert(
            key.to_string(),
            StaleEntry {
                value: value.clone(),
                stored_at: Instant::now(),
            },
        );
    }

    pub async fn call<F, Fut>(&self, key: &CacheKey, origin: F) -> Result<Json>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Json>>,
    {
        // Short-circuit while the circuit is open.
        let allowed = self.breaker.lock().allow();
        if !allowed {
            let within_fallback = self
                .breaker
                .lock()
                .last_failure_elapsed()
                .is_some_and(|elapsed| elapsed <= self.fallback_ttl);
            if within_fallback {
                if let Some(stale) = self.stale_value(&key.key) {
                    warn!(key = %key.key, "circuit open; serving stale cached value");
                    return Ok(stale);
                }
            }
            return Err(CacheError::CircuitOpen(format!(
                "circuit open for '{}', no stale value available",
                key.key
            ))
            .into());
        }

        if let Some(value) = self.manager.get(key, self.backend.as_deref()).await {
            self.remember(&key.key, &value);
            return Ok(value);
        }

        match origin().await {
            Ok(value) => {
                self.breaker.lock().reset();
                self.manager
                    .set(key, value.clone(), self.ttl, self.backend.as_deref())
                    .await;
                self.remember(&key.key, &value);
                Ok(value)
            }
            Err(err) => {
                self.breaker.lock().record_failure();
                error!(key = %key.key, error = %err, "origin call failed under circuit cache");

                if let Some(stale) = self.stale_value(&key.key) {
                    // Re-store the stale value so the cache keeps serving
                    // it for the fallback window.
                    self.manager
                        .set(
                            key,
                            stale.clone(),
                            Some(self.fallback_ttl),
                            self.backend.as_deref(),
                        )
                        .await;
                    warn!(key = %key.key, "serving stale value after origin failure");
                    return Ok(stale);
                }

                Err(err)
            }
        }
    }
}

// ============================================================================
// Pattern-based invalidation manager
// ============================================================================

/// Maps trigger patterns to sets of invalidation patterns.
pub struct InvalidationManager {
    manager: Arc<CacheManager>,
    patterns: parking_lot::Mutex<HashMap<String, Vec<String>>>,
}

impl InvalidationManager {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self {
            manager,
            patterns: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Register the patterns to invalidate when a trigger fires.
    pub fn register_pattern(&self, trigger: impl Into<String>, invalidate: Vec<String>) {
        self.patterns.lock().insert(trigger.into(), invalidate);
    }

    /// Fire every registered trigger that prefixes `trigger`; returns
    /// the total number of invalidated keys.
    pub async fn trigger(&self, trigger: &str, backend: Option<&str>) -> usize {
        let targets: Vec<String> = {
            let patterns = self.patterns.lock();
            patterns
                .iter()
                .filter(|(registered, _)| trigger.starts_with(registered.as_str()))
                .flat_map(|(_, targets)| targets.iter().cloned())
                .collect()
        };

        let mut total = 0;
        for pattern in targets {
            let count = self.manager.invalidate_pattern(&pattern, backend).await;
            debug!(pattern = %pattern, count, "trigger invalidated entries");
            total += count;
        }
        if total > 0 {
            info!(trigger, total, "cache invalidation trigger fired");
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::manager::StrategyKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager() -> Arc<CacheManager> {
        let manager = CacheManager::new();
        manager.setup_memory_cache("memory", 1000, None, StrategyKind::Ttl);
        Arc::new(manager)
    }

    #[test]
    fn test_function_cache_key_shape() {
        let key = function_cache_key("partners.search", Some(&json!({"limit": 10})), None)
            .unwrap();
        let parts: Vec<&str> = key.key.split(':').collect();
        assert_eq!(parts[0], "partners.search");
        assert_eq!(parts[1].len(), 8);

        let bare = function_cache_key("partners.search", None, Some("v2")).unwrap();
        assert_eq!(bare.key, "v2:partners.search");
    }

    #[tokio::test]
    async fn test_cached_call_runs_origin_once() {
        let wrapper = CachedCall::new(manager()).with_ttl(Duration::from_secs(60));
        let key = CacheKey::new("calls:test").unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value = wrapper
                .get_or_compute(&key, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(42))
                })
                .await
                .unwrap();
            assert_eq!(value, json!(42));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let metrics = wrapper.metrics().snapshot();
        assert_eq!(metrics["hits"], 2);
        assert_eq!(metrics["misses"], 1);
        assert_eq!(metrics["total_requests"], 3);
    }

    #[tokio::test]
    async fn test_cached_call_records_errors() {
        let wrapper = CachedCall::new(manager());
        let key = CacheKey::new("calls:failing").unwrap();

        let result = wrapper
            .get_or_compute(&key, || async {
                Err(ClientError::Timeout("deadline".to_string()))
            })
            .await;
        assert!(result.is_err());

        let metrics = wrapper.metrics().snapshot();
        assert_eq!(metrics["errors"], 1);
        assert_eq!(metrics["error_types"]["timeout"], 1);
    }

    #[tokio::test]
    async fn test_sliding_cache_extends_ttl() {
        let manager = manager();
        let wrapper = SlidingCache::new(Arc::clone(&manager), Duration::from_millis(200), 2.0)
            .with_max_ttl(Duration::from_secs(60));
        let key = CacheKey::new("sliding:test").unwrap();

        wrapper
            .get_or_compute(&key, || async { Ok(json!(1)) })
            .await
            .unwrap();

        // Each hit slides the TTL to 400ms, so repeated access past the
        // base TTL keeps the entry alive.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let value = wrapper
                .get_or_compute(&key, || async { Ok(json!(2)) })
                .await
                .unwrap();
            assert_eq!(value, json!(1), "entry should still be cached");
        }
    }

    #[tokio::test]
    async fn test_circuit_cache_serves_stale_and_recovers() {
        let manager = manager();
        let wrapper = CircuitCache::new(
            Arc::clone(&manager),
            Some(Duration::from_millis(30)),
            3,
            Duration::from_millis(500),
            Duration::from_secs(30),
        );
        let key = CacheKey::new("circuit:test").unwrap();
        let origin_calls = Arc::new(AtomicU32::new(0));

        // Prime the cache.
        let calls = Arc::clone(&origin_calls);
        let value = wrapper
            .call(&key, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(42))
            })
            .await
            .unwrap();
        assert_eq!(value, json!(42));

        // Wait for the TTL to lapse, then fail three times; each failure
        // still serves the stale 42.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..3 {
            manager
                .delete(&key, None)
                .await;
            let value = wrapper
                .call(&key, || async {
                    Err(ClientError::Connection("origin down".to_string()))
                })
                .await
                .unwrap();
            assert_eq!(value, json!(42));
        }
        assert_eq!(wrapper.circuit_status()["state"], "open");

        // While open, calls short-circuit to the stale value without
        // touching the origin.
        manager.delete(&key, None).await;
        let calls = Arc::clone(&origin_calls);
        let value = wrapper
            .call(&key, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(99))
            })
            .await
            .unwrap();
        assert_eq!(value, json!(42));
        assert_eq!(origin_calls.load(Ordering::SeqCst), 1);

        // After the recovery timeout a probe re-enters the origin.
        tokio::time::sleep(Duration::from_millis(600)).await;
        manager.delete(&key, None).await;
        let calls = Arc::clone(&origin_calls);
        let value = wrapper
            .call(&key, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(7))
            })
            .await
            .unwrap();
        assert_eq!(value, json!(7));
        assert_eq!(wrapper.circuit_status()["state"], "closed");
    }

    #[tokio::test]
    async fn test_circuit_open_without_stale_fails() {
        let wrapper = CircuitCache::new(
            manager(),
            None,
            1,
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        let key = CacheKey::new("circuit:empty").unwrap();

        let first = wrapper
            .call(&key, || async {
                Err(ClientError::Connection("down".to_string()))
            })
            .await;
        assert!(first.is_err());

        let second = wrapper
            .call(&key, || async { Ok(json!(1)) })
            .await;
        assert!(matches!(
            second,
            Err(ClientError::Cache(CacheError::CircuitOpen(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalidation_manager_trigger() {
        let manager = manager();
        for key in ["profile:1", "profile:2", "settings:1", "other:1"] {
            manager
                .set(&CacheKey::new(key).unwrap(), json!(1), None, None)
                .await;
        }

        let invalidation = InvalidationManager::new(Arc::clone(&manager));
        invalidation.register_pattern(
            "user:123",
            vec!["profile:*".to_string(), "settings:*".to_string()],
        );

        let total = invalidation.trigger("user:123:updated", None).await;
        assert_eq!(total, 3);
        assert_eq!(
            manager.get(&CacheKey::new("other:1").unwrap(), None).await,
            Some(json!(1))
        );
    }
}
