// Cache backend implementations.
//
// A backend is a primitive key/value store with TTL semantics and
// statistics. Two implementations are provided: an in-memory store with
// access-ordered eviction and a background expiry sweep, and a Redis
// store with a circuit breaker, retry with jittered backoff, and an
// optional in-memory fallback.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::{json, Value as Json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CacheBackendError;

type BackendResult<T> = Result<T, CacheBackendError>;

/// Primitive key/value store interface.
///
/// All operations may fail with `CacheBackendError`; callers above the
/// manager never see those failures on the hot path.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> BackendResult<Option<Json>>;

    /// Store a value. A `ttl` of zero is treated as "no expiry",
    /// identical to passing `None`.
    async fn set(&self, key: &str, value: Json, ttl: Option<Duration>) -> BackendResult<bool>;

    /// Returns true iff the key existed.
    async fn delete(&self, key: &str) -> BackendResult<bool>;

    async fn exists(&self, key: &str) -> BackendResult<bool>;

    async fn clear(&self) -> BackendResult<bool>;

    /// Remove every key matching a glob pattern; returns the count.
    async fn invalidate_pattern(&self, pattern: &str) -> BackendResult<usize>;

    async fn stats(&self) -> BackendResult<Json>;

    /// Stop background work. Must be called on shutdown.
    async fn close(&self);
}

/// Translate a glob pattern (`*`, `?`) into an anchored regex.
pub(crate) fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    regex::Regex::new(&out).ok()
}

// ============================================================================
// In-memory backend
// ============================================================================

struct MemoryStore {
    data: HashMap<String, Json>,
    /// Access order; the head is the next eviction victim.
    order: VecDeque<String>,
    expiry: HashMap<String, Instant>,
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
}

impl MemoryStore {
    fn new() -> Self {
        Self {
            data: HashMap::new(),
            order: VecDeque::new(),
            expiry: HashMap::new(),
            hits: 0,
            misses: 0,
            sets: 0,
            deletes: 0,
        }
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) -> bool {
        let existed = self.data.remove(key).is_some();
        if existed {
            self.order.retain(|k| k != key);
        }
        self.expiry.remove(key);
        existed
    }

    fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .expiry
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

/// In-memory cache backend with TTL and access-ordered eviction.
pub struct MemoryCache {
    max_size: usize,
    default_ttl: Option<Duration>,
    store: Arc<tokio::sync::Mutex<MemoryStore>>,
    cleanup_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MemoryCache {
    /// Create a backend and start its periodic expiry sweep.
    ///
    /// Must be called from within a tokio runtime. `close()` cancels the
    /// sweep task; dropping the backend aborts it as well.
    pub fn new(
        max_size: usize,
        default_ttl: Option<Duration>,
        cleanup_interval: Duration,
    ) -> Self {
        let store = Arc::new(tokio::sync::Mutex::new(MemoryStore::new()));

        let sweep_store = Arc::downgrade(&store);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = sweep_store.upgrade() else {
                    break;
                };
                let removed = store.lock().await.sweep_expired(Instant::now());
                if removed > 0 {
                    debug!(removed, "memory cache sweep removed expired entries");
                }
            }
        });

        Self {
            max_size,
            default_ttl,
            store,
            cleanup_task: parking_lot::Mutex::new(Some(handle)),
        }
    }

    fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        // TTL of zero means "no expiry".
        ttl.or(self.default_ttl).filter(|d| !d.is_zero())
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> BackendResult<Option<Json>> {
        let mut store = self.store.lock().await;

        if let Some(deadline) = store.expiry.get(key).copied() {
            if deadline <= Instant::now() {
                store.remove(key);
                store.misses += 1;
                return Ok(None);
            }
        }

        match store.data.get(key).cloned() {
            Some(value) => {
                store.touch(key);
                store.hits += 1;
                Ok(Some(value))
            }
            None => {
                store.misses += 1;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Json, ttl: Option<Duration>) -> BackendResult<bool> {
        let mut store = self.store.lock().await;

        // Evict from the head until there is room.
        while store.data.len() >= self.max_size && !store.data.contains_key(key) {
            let Some(victim) = store.order.pop_front() else {
                break;
            };
            store.data.remove(&victim);
            store.expiry.remove(&victim);
        }

        store.data.insert(key.to_string(), value);
        store.touch(key);

        match self.effective_ttl(ttl) {
            Some(ttl) => {
                store.expiry.insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                store.expiry.remove(key);
            }
        }

        store.sets += 1;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        let mut store = self.store.lock().await;
        let existed = store.remove(key);
        if existed {
            store.deletes += 1;
        }
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn clear(&self) -> BackendResult<bool> {
        let mut store = self.store.lock().await;
        store.data.clear();
        store.order.clear();
        store.expiry.clear();
        Ok(true)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> BackendResult<usize> {
        let regex = glob_to_regex(pattern).ok_or_else(|| {
            CacheBackendError::Other(format!("invalid pattern: {}", pattern))
        })?;

        let mut store = self.store.lock().await;
        let matching: Vec<String> = store
            .data
            .keys()
            .filter(|k| regex.is_match(k))
            .cloned()
            .collect();
        for key in &matching {
            store.remove(key);
            store.deletes += 1;
        }
        Ok(matching.len())
    }

    async fn stats(&self) -> BackendResult<Json> {
        let store = self.store.lock().await;
        let total = store.hits + store.misses;
        let hit_rate = if total > 0 {
            store.hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Ok(json!({
            "backend": "memory",
            "size": store.data.len(),
            "max_size": self.max_size,
            "hits": store.hits,
            "misses": store.misses,
            "hit_rate": (hit_rate * 100.0).round() / 100.0,
            "sets": store.sets,
            "deletes": store.deletes,
            "tracked_expiries": store.expiry.len(),
        }))
    }

    async fn close(&self) {
        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
        }
    }
}

// ============================================================================
// Circuit breaker (shared by the Redis backend and the circuit-caching
// call wrapper)
// ============================================================================

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Failure-counting circuit breaker.
///
/// Closed: operations proceed, each failure bumps the counter; at the
/// threshold the circuit opens. Open: operations short-circuit until the
/// timeout elapses, then one probe is let through in half-open. A probe
/// success closes the circuit, a probe failure reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    threshold: u32,
    timeout: Duration,
    trips: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            threshold,
            timeout,
            trips: 0,
        }
    }

    /// Whether an operation may proceed; transitions open -> half-open
    /// once the timeout has elapsed.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if let Some(at) = self.last_failure {
                    if at.elapsed() >= self.timeout {
                        self.state = CircuitState::HalfOpen;
                        info!("circuit breaker moved to half-open");
                        return true;
                    }
                }
                false
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        if self.state != CircuitState::Open && self.failure_count >= self.threshold {
            self.state = CircuitState::Open;
            self.trips += 1;
            warn!(failures = self.failure_count, "circuit breaker opened");
        }
    }

    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Time since the most recent recorded failure.
    pub fn last_failure_elapsed(&self) -> Option<Duration> {
        self.last_failure.map(|at| at.elapsed())
    }

    pub fn trips(&self) -> u64 {
        self.trips
    }
}

// ============================================================================
// Redis backend
// ============================================================================

/// Cache value serializer.
///
/// `Json` round-trips every JSON-compatible value and is the default.
/// `MessagePack` is a compact binary encoding; selecting it is an
/// explicit opt-in, and it should not be pointed at cache data written
/// by untrusted parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serializer {
    Json,
    MessagePack,
}

/// Configuration for the Redis backend.
#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    pub url: String,
    pub namespace: String,
    pub serializer: Serializer,
    pub max_connections: usize,
    pub retry_attempts: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub socket_timeout: Duration,
    pub enable_fallback: bool,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            namespace: crate::common::DEFAULT_CACHE_NAMESPACE.to_string(),
            serializer: Serializer::Json,
            max_connections: 20,
            retry_attempts: 3,
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(60),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            socket_timeout: Duration::from_secs(5),
            enable_fallback: true,
        }
    }
}

#[derive(Default)]
struct RedisStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    total_operations: AtomicU64,
    connection_errors: AtomicU64,
    fallback_hits: AtomicU64,
}

/// Redis cache backend with resilience patterns.
///
/// Initialization is strictly sequential: open the client, ping with a
/// bounded timeout, then mark the backend connected.
pub struct RedisCache {
    config: RedisCacheConfig,
    conn: tokio::sync::Mutex<Option<redis::aio::ConnectionManager>>,
    connected: AtomicBool,
    circuit: parking_lot::Mutex<CircuitBreaker>,
    stats: RedisStats,
    fallback: Option<MemoryCache>,
}

impl RedisCache {
    pub fn new(config: RedisCacheConfig) -> Self {
        if config.serializer == Serializer::MessagePack {
            warn!("redis cache using binary serializer; do not share this keyspace with untrusted writers");
        }
        let fallback = if config.enable_fallback {
            Some(MemoryCache::new(
                1000,
                Some(Duration::from_secs(300)),
                Duration::from_secs(60),
            ))
        } else {
            None
        };
        let circuit = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_timeout,
        );
        Self {
            config,
            conn: tokio::sync::Mutex::new(None),
            connected: AtomicBool::new(false),
            circuit: parking_lot::Mutex::new(circuit),
            stats: RedisStats::default(),
            fallback,
        }
    }

    /// Establish the connection pool and validate it with a ping.
    pub async fn connect(&self) -> BackendResult<()> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let client = redis::Client::open(self.config.url.as_str())
            .map_err(|e| CacheBackendError::Connection(e.to_string()))?;

        let mut manager = tokio::time::timeout(
            self.config.socket_timeout,
            client.get_connection_manager(),
        )
        .await
        .map_err(|_| CacheBackendError::Timeout("redis connect timeout".to_string()))?
        .map_err(|e| CacheBackendError::Connection(e.to_string()))?;

        tokio::time::timeout(
            self.config.socket_timeout,
            redis::cmd("PING").query_async::<_, String>(&mut manager),
        )
        .await
        .map_err(|_| CacheBackendError::Timeout("redis ping timeout".to_string()))?
        .map_err(|e| CacheBackendError::Connection(e.to_string()))?;

        *guard = Some(manager);
        self.connected.store(true, Ordering::Release);
        self.circuit.lock().reset();
        info!(url = %self.config.url, "redis cache connected");
        Ok(())
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.config.namespace, key)
    }

    fn encode(&self, value: &Json) -> BackendResult<Vec<u8>> {
        match self.config.serializer {
            Serializer::Json => serde_json::to_vec(value)
                .map_err(|e| CacheBackendError::Serialization(e.to_string())),
            Serializer::MessagePack => rmp_serde::to_vec(value)
                .map_err(|e| CacheBackendError::Serialization(e.to_string())),
        }
    }

    fn decode(&self, data: &[u8]) -> BackendResult<Json> {
        match self.config.serializer {
            Serializer::Json => serde_json::from_slice(data)
                .map_err(|e| CacheBackendError::Serialization(e.to_string())),
            Serializer::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| CacheBackendError::Serialization(e.to_string())),
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff_base.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = base.min(self.config.retry_backoff_max.as_secs_f64());
        // +-10% jitter keeps retries from synchronizing.
        let jitter = capped * 0.1 * (fastrand::f64() * 2.0 - 1.0);
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }

    async fn connection(&self) -> BackendResult<redis::aio::ConnectionManager> {
        self.connect().await?;
        let guard = self.conn.lock().await;
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| CacheBackendError::Connection("redis not connected".to_string()))
    }

    async fn try_cmd(&self, cmd: &redis::Cmd) -> BackendResult<redis::Value> {
        let mut conn = self.connection().await?;
        tokio::time::timeout(
            self.config.socket_timeout,
            cmd.query_async::<_, redis::Value>(&mut conn),
        )
        .await
        .map_err(|_| CacheBackendError::Timeout("redis command timeout".to_string()))?
        .map_err(|e| CacheBackendError::Connection(e.to_string()))
    }

    /// Run a command under the circuit breaker with retry and jittered
    /// exponential backoff.
    async fn run_cmd(&self, cmd: &redis::Cmd) -> BackendResult<redis::Value> {
        if !self.circuit.lock().allow() {
            return Err(CacheBackendError::Connection(
                "redis circuit breaker open".to_string(),
            ));
        }

        let attempts = self.config.retry_attempts.max(1);
        let mut last_err = CacheBackendError::Other("no attempts made".to_string());

        for attempt in 0..attempts {
            match self.try_cmd(cmd).await {
                Ok(value) => {
                    self.circuit.lock().record_success();
                    return Ok(value);
                }
                Err(err) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                    self.circuit.lock().record_failure();
                    last_err = err;
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    async fn fallback_get(&self, key: &str) -> BackendResult<Option<Json>> {
        let Some(fallback) = &self.fallback else {
            return Ok(None);
        };
        let value = fallback.get(key).await?;
        if value.is_some() {
            self.stats.fallback_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "redis fallback cache hit");
        }
        Ok(value)
    }

    async fn fallback_set(
        &self,
        key: &str,
        value: Json,
        ttl: Option<Duration>,
    ) -> BackendResult<bool> {
        match &self.fallback {
            Some(fallback) => fallback.set(key, value, ttl).await,
            None => Ok(false),
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> BackendResult<Option<Json>> {
        self.stats.total_operations.fetch_add(1, Ordering::Relaxed);
        let full = self.namespaced(key);

        match self.run_cmd(redis::cmd("GET").arg(&full)).await {
            Ok(redis::Value::Nil) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Ok(value) => {
                let data: Vec<u8> = redis::from_redis_value(&value)
                    .map_err(|e| CacheBackendError::Serialization(e.to_string()))?;
                let decoded = self.decode(&data)?;
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(decoded))
            }
            Err(err) => {
                if self.fallback.is_some() {
                    warn!(key, error = %err, "redis get failed; serving fallback");
                    self.fallback_get(key).await
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn set(&self, key: &str, value: Json, ttl: Option<Duration>) -> BackendResult<bool> {
        self.stats.total_operations.fetch_add(1, Ordering::Relaxed);
        let full = self.namespaced(key);
        let data = self.encode(&value)?;

        // TTL of zero is "no expiry", matching the memory backend.
        let ttl = ttl.filter(|d| !d.is_zero());
        let cmd = match ttl {
            Some(ttl) => {
                let mut c = redis::cmd("SETEX");
                c.arg(&full).arg(ttl.as_secs().max(1)).arg(&data);
                c
            }
            None => {
                let mut c = redis::cmd("SET");
                c.arg(&full).arg(&data);
                c
            }
        };

        match self.run_cmd(&cmd).await {
            Ok(_) => {
                self.stats.sets.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(err) => {
                if self.fallback.is_some() {
                    warn!(key, error = %err, "redis set failed; writing fallback");
                    self.fallback_set(key, value, ttl).await
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        self.stats.total_operations.fetch_add(1, Ordering::Relaxed);
        let full = self.namespaced(key);
        let value = self.run_cmd(redis::cmd("DEL").arg(&full)).await?;
        let removed: i64 = redis::from_redis_value(&value)
            .map_err(|e| CacheBackendError::Serialization(e.to_string()))?;
        if removed > 0 {
            self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        }
        // Also drop any stale fallback copy.
        if let Some(fallback) = &self.fallback {
            let _ = fallback.delete(key).await;
        }
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        self.stats.total_operations.fetch_add(1, Ordering::Relaxed);
        let full = self.namespaced(key);
        let value = self.run_cmd(redis::cmd("EXISTS").arg(&full)).await?;
        let count: i64 = redis::from_redis_value(&value)
            .map_err(|e| CacheBackendError::Serialization(e.to_string()))?;
        Ok(count > 0)
    }

    async fn clear(&self) -> BackendResult<bool> {
        let removed = self.invalidate_pattern("*").await?;
        debug!(removed, "redis cache cleared");
        Ok(true)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> BackendResult<usize> {
        let full_pattern = self.namespaced(pattern);
        let mut conn = self.connection().await?;

        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(&full_pattern)
                .await
                .map_err(|e| CacheBackendError::Connection(e.to_string()))?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        if keys.is_empty() {
            return Ok(0);
        }

        let removed: i64 = conn
            .del(&keys)
            .await
            .map_err(|e| CacheBackendError::Connection(e.to_string()))?;
        self.stats
            .deletes
            .fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed as usize)
    }

    async fn stats(&self) -> BackendResult<Json> {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let (circuit_state, failure_count, trips) = {
            let circuit = self.circuit.lock();
            (circuit.state(), circuit.failure_count(), circuit.trips())
        };

        let mut stats = json!({
            "backend": "redis",
            "connected": self.connected.load(Ordering::Acquire),
            "namespace": self.config.namespace,
            "hits": hits,
            "misses": misses,
            "hit_rate": (hit_rate * 100.0).round() / 100.0,
            "sets": self.stats.sets.load(Ordering::Relaxed),
            "deletes": self.stats.deletes.load(Ordering::Relaxed),
            "errors": self.stats.errors.load(Ordering::Relaxed),
            "total_operations": self.stats.total_operations.load(Ordering::Relaxed),
            "connection_errors": self.stats.connection_errors.load(Ordering::Relaxed),
            "circuit_breaker_trips": trips,
            "circuit_state": circuit_state.as_str(),
            "failure_count": failure_count,
            "fallback_hits": self.stats.fallback_hits.load(Ordering::Relaxed),
            "fallback_enabled": self.config.enable_fallback,
            "retry_attempts": self.config.retry_attempts,
            "max_connections": self.config.max_connections,
        });

        // Best-effort server info; never fails the stats call.
        if self.connected.load(Ordering::Acquire) {
            if let Ok(value) = self.try_cmd(redis::cmd("INFO").arg("server")).await {
                if let Ok(info) = redis::from_redis_value::<String>(&value) {
                    for line in info.lines() {
                        if let Some(version) = line.strip_prefix("redis_version:") {
                            stats["redis_version"] = json!(version.trim());
                        }
                    }
                }
            }
        }

        Ok(stats)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        *self.conn.lock().await = None;
        if let Some(fallback) = &self.fallback {
            fallback.close().await;
        }
        info!("redis cache connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("res.partner:*").unwrap();
        assert!(re.is_match("res.partner:5"));
        assert!(re.is_match("res.partner:record:1,2"));
        assert!(!re.is_match("res.users:5"));
        // The dot in the model name is literal.
        assert!(!re.is_match("resXpartner:5"));
    }

    #[tokio::test]
    async fn test_memory_basic_operations() {
        let cache = MemoryCache::new(100, None, Duration::from_secs(60));

        assert!(cache.set("k1", json!({"a": 1}), None).await.unwrap());
        assert_eq!(cache.get("k1").await.unwrap(), Some(json!({"a": 1})));
        assert!(cache.exists("k1").await.unwrap());

        assert!(cache.delete("k1").await.unwrap());
        assert!(!cache.delete("k1").await.unwrap());
        assert_eq!(cache.get("k1").await.unwrap(), None);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_memory_ttl_expiry() {
        let cache = MemoryCache::new(100, None, Duration::from_secs(3600));

        cache
            .set("short", json!(1), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(cache.get("short").await.unwrap(), Some(json!(1)));

        tokio::time::sleep(Duration::from_millis(40)).await;
        // Expired entries are removed lazily on access and reported as
        // misses even before the sweep runs.
        assert_eq!(cache.get("short").await.unwrap(), None);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_memory_ttl_zero_means_no_expiry() {
        let cache = MemoryCache::new(100, None, Duration::from_secs(3600));
        cache
            .set("forever", json!(1), Some(Duration::ZERO))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("forever").await.unwrap(), Some(json!(1)));
        cache.close().await;
    }

    #[tokio::test]
    async fn test_memory_lru_eviction_order() {
        let cache = MemoryCache::new(3, None, Duration::from_secs(3600));

        for i in 0..5 {
            cache.set(&format!("k{}", i), json!(i), None).await.unwrap();
        }

        // First two inserted keys were evicted, the rest survive.
        assert_eq!(cache.get("k0").await.unwrap(), None);
        assert_eq!(cache.get("k1").await.unwrap(), None);
        assert_eq!(cache.get("k2").await.unwrap(), Some(json!(2)));
        assert_eq!(cache.get("k3").await.unwrap(), Some(json!(3)));
        assert_eq!(cache.get("k4").await.unwrap(), Some(json!(4)));
        cache.close().await;
    }

    #[tokio::test]
    async fn test_memory_get_touches_lru_order() {
        let cache = MemoryCache::new(2, None, Duration::from_secs(3600));

        cache.set("a", json!(1), None).await.unwrap();
        cache.set("b", json!(2), None).await.unwrap();
        // Touch "a" so "b" becomes the eviction victim.
        cache.get("a").await.unwrap();
        cache.set("c", json!(3), None).await.unwrap();

        assert_eq!(cache.get("a").await.unwrap(), Some(json!(1)));
        assert_eq!(cache.get("b").await.unwrap(), None);
        cache.close().await;
    }

    #[tokio::test]
    async fn test_memory_pattern_invalidation() {
        let cache = MemoryCache::new(100, None, Duration::from_secs(3600));

        cache.set("res.partner:1", json!(1), None).await.unwrap();
        cache.set("res.partner:2", json!(2), None).await.unwrap();
        cache.set("res.users:1", json!(3), None).await.unwrap();

        let removed = cache.invalidate_pattern("res.partner:*").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.get("res.users:1").await.unwrap(), Some(json!(3)));
        cache.close().await;
    }

    #[tokio::test]
    async fn test_memory_stats() {
        let cache = MemoryCache::new(100, None, Duration::from_secs(3600));
        cache.set("k", json!(1), None).await.unwrap();
        cache.get("k").await.unwrap();
        cache.get("absent").await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats["backend"], "memory");
        assert_eq!(stats["hits"], 1);
        assert_eq!(stats["misses"], 1);
        assert_eq!(stats["sets"], 1);
        cache.close().await;
    }

    #[test]
    fn test_circuit_breaker_transitions() {
        let mut cb = CircuitBreaker::new(3, Duration::from_millis(10));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow());

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());

        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Probe success closes the circuit.
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.trips(), 1);
    }

    #[test]
    fn test_circuit_breaker_probe_failure_reopens() {
        let mut cb = CircuitBreaker::new(1, Duration::from_millis(10));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_serializer_round_trip() {
        let cache = RedisCache::new(RedisCacheConfig::default());
        let value = json!({"name": "ACME", "ids": [1, 2, 3], "active": true});
        let encoded = cache.encode(&value).unwrap();
        assert_eq!(cache.decode(&encoded).unwrap(), value);

        let binary = RedisCache::new(RedisCacheConfig {
            serializer: Serializer::MessagePack,
            enable_fallback: false,
            ..Default::default()
        });
        let encoded = binary.encode(&value).unwrap();
        assert_eq!(binary.decode(&encoded).unwrap(), value);
    }
}
