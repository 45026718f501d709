// # Caching subsystem
//
// Multi-backend caching for RPC results with eviction strategies,
// stampede prevention, circuit breaking, and pattern invalidation.
//
// - **Backends**: in-memory (ordered-map eviction, expiry sweep) and
//   Redis (circuit breaker, retry with jittered backoff, fallback).
// - **Strategies**: TTL, LRU, and LFU disciplines layered on a backend.
// - **Manager**: the facade callers use; named backend/strategy pairs,
//   glob invalidation, query-result convenience wrappers, and a
//   process-level enable gate. Cache failures degrade, they never fail
//   a user operation.
// - **Call wrappers**: read-through caching with stampede protection,
//   sliding expiration, per-function circuit breaking, and metrics.

pub mod backends;
pub mod decorators;
pub mod keys;
pub mod manager;
pub mod stampede;
pub mod strategies;

pub use backends::{
    CacheBackend, CircuitBreaker, CircuitState, MemoryCache, RedisCache, RedisCacheConfig,
    Serializer,
};
pub use decorators::{
    function_cache_key, CachedCall, CallMetrics, CircuitCache, InvalidationManager, SlidingCache,
};
pub use keys::{
    hash_params, make_cache_key, make_query_cache_key, make_record_cache_key, parse_cache_key,
    validate_cache_key, CacheKey, ParsedCacheKey,
};
pub use manager::{CacheManager, StrategyKind};
pub use stampede::StampedeGuard;
pub use strategies::{CacheStrategy, LfuStrategy, LruStrategy, TtlStrategy};
