// Shared primitive types used across all subsystems.

pub mod domain;
pub mod value;

pub use domain::{Domain, DomainLeaf, DomainNode, DomainOperator};
pub use value::FieldValue;

/// Server-assigned record identifier.
pub type RecordId = i64;

/// Default TTL in seconds applied by the cache manager (5 minutes).
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Maximum canonical cache key length in bytes.
pub const MAX_CACHE_KEY_LENGTH: usize = 250;

/// Default namespace for cache keys.
pub const DEFAULT_CACHE_NAMESPACE: &str = "rustyerp";
