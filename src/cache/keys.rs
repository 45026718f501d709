// Cache key construction and validation.
//
// Keys are structured `{namespace, key, model?, operation?, params?}` with
// canonical string form `{namespace}:{key}`. The raw key segment set is
// colon-separated so keys can be parsed back into components.

use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::common::{DEFAULT_CACHE_NAMESPACE, MAX_CACHE_KEY_LENGTH};
use crate::error::CacheError;
use crate::Domain;

/// A cache key with its construction metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub key: String,
    pub namespace: String,
    pub model: Option<String>,
    pub operation: Option<String>,
}

impl CacheKey {
    /// Build a key from a raw string, validating it.
    pub fn new(key: impl Into<String>) -> Result<Self, CacheError> {
        let key = key.into();
        validate_cache_key(&key)?;
        Ok(Self {
            key,
            namespace: DEFAULT_CACHE_NAMESPACE.to_string(),
            model: None,
            operation: None,
        })
    }

    /// The fully namespaced form, `{namespace}:{key}`.
    pub fn full_key(&self) -> String {
        format!("{}:{}", self.namespace, self.key)
    }

    /// Derive a key with an extra trailing segment.
    pub fn with_suffix(&self, suffix: &str) -> Result<Self, CacheError> {
        let mut derived = self.clone();
        derived.key = format!("{}:{}", self.key, suffix);
        validate_cache_key(&derived.key)?;
        Ok(derived)
    }

    /// Derive a key with an extra leading segment.
    pub fn with_prefix(&self, prefix: &str) -> Result<Self, CacheError> {
        let mut derived = self.clone();
        derived.key = format!("{}:{}", prefix, self.key);
        validate_cache_key(&derived.key)?;
        Ok(derived)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Components recovered from a structured key string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedCacheKey {
    pub model: Option<String>,
    pub operation: Option<String>,
    pub hash: Option<String>,
    pub extra: Option<String>,
    pub raw_key: String,
}

/// Validate a raw key string.
///
/// Rejects empty keys, keys longer than 250 bytes, and keys containing
/// whitespace, newline, tab, or carriage return.
pub fn validate_cache_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::Key("cache key cannot be empty".to_string()));
    }
    if key.len() > MAX_CACHE_KEY_LENGTH {
        return Err(CacheError::Key(format!(
            "cache key too long: {} > {}",
            key.len(),
            MAX_CACHE_KEY_LENGTH
        )));
    }
    if key.contains([' ', '\n', '\r', '\t']) {
        return Err(CacheError::Key(
            "cache key contains whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}

/// Build a standard `{model}:{operation}[:{hash8}]` key.
pub fn make_cache_key(
    model: &str,
    operation: &str,
    params: Option<&Json>,
) -> Result<CacheKey, CacheError> {
    if model.is_empty() {
        return Err(CacheError::Key("model name is required".to_string()));
    }
    if operation.is_empty() {
        return Err(CacheError::Key("operation is required".to_string()));
    }

    let mut key = format!("{}:{}", model, operation);
    if let Some(params) = params {
        key.push(':');
        key.push_str(&hash_params(params));
    }
    validate_cache_key(&key)?;

    Ok(CacheKey {
        key,
        namespace: DEFAULT_CACHE_NAMESPACE.to_string(),
        model: Some(model.to_string()),
        operation: Some(operation.to_string()),
    })
}

/// Build a `{model}:record:{ids}[:{fields}]` key for record reads.
pub fn make_record_cache_key(
    model: &str,
    ids: &[i64],
    fields: Option<&[String]>,
) -> Result<CacheKey, CacheError> {
    let mut sorted = ids.to_vec();
    sorted.sort_unstable();
    let id_str = sorted
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let mut key = format!("{}:record:{}", model, id_str);
    if let Some(fields) = fields {
        let mut sorted_fields = fields.to_vec();
        sorted_fields.sort();
        key.push(':');
        key.push_str(&sorted_fields.join(","));
    }
    validate_cache_key(&key)?;

    Ok(CacheKey {
        key,
        namespace: DEFAULT_CACHE_NAMESPACE.to_string(),
        model: Some(model.to_string()),
        operation: Some("read".to_string()),
    })
}

/// Build a `{model}:search_read:{hash8}` key for a search query.
pub fn make_query_cache_key(
    model: &str,
    domain: &Domain,
    fields: Option<&[String]>,
) -> Result<CacheKey, CacheError> {
    let mut params = serde_json::Map::new();
    params.insert("domain".to_string(), domain.to_wire());
    if let Some(fields) = fields {
        params.insert("fields".to_string(), serde_json::json!(fields));
    }
    make_cache_key(model, "search_read", Some(&Json::Object(params)))
}

/// Hash parameters into the 8-hex-char form used as the trailing key
/// segment. Object keys are sorted first so equal parameter sets hash
/// identically regardless of insertion order.
pub fn hash_params(params: &Json) -> String {
    let canonical = canonicalize(params);
    let serialized = canonical.to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Recursively sort object keys for stable serialization.
fn canonicalize(value: &Json) -> Json {
    match value {
        Json::Object(map) => {
            let sorted: BTreeMap<String, Json> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or(Json::Null)
        }
        Json::Array(items) => Json::Array(items.iter().map(canonicalize).collect()),
        _ => value.clone(),
    }
}

/// Parse a key string back into its components.
///
/// Split on `:`: first segment is the model, second the operation, third
/// the params hash, anything left is free-form.
pub fn parse_cache_key(key: &str) -> ParsedCacheKey {
    let parts: Vec<&str> = key.split(':').collect();

    if parts.len() < 2 {
        return ParsedCacheKey {
            raw_key: key.to_string(),
            ..Default::default()
        };
    }

    ParsedCacheKey {
        model: Some(parts[0].to_string()),
        operation: Some(parts[1].to_string()),
        hash: parts.get(2).map(|s| s.to_string()),
        extra: if parts.len() > 3 {
            Some(parts[3..].join(":"))
        } else {
            None
        },
        raw_key: key.to_string(),
    }
}
