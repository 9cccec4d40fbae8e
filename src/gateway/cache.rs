use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use super::endpoint::Endpoint;
use super::hooks::HookPhase;
use super::hooks::span::HookSpan;
use super::request::RequestContext;
use super::{GatewayError, STATUS_HOOKS_FAILED, custom_status, hex_lower, now_epoch_seconds, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Simple,
    Semantic,
}

impl CacheMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheMode::Simple => "simple",
            CacheMode::Semantic => "semantic",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "simple" | "true" => Some(CacheMode::Simple),
            "semantic" => Some(CacheMode::Semantic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub mode: Option<CacheMode>,
    #[serde(default, alias = "maxAge")]
    pub max_age: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheStatus {
    Disabled,
    Miss,
    Hit,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Disabled => "DISABLED",
            CacheStatus::Miss => "MISS",
            CacheStatus::Hit => "HIT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Installs the in-memory backend when no other backend is supplied.
    #[serde(default)]
    pub enabled: bool,
    /// Applied to requests that don't choose a mode themselves.
    #[serde(default)]
    pub mode: Option<CacheMode>,
    #[serde(default)]
    pub max_age: Option<u64>,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_max_total_body_bytes")]
    pub max_total_body_bytes: usize,
}

fn default_ttl_seconds() -> u64 {
    300
}

fn default_max_entries() -> usize {
    1024
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_max_total_body_bytes() -> usize {
    64 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: None,
            max_age: None,
            ttl_seconds: default_ttl_seconds(),
            max_entries: default_max_entries(),
            max_body_bytes: default_max_body_bytes(),
            max_total_body_bytes: default_max_total_body_bytes(),
        }
    }
}

/// Everything a backend may key a lookup on.
#[derive(Debug, Clone, Copy)]
pub struct CacheLookup<'a> {
    pub env: &'a BTreeMap<String, String>,
    pub headers: &'a HeaderMap,
    pub body: &'a Value,
    pub endpoint: Endpoint,
    pub identifier: &'a str,
    pub mode: CacheMode,
    pub max_age: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheReadOutcome {
    pub body: Option<String>,
    pub status: CacheStatus,
    pub key: Option<String>,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get_from_cache(&self, lookup: CacheLookup<'_>) -> Result<CacheReadOutcome, GatewayError>;

    async fn put_in_cache(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheResponseObject {
    pub cache_response: Option<CachedResponse>,
    pub cache_status: CacheStatus,
    pub cache_key: Option<String>,
    pub created_at: u64,
}

impl CacheResponseObject {
    pub fn disabled() -> Self {
        Self {
            cache_response: None,
            cache_status: CacheStatus::Disabled,
            cache_key: None,
            created_at: now_millis(),
        }
    }

    pub fn is_hit(&self) -> bool {
        self.cache_status == CacheStatus::Hit && self.cache_response.is_some()
    }
}

pub fn is_endpoint_cacheable(endpoint: Endpoint) -> bool {
    !endpoint.is_stateful()
}

#[derive(Clone, Default)]
pub struct CacheService {
    backend: Option<Arc<dyn CacheBackend>>,
    env: Arc<BTreeMap<String, String>>,
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

impl CacheService {
    pub fn new(backend: Option<Arc<dyn CacheBackend>>, env: BTreeMap<String, String>) -> Self {
        Self {
            backend,
            env: Arc::new(env),
        }
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub fn is_endpoint_cacheable(&self, endpoint: Endpoint) -> bool {
        is_endpoint_cacheable(endpoint)
    }

    /// Reads the cache for `context`. On a hit the before-phase hook results
    /// are spliced into the body so it reads like a live response.
    pub async fn get_cached_response(
        &self,
        context: &RequestContext,
        headers: &HeaderMap,
        body: &Value,
        span: &HookSpan,
    ) -> CacheResponseObject {
        let Some(backend) = self.backend.as_ref() else {
            return CacheResponseObject::disabled();
        };
        let Some(mode) = context.cache().mode else {
            return CacheResponseObject::disabled();
        };
        if !is_endpoint_cacheable(context.endpoint()) {
            return CacheResponseObject::disabled();
        }

        let lookup = CacheLookup {
            env: &self.env,
            headers,
            body,
            endpoint: context.endpoint(),
            identifier: context.provider(),
            mode,
            max_age: context.cache().max_age,
        };
        let outcome = match backend.get_from_cache(lookup).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(error = %err, "cache read failed; continuing without cache");
                return CacheResponseObject::disabled();
            }
        };

        let created_at = now_millis();
        let (status, raw) = match (outcome.status, outcome.body) {
            (CacheStatus::Hit, Some(raw)) => (CacheStatus::Hit, raw),
            (CacheStatus::Disabled, _) => return CacheResponseObject::disabled(),
            _ => {
                return CacheResponseObject {
                    cache_response: None,
                    cache_status: CacheStatus::Miss,
                    cache_key: outcome.key,
                    created_at,
                };
            }
        };

        let mut body = serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw));
        let mut response_status = StatusCode::OK;
        if let Some(before) = span.results(HookPhase::BeforeRequest) {
            if !before.results.is_empty() {
                if let Some(object) = body.as_object_mut() {
                    let mut hook_results = serde_json::Map::new();
                    hook_results.insert(
                        HookPhase::BeforeRequest.results_key().to_string(),
                        before.to_json(),
                    );
                    object.insert("hook_results".to_string(), Value::Object(hook_results));
                }
                if before.any_failed() {
                    response_status = custom_status(STATUS_HOOKS_FAILED, StatusCode::OK);
                }
            }
        }

        CacheResponseObject {
            cache_response: Some(CachedResponse {
                status: response_status,
                body,
            }),
            cache_status: status,
            cache_key: outcome.key,
            created_at,
        }
    }

    /// Writes a live response back under `key`. Failures are logged and ignored.
    pub async fn store_response(&self, context: &RequestContext, key: &str, body: &Value) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let value = match serde_json::to_string(body) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "cache write skipped: body not serializable");
                return;
            }
        };
        if let Err(err) = backend
            .put_in_cache(key, &value, context.cache().max_age)
            .await
        {
            tracing::warn!(error = %err, "cache write failed");
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: String,
    stored_at: u64,
    expires_at: u64,
}

/// TTL cache with FIFO eviction under an entry-count and a byte budget.
#[derive(Debug)]
struct MemoryCache {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    total_body_bytes: usize,
}

impl MemoryCache {
    fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: VecDeque::new(),
            total_body_bytes: 0,
        }
    }

    fn get(&mut self, key: &str, max_age: Option<u64>, now: u64) -> Option<String> {
        let entry = self.entries.get(key)?;
        let too_old = max_age.is_some_and(|max_age| now.saturating_sub(entry.stored_at) > max_age);
        if now >= entry.expires_at {
            self.remove(key);
            return None;
        }
        if too_old {
            return None;
        }
        Some(entry.value.clone())
    }

    fn insert(&mut self, key: String, value: String, ttl_seconds: Option<u64>, now: u64) {
        let ttl_seconds = ttl_seconds.unwrap_or(self.config.ttl_seconds);
        if ttl_seconds == 0
            || self.config.max_entries == 0
            || self.config.max_body_bytes == 0
            || self.config.max_total_body_bytes == 0
        {
            return;
        }

        let body_len = value.len();
        if body_len > self.config.max_body_bytes || body_len > self.config.max_total_body_bytes {
            return;
        }

        self.remove(&key);
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                stored_at: now,
                expires_at: now.saturating_add(ttl_seconds),
            },
        );
        self.total_body_bytes = self.total_body_bytes.saturating_add(body_len);
        self.order.push_back(key);

        while self.entries.len() > self.config.max_entries
            || self.total_body_bytes > self.config.max_total_body_bytes
        {
            let Some(candidate) = self.order.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&candidate) {
                self.total_body_bytes = self.total_body_bytes.saturating_sub(entry.value.len());
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.total_body_bytes = self.total_body_bytes.saturating_sub(entry.value.len());
        self.order.retain(|candidate| candidate != key);
        true
    }
}

/// Process-local [`CacheBackend`]. `semantic` lookups are served as exact matches.
#[derive(Debug)]
pub struct MemoryCacheBackend {
    inner: Mutex<MemoryCache>,
}

impl MemoryCacheBackend {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(MemoryCache::new(config)),
        }
    }

    pub fn cache_key(lookup: &CacheLookup<'_>) -> String {
        use sha2::Digest as _;

        let body = serde_json::to_vec(lookup.body).unwrap_or_default();
        let mut hasher = sha2::Sha256::new();
        hasher.update(b"guardrail-gateway-cache-v1|");
        hasher.update(lookup.identifier.as_bytes());
        hasher.update(b"|");
        hasher.update(lookup.endpoint.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(lookup.mode.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(&body);
        hex_lower(&hasher.finalize())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get_from_cache(&self, lookup: CacheLookup<'_>) -> Result<CacheReadOutcome, GatewayError> {
        let key = Self::cache_key(&lookup);
        let body = self
            .inner
            .lock()
            .await
            .get(&key, lookup.max_age, now_epoch_seconds());
        let status = if body.is_some() {
            CacheStatus::Hit
        } else {
            CacheStatus::Miss
        };
        Ok(CacheReadOutcome {
            body,
            status,
            key: Some(key),
        })
    }

    async fn put_in_cache(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<(), GatewayError> {
        self.inner.lock().await.insert(
            key.to_string(),
            value.to_string(),
            ttl_seconds,
            now_epoch_seconds(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_entries: usize, max_total_body_bytes: usize) -> CacheConfig {
        CacheConfig {
            enabled: true,
            ttl_seconds: 10,
            max_entries,
            max_body_bytes: 1024,
            max_total_body_bytes,
            ..CacheConfig::default()
        }
    }

    #[test]
    fn memory_cache_enforces_ttl_and_max_age() {
        let mut cache = MemoryCache::new(config(10, 1024));
        cache.insert("k".to_string(), "v".to_string(), Some(5), 100);
        assert_eq!(cache.get("k", None, 104).as_deref(), Some("v"));
        assert!(cache.get("k", Some(2), 104).is_none());
        assert!(cache.get("k", None, 105).is_none());
        assert!(cache.order.is_empty());
        assert_eq!(cache.total_body_bytes, 0);
    }

    #[test]
    fn memory_cache_evicts_oldest_first() {
        let mut cache = MemoryCache::new(config(2, 1024));
        cache.insert("a".to_string(), "1".to_string(), None, 0);
        cache.insert("b".to_string(), "2".to_string(), None, 0);
        cache.insert("c".to_string(), "3".to_string(), None, 0);
        assert!(cache.get("a", None, 1).is_none());
        assert!(cache.get("b", None, 1).is_some());
        assert!(cache.get("c", None, 1).is_some());

        let mut cache = MemoryCache::new(config(10, 4));
        cache.insert("a".to_string(), "xx".to_string(), None, 0);
        cache.insert("b".to_string(), "yyy".to_string(), None, 0);
        assert!(cache.get("a", None, 1).is_none());
        assert_eq!(cache.total_body_bytes, 3);
    }

    #[test]
    fn reinserting_a_key_replaces_it() {
        let mut cache = MemoryCache::new(config(10, 1024));
        cache.insert("k".to_string(), "old".to_string(), None, 0);
        cache.insert("k".to_string(), "new!".to_string(), None, 0);
        assert_eq!(cache.get("k", None, 1).as_deref(), Some("new!"));
        assert_eq!(cache.order.len(), 1);
        assert_eq!(cache.total_body_bytes, 4);
    }

    #[tokio::test]
    async fn backend_keys_on_identifier_and_body() {
        let backend = MemoryCacheBackend::new(config(10, 1024));
        let env = BTreeMap::new();
        let headers = HeaderMap::new();
        let body = serde_json::json!({"model": "m"});
        let lookup = CacheLookup {
            env: &env,
            headers: &headers,
            body: &body,
            endpoint: Endpoint::ChatComplete,
            identifier: "openai",
            mode: CacheMode::Simple,
            max_age: None,
        };

        let miss = backend.get_from_cache(lookup).await.expect("read");
        assert_eq!(miss.status, CacheStatus::Miss);
        let key = miss.key.expect("key");
        backend
            .put_in_cache(&key, r#"{"ok":true}"#, None)
            .await
            .expect("write");

        let hit = backend.get_from_cache(lookup).await.expect("read");
        assert_eq!(hit.status, CacheStatus::Hit);
        assert_eq!(hit.body.as_deref(), Some(r#"{"ok":true}"#));

        let other = CacheLookup {
            identifier: "anthropic",
            ..lookup
        };
        assert_ne!(MemoryCacheBackend::cache_key(&other), key);
    }

    #[test]
    fn lifecycle_endpoints_are_not_cacheable() {
        assert!(!is_endpoint_cacheable(Endpoint::CreateBatch));
        assert!(is_endpoint_cacheable(Endpoint::Embed));
    }
}
