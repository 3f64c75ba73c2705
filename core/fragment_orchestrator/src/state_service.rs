use crate::errors::{PipelineError, PipelineResult};
use dashmap::DashMap;
use r2d2::Pool;
use r2d2_redis::redis::Commands;
use r2d2_redis::RedisConnectionManager;
use serde::{Deserialize, Serialize};
use shared_types::{RedisConfig, RequestId, RequestRecord};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ephemeral key-value store for request records and cached provider
/// responses. Every operation is key-scoped; each record key is owned by
/// exactly one coordinator, so no cross-key locking is needed.
pub trait StateStore: Send + Sync {
    fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> PipelineResult<()>;
    fn get(&self, key: &str) -> PipelineResult<Option<String>>;
    fn delete(&self, key: &str) -> PipelineResult<bool>;
}

pub fn record_key(request_id: RequestId) -> String {
    format!("req:{request_id}")
}

/// Persist a request record; serialization failures are reported as store
/// failures so the coordinator treats them as soft.
pub fn save_record(
    store: &dyn StateStore,
    record: &RequestRecord,
    ttl_seconds: u64,
) -> PipelineResult<()> {
    let json = serde_json::to_string(record)
        .map_err(|e| PipelineError::StateStore(format!("record serialization: {e}")))?;
    store.put(&record_key(record.request_id), &json, ttl_seconds)
}

pub fn load_record(
    store: &dyn StateStore,
    request_id: RequestId,
) -> PipelineResult<Option<RequestRecord>> {
    match store.get(&record_key(request_id))? {
        Some(json) => serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| PipelineError::StateStore(format!("record deserialization: {e}"))),
        None => Ok(None),
    }
}

/// Provider response cached by (provider, model, prompt).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CachedProviderResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
    pub cached_at: String,
}

pub fn cache_key(provider: &str, model: &str, prompt: &str) -> String {
    let mut hasher = DefaultHasher::new();
    provider.hash(&mut hasher);
    model.hash(&mut hasher);
    prompt.hash(&mut hasher);
    format!("llm:response:{}", hasher.finish())
}

pub fn get_cached_response(
    store: &dyn StateStore,
    provider: &str,
    model: &str,
    prompt: &str,
) -> Option<CachedProviderResponse> {
    let key = cache_key(provider, model, prompt);
    match store.get(&key) {
        Ok(Some(json)) => match serde_json::from_str(&json) {
            Ok(cached) => {
                debug!(%key, "provider response cache hit");
                Some(cached)
            }
            Err(e) => {
                warn!(%key, error = %e, "discarding undecodable cache entry");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(%key, error = %e, "cache lookup failed");
            None
        }
    }
}

pub fn put_cached_response(
    store: &dyn StateStore,
    prompt: &str,
    response: &CachedProviderResponse,
    ttl_seconds: u64,
) {
    let key = cache_key(&response.provider, &response.model, prompt);
    match serde_json::to_string(response) {
        Ok(json) => {
            if let Err(e) = store.put(&key, &json, ttl_seconds) {
                warn!(%key, error = %e, "failed to cache provider response");
            }
        }
        Err(e) => warn!(%key, error = %e, "failed to serialize cache entry"),
    }
}

/// Redis-backed store; the only cross-process shared resource.
pub struct RedisStateStore {
    pool: Pool<RedisConnectionManager>,
}

impl RedisStateStore {
    pub fn new(config: &RedisConfig) -> PipelineResult<Self> {
        info!(
            url = %config.url,
            pool_size = config.pool_size,
            "initializing redis state store"
        );

        let manager = RedisConnectionManager::new(config.url.as_str())
            .map_err(|e| PipelineError::StateStore(format!("connection manager: {e}")))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(1))
            .connection_timeout(Duration::from_millis(
                config.connection_timeout_ms.unwrap_or(2_000),
            ))
            .build(manager)
            .map_err(|e| PipelineError::StateStore(format!("pool: {e}")))?;

        Ok(RedisStateStore { pool })
    }
}

impl StateStore for RedisStateStore {
    fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> PipelineResult<()> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| PipelineError::StateStore(format!("connection: {e}")))?;
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds as usize)
            .map_err(|e| PipelineError::StateStore(format!("SETEX {key}: {e}")))
    }

    fn get(&self, key: &str) -> PipelineResult<Option<String>> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| PipelineError::StateStore(format!("connection: {e}")))?;
        conn.get(key)
            .map_err(|e| PipelineError::StateStore(format!("GET {key}: {e}")))
    }

    fn delete(&self, key: &str) -> PipelineResult<bool> {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| PipelineError::StateStore(format!("connection: {e}")))?;
        let removed: i64 = conn
            .del(key)
            .map_err(|e| PipelineError::StateStore(format!("DEL {key}: {e}")))?;
        Ok(removed > 0)
    }
}

/// In-process fallback used when Redis is not configured; records then only
/// survive as long as the process. TTLs are accepted and ignored.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, String>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        MemoryStateStore::default()
    }
}

impl StateStore for MemoryStateStore {
    fn put(&self, key: &str, value: &str, _ttl_seconds: u64) -> PipelineResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> PipelineResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn delete(&self, key: &str) -> PipelineResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStateStore::new();
        store.put("k", "v", 60).unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert!(store.delete("k").unwrap());
        assert!(!store.delete("k").unwrap());
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn record_round_trips_through_store() {
        let store = MemoryStateStore::new();
        let record = RequestRecord::new(
            Uuid::new_v4(),
            "what is rust".to_string(),
            "2026-01-01T00:00:00Z".to_string(),
        );

        save_record(&store, &record, 3_600).unwrap();
        let loaded = load_record(&store, record.request_id).unwrap().unwrap();
        assert_eq!(loaded.query, record.query);
        assert!(loaded.terminal.is_none());

        assert!(load_record(&store, Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn cache_key_is_stable_and_prompt_sensitive() {
        let a = cache_key("alpha", "m1", "hello");
        let b = cache_key("alpha", "m1", "hello");
        let c = cache_key("alpha", "m1", "other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("llm:response:"));
    }

    #[test]
    fn cached_response_round_trips() {
        let store = MemoryStateStore::new();
        let cached = CachedProviderResponse {
            text: "Paris".to_string(),
            provider: "alpha".to_string(),
            model: "m1".to_string(),
            tokens_in: 10,
            tokens_out: 2,
            cost: 0.001,
            cached_at: "2026-01-01T00:00:00Z".to_string(),
        };

        put_cached_response(&store, "capital of France?", &cached, 3_600);
        let hit = get_cached_response(&store, "alpha", "m1", "capital of France?").unwrap();
        assert_eq!(hit.text, "Paris");
        assert!(get_cached_response(&store, "alpha", "m1", "different").is_none());
    }
}
