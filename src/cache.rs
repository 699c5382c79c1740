//! Two-tier in-process cache shared by all bridge connections.
//!
//! The first tier holds schema snapshots: loaded lazily, never aged out, and
//! guarded by single-flight semantics so concurrent requests for a missing
//! schema invoke the loader exactly once. The second tier holds query
//! results under a TTL: entries expire lazily on read and are additionally
//! evicted under capacity pressure. Both tiers feed a shared statistics
//! snapshot.
//!
//! # Examples
//!
//! ```rust,no_run
//! use hashi::cache::BridgeCache;
//! use serde_json::json;
//!
//! # async fn example() {
//! let cache = BridgeCache::new(60);
//!
//! let schema = cache
//!     .get_schema("users", |name| async move {
//!         Some(json!({"model": name, "fields": ["id", "name"]}))
//!     })
//!     .await;
//! assert!(schema.is_some());
//!
//! cache.put_query("abc123", "users", json!([1, 2, 3]), 0);
//! assert!(cache.get_query("abc123").is_some());
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

/// Upper bound on live query entries before insertion evicts old ones.
const DEFAULT_QUERY_CAPACITY: usize = 4096;

/// Immutable snapshot of a loaded schema.
#[derive(Debug, Clone)]
pub struct SchemaEntry {
    pub body: Value,
    pub loaded_at: Instant,
}

#[derive(Debug)]
struct QueryEntry {
    payload: Value,
    model: String,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Which cache tier an explicit clear targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearKind {
    Schemas,
    Queries,
    All,
}

impl FromStr for ClearKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schemas" => Ok(ClearKind::Schemas),
            "queries" => Ok(ClearKind::Queries),
            "all" => Ok(ClearKind::All),
            _ => Err(()),
        }
    }
}

/// Point-in-time cache statistics, serialized directly into `cache_stats`
/// replies.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub schema_hits: u64,
    pub schema_misses: u64,
    pub schema_size: usize,
    pub query_hits: u64,
    pub query_misses: u64,
    pub query_size: usize,
    pub default_ttl_seconds: u64,
}

/// The bridge cache.
///
/// All operations are safe under parallel callers. The schema tier pairs a
/// concurrent map of loaded entries with a per-key flight lock; the query
/// tier is a plain map behind a single short-section lock, which is adequate
/// at bridge scale.
pub struct BridgeCache {
    schemas: DashMap<String, Arc<SchemaEntry>>,
    flights: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    queries: Mutex<HashMap<String, QueryEntry>>,
    query_capacity: usize,
    default_ttl_secs: AtomicU64,
    schema_hits: AtomicU64,
    schema_misses: AtomicU64,
    query_hits: AtomicU64,
    query_misses: AtomicU64,
}

impl BridgeCache {
    /// Creates a cache with the given default query TTL in seconds.
    pub fn new(default_ttl_secs: u64) -> Self {
        Self::with_capacity(default_ttl_secs, DEFAULT_QUERY_CAPACITY)
    }

    /// Creates a cache with an explicit query-entry capacity.
    pub fn with_capacity(default_ttl_secs: u64, query_capacity: usize) -> Self {
        Self {
            schemas: DashMap::new(),
            flights: DashMap::new(),
            queries: Mutex::new(HashMap::new()),
            query_capacity: query_capacity.max(1),
            default_ttl_secs: AtomicU64::new(default_ttl_secs.max(1)),
            schema_hits: AtomicU64::new(0),
            schema_misses: AtomicU64::new(0),
            query_hits: AtomicU64::new(0),
            query_misses: AtomicU64::new(0),
        }
    }

    /// Returns the schema for `name`, invoking `loader` on the first request.
    ///
    /// Concurrent callers for the same missing key serialize on a per-key
    /// flight lock: the first invokes the loader, the rest wait and observe
    /// the loaded value. A loader that returns `None` or `Value::Null` is a
    /// failed load; nothing is cached and the next call tries again.
    pub async fn get_schema<F, Fut>(&self, name: &str, loader: F) -> Option<Value>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Option<Value>> + Send,
    {
        if let Some(entry) = self.schemas.get(name) {
            self.schema_hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.body.clone());
        }

        let flight = self
            .flights
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone();
        let _guard = flight.lock().await;

        // Another caller may have finished the load while we waited.
        if let Some(entry) = self.schemas.get(name) {
            self.schema_hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.body.clone());
        }

        self.schema_misses.fetch_add(1, Ordering::Relaxed);
        let loaded = loader(name.to_string()).await;
        let result = match loaded {
            Some(body) if !body.is_null() => {
                self.schemas.insert(
                    name.to_string(),
                    Arc::new(SchemaEntry {
                        body: body.clone(),
                        loaded_at: Instant::now(),
                    }),
                );
                Some(body)
            }
            _ => {
                debug!(schema = name, "schema load produced no body, not caching");
                None
            }
        };
        self.flights.remove(name);
        result
    }

    /// Returns the payload for `key` if the entry exists and is fresh.
    ///
    /// An entry is valid iff `now < expiry` (strict); an entry read at or
    /// after its expiry instant is removed and counted as a miss.
    pub fn get_query(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut queries = self.queries.lock();
        match queries.get(key) {
            Some(entry) if now < entry.expires_at => {
                self.query_hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.payload.clone())
            }
            Some(_) => {
                queries.remove(key);
                self.query_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.query_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a query result under `key` for `ttl_seconds`.
    ///
    /// A zero or negative TTL falls back to the configured default. The
    /// model name is recorded so mutations can invalidate per model.
    pub fn put_query(&self, key: &str, model: &str, payload: Value, ttl_seconds: i64) {
        let ttl = if ttl_seconds > 0 {
            Duration::from_secs(ttl_seconds as u64)
        } else {
            Duration::from_secs(self.default_ttl_secs.load(Ordering::Relaxed))
        };
        let now = Instant::now();

        let mut queries = self.queries.lock();
        if queries.len() >= self.query_capacity && !queries.contains_key(key) {
            Self::evict_locked(&mut queries, now, self.query_capacity);
        }
        queries.insert(
            key.to_string(),
            QueryEntry {
                payload,
                model: model.to_string(),
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }

    /// Drops expired entries, then the oldest live entry if still at capacity.
    fn evict_locked(queries: &mut HashMap<String, QueryEntry>, now: Instant, capacity: usize) {
        queries.retain(|_, e| now < e.expires_at);
        while queries.len() >= capacity {
            let Some(oldest) = queries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            queries.remove(&oldest);
        }
    }

    /// Removes query entries for one model, or every entry when the mutated
    /// model is unknown. This is the documented invalidation policy for
    /// mutating commands: per-model clearing with clear-all as the fallback.
    pub fn invalidate_model(&self, model: Option<&str>) {
        let mut queries = self.queries.lock();
        match model {
            Some(model) => queries.retain(|_, e| e.model != model),
            None => queries.clear(),
        }
    }

    /// Clears one or both tiers. Idempotent.
    pub fn clear(&self, kind: ClearKind) {
        if matches!(kind, ClearKind::Schemas | ClearKind::All) {
            self.schemas.clear();
        }
        if matches!(kind, ClearKind::Queries | ClearKind::All) {
            self.queries.lock().clear();
        }
    }

    /// Updates the default query TTL. Existing entries keep their original
    /// expiry; the new default only applies to later `put_query` calls.
    pub fn set_default_query_ttl(&self, seconds: u64) {
        self.default_ttl_secs.store(seconds.max(1), Ordering::Relaxed);
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            schema_hits: self.schema_hits.load(Ordering::Relaxed),
            schema_misses: self.schema_misses.load(Ordering::Relaxed),
            schema_size: self.schemas.len(),
            query_hits: self.query_hits.load(Ordering::Relaxed),
            query_misses: self.query_misses.load(Ordering::Relaxed),
            query_size: self.queries.lock().len(),
            default_ttl_seconds: self.default_ttl_secs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{advance, sleep};

    fn payload() -> Value {
        json!([{"id": 1, "name": "a"}])
    }

    #[tokio::test(start_paused = true)]
    async fn query_roundtrip_before_expiry() {
        let cache = BridgeCache::new(60);
        cache.put_query("k", "users", payload(), 0);
        assert_eq!(cache.get_query("k"), Some(payload()));
    }

    #[tokio::test(start_paused = true)]
    async fn query_expiry_is_strict() {
        let cache = BridgeCache::new(60);
        cache.put_query("k", "users", payload(), 5);

        advance(Duration::from_secs(4)).await;
        assert!(cache.get_query("k").is_some());

        // exactly at expiry: already expired
        advance(Duration::from_secs(1)).await;
        assert!(cache.get_query("k").is_none());
        // the expired entry was removed on read
        assert_eq!(cache.stats().query_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_uses_default() {
        let cache = BridgeCache::new(10);
        cache.put_query("k", "users", payload(), 0);
        advance(Duration::from_secs(9)).await;
        assert!(cache.get_query("k").is_some());
        advance(Duration::from_secs(1)).await;
        assert!(cache.get_query("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn set_default_ttl_is_not_retroactive() {
        let cache = BridgeCache::new(10);
        cache.put_query("old", "users", payload(), 0);
        cache.set_default_query_ttl(100);
        cache.put_query("new", "users", payload(), 0);

        advance(Duration::from_secs(11)).await;
        assert!(cache.get_query("old").is_none());
        assert!(cache.get_query("new").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_queries_then_miss() {
        let cache = BridgeCache::new(60);
        cache.put_query("k", "users", payload(), 0);
        cache.clear(ClearKind::Queries);
        assert!(cache.get_query("k").is_none());
        // clear is idempotent
        cache.clear(ClearKind::All);
        cache.clear(ClearKind::All);
        assert_eq!(cache.stats().query_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_by_model_spares_other_models() {
        let cache = BridgeCache::new(60);
        cache.put_query("a", "users", payload(), 0);
        cache.put_query("b", "orders", payload(), 0);
        cache.invalidate_model(Some("users"));
        assert!(cache.get_query("a").is_none());
        assert!(cache.get_query("b").is_some());

        cache.invalidate_model(None);
        assert!(cache.get_query("b").is_none());
    }

    #[tokio::test]
    async fn schema_load_is_single_flight() {
        let cache = Arc::new(BridgeCache::new(60));
        let loads = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let loads = loads.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_schema("users", |name| async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(20)).await;
                        Some(json!({"model": name}))
                    })
                    .await
            }));
        }

        for task in tasks {
            let body = task.await.unwrap().unwrap();
            assert_eq!(body["model"], "users");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().schema_misses, 1);
    }

    #[tokio::test]
    async fn failed_schema_load_is_not_cached() {
        let cache = BridgeCache::new(60);

        let first = cache.get_schema("ghost", |_| async { None }).await;
        assert!(first.is_none());

        // next call invokes the loader again and can succeed
        let second = cache
            .get_schema("ghost", |_| async { Some(json!({"ok": true})) })
            .await;
        assert_eq!(second.unwrap()["ok"], true);
        assert_eq!(cache.stats().schema_misses, 2);
    }

    #[tokio::test]
    async fn null_schema_body_is_a_failed_load() {
        let cache = BridgeCache::new(60);
        let got = cache.get_schema("n", |_| async { Some(Value::Null) }).await;
        assert!(got.is_none());
        assert_eq!(cache.stats().schema_size, 0);
    }

    #[tokio::test]
    async fn schemas_never_age_out() {
        let cache = BridgeCache::new(1);
        cache
            .get_schema("users", |_| async { Some(json!({"v": 1})) })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let hit = cache.get_schema("users", |_| async { None }).await;
        assert_eq!(hit.unwrap()["v"], 1);
        assert_eq!(cache.stats().schema_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_pressure_evicts_oldest() {
        let cache = BridgeCache::with_capacity(60, 2);
        cache.put_query("first", "users", payload(), 0);
        advance(Duration::from_secs(1)).await;
        cache.put_query("second", "users", payload(), 0);
        advance(Duration::from_secs(1)).await;
        cache.put_query("third", "users", payload(), 0);

        assert!(cache.get_query("first").is_none());
        assert!(cache.get_query("second").is_some());
        assert!(cache.get_query("third").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stats_count_hits_and_misses() {
        let cache = BridgeCache::new(60);
        assert!(cache.get_query("missing").is_none());
        cache.put_query("k", "users", payload(), 0);
        assert!(cache.get_query("k").is_some());

        let stats = cache.stats();
        assert_eq!(stats.query_hits, 1);
        assert_eq!(stats.query_misses, 1);
        assert_eq!(stats.query_size, 1);
        assert_eq!(stats.default_ttl_seconds, 60);
    }
}
