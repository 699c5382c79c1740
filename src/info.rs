//! Connection-info assembly: the post-handshake `info` frame, discovery,
//! and introspection.
//!
//! Server info is computed on demand so it always reflects live state (cache
//! statistics, connection count). Model discovery goes through the schema
//! collaborator; when it is unavailable, discovery degrades to an empty list
//! rather than erroring. Introspection loads schema bodies through the cache
//! so repeated lookups hit the permanent schema tier.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::auth::AuthInfo;
use crate::backend::{ModelInfo, SchemaProvider, SessionProvider};
use crate::cache::BridgeCache;
use crate::config::BridgeConfig;

/// Version string advertised in `info` frames.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capabilities advertised to clients. `client_broadcast` is appended only
/// when the feature flag enables client-initiated broadcast.
fn feature_list(cfg: &BridgeConfig) -> Vec<&'static str> {
    let mut features = vec!["schema_cache", "query_cache", "input_prompts", "broadcast"];
    if cfg.allow_client_broadcast {
        features.push("client_broadcast");
    }
    features
}

/// Gathers server/connection metadata for `info`, `discover` and
/// `introspect`.
pub struct InfoProvider {
    schemas: Arc<dyn SchemaProvider>,
    sessions: Arc<dyn SessionProvider>,
    cache: Arc<BridgeCache>,
    features: Vec<&'static str>,
}

impl InfoProvider {
    pub fn new(
        schemas: Arc<dyn SchemaProvider>,
        sessions: Arc<dyn SessionProvider>,
        cache: Arc<BridgeCache>,
        cfg: &BridgeConfig,
    ) -> Self {
        Self {
            schemas,
            sessions,
            cache,
            features: feature_list(cfg),
        }
    }

    /// Builds the `info` payload sent right after a successful handshake.
    pub async fn server_info(&self, auth: &AuthInfo, live_connections: usize) -> Value {
        let mut session = match self.sessions.snapshot().await {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        session.insert("role".into(), json!(auth.role));
        session.insert("anonymous".into(), json!(auth.is_anonymous()));

        json!({
            "version": SERVER_VERSION,
            "features": self.features,
            "cache": self.cache.stats(),
            "connections": live_connections,
            "models": self.models().await,
            "session": Value::Object(session),
        })
    }

    /// The `discover` payload: known models with their operations.
    pub async fn discover(&self) -> Value {
        json!({ "models": self.models().await })
    }

    /// Full schema plus allowed operations for one model. `None` when the
    /// model is unknown to the schema collaborator.
    pub async fn introspect(&self, name: &str) -> Option<Value> {
        let schema = self.load_schema(name).await?;
        let operations = self
            .models()
            .await
            .into_iter()
            .find(|m| m.name == name)
            .map(|m| m.operations)
            .unwrap_or_default();
        Some(json!({
            "model": name,
            "schema": schema,
            "operations": operations,
        }))
    }

    /// Loads one schema body through the permanent cache tier.
    pub async fn load_schema(&self, name: &str) -> Option<Value> {
        let schemas = self.schemas.clone();
        self.cache
            .get_schema(name, move |model| async move {
                match schemas.introspect_model(&model).await {
                    Ok(body) => body,
                    Err(err) => {
                        warn!(model, %err, "schema provider failed");
                        None
                    }
                }
            })
            .await
    }

    async fn models(&self) -> Vec<ModelInfo> {
        match self.schemas.list_models().await {
            Ok(models) => models,
            Err(err) => {
                warn!(%err, "schema provider unavailable, discovery degraded");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TwoModels {
        introspections: AtomicUsize,
    }

    #[async_trait]
    impl SchemaProvider for TwoModels {
        async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
            Ok(vec![
                ModelInfo {
                    name: "users".into(),
                    operations: vec!["list".into(), "get".into(), "create".into()],
                },
                ModelInfo {
                    name: "orders".into(),
                    operations: vec!["list".into()],
                },
            ])
        }

        async fn introspect_model(&self, name: &str) -> anyhow::Result<Option<Value>> {
            self.introspections.fetch_add(1, Ordering::SeqCst);
            Ok(match name {
                "users" => Some(json!({"fields": ["id", "name"]})),
                _ => None,
            })
        }
    }

    struct BrokenSchemas;

    #[async_trait]
    impl SchemaProvider for BrokenSchemas {
        async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
            anyhow::bail!("backend offline")
        }

        async fn introspect_model(&self, _name: &str) -> anyhow::Result<Option<Value>> {
            anyhow::bail!("backend offline")
        }
    }

    struct FixedSession;

    #[async_trait]
    impl SessionProvider for FixedSession {
        async fn snapshot(&self) -> Value {
            json!({"mode": "tui"})
        }
    }

    fn provider(schemas: Arc<dyn SchemaProvider>) -> InfoProvider {
        InfoProvider::new(
            schemas,
            Arc::new(FixedSession),
            Arc::new(BridgeCache::new(60)),
            &BridgeConfig::default(),
        )
    }

    #[tokio::test]
    async fn server_info_reflects_live_state() {
        let info = provider(Arc::new(TwoModels {
            introspections: AtomicUsize::new(0),
        }));
        let payload = info.server_info(&AuthInfo::anonymous(), 3).await;

        assert_eq!(payload["version"], SERVER_VERSION);
        assert_eq!(payload["connections"], 3);
        assert_eq!(payload["session"]["role"], "guest");
        assert_eq!(payload["session"]["anonymous"], true);
        assert_eq!(payload["session"]["mode"], "tui");
        assert_eq!(payload["models"].as_array().unwrap().len(), 2);
        let features = payload["features"].as_array().unwrap();
        assert!(features.iter().any(|f| f == "input_prompts"));
        assert!(!features.iter().any(|f| f == "client_broadcast"));
    }

    #[tokio::test]
    async fn client_broadcast_feature_follows_the_flag() {
        let cfg = BridgeConfig {
            allow_client_broadcast: true,
            ..BridgeConfig::default()
        };
        let info = InfoProvider::new(
            Arc::new(EmptyForTest),
            Arc::new(FixedSession),
            Arc::new(BridgeCache::new(60)),
            &cfg,
        );
        let payload = info.server_info(&AuthInfo::anonymous(), 0).await;
        assert!(payload["features"]
            .as_array()
            .unwrap()
            .iter()
            .any(|f| f == "client_broadcast"));
    }

    struct EmptyForTest;

    #[async_trait]
    impl SchemaProvider for EmptyForTest {
        async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
            Ok(Vec::new())
        }

        async fn introspect_model(&self, _name: &str) -> anyhow::Result<Option<Value>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn broken_provider_degrades_to_empty_discovery() {
        let info = provider(Arc::new(BrokenSchemas));
        let discovered = info.discover().await;
        assert_eq!(discovered["models"], json!([]));
    }

    #[tokio::test]
    async fn introspect_combines_schema_and_operations() {
        let info = provider(Arc::new(TwoModels {
            introspections: AtomicUsize::new(0),
        }));
        let payload = info.introspect("users").await.unwrap();
        assert_eq!(payload["model"], "users");
        assert_eq!(payload["schema"]["fields"][0], "id");
        assert_eq!(payload["operations"][2], "create");

        assert!(info.introspect("ghost").await.is_none());
    }

    #[tokio::test]
    async fn schema_bodies_come_from_the_cache_after_first_load() {
        let schemas = Arc::new(TwoModels {
            introspections: AtomicUsize::new(0),
        });
        let info = provider(schemas.clone());

        info.load_schema("users").await.unwrap();
        info.load_schema("users").await.unwrap();
        info.load_schema("users").await.unwrap();
        assert_eq!(schemas.introspections.load(Ordering::SeqCst), 1);
    }
}
