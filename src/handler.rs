//! Inbound event routing: one handler object per event tag.
//!
//! Each parsed [`Frame`] is routed by its `event` tag through an explicit
//! [`EventTable`]. Handlers implement the small [`EventHandler`] capability
//! (`name` + `handle`) and receive the shared [`EventContext`] plus the
//! originating connection; they never reach into the bridge server itself.
//! Unknown events get an error reply and leave the connection open.
//!
//! Every handler except `dispatch` runs inline on the connection's read
//! loop, so non-dispatch replies are serial per connection. `dispatch`
//! hands the command to a worker task and returns immediately: the same
//! connection keeps reading frames (and can answer input prompts) while the
//! command runs, and its reply is ordered by correlation id instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{BridgeCache, ClearKind};
use crate::config::Config;
use crate::connection::{ClientRegistry, Connection};
use crate::dispatch::{DispatchAdapter, DispatchEffect, Executed};
use crate::error::BridgeError;
use crate::info::InfoProvider;
use crate::prompt::{ConnectionHandle, PromptRouter};
use crate::protocol::{events, server_frame, Frame, Reply};

/// Shared resources handed to every event handler. Owned by the bridge
/// server and passed explicitly; there is no global state.
pub struct EventContext {
    pub config: Arc<Config>,
    pub cache: Arc<BridgeCache>,
    pub prompts: Arc<PromptRouter>,
    pub dispatch: Arc<DispatchAdapter>,
    pub info: Arc<InfoProvider>,
    pub clients: ClientRegistry,
    /// Cancelled on shutdown; dispatch workers abort cleanly when it fires.
    pub cancel: CancellationToken,
}

/// One routable event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The event tag this handler answers to.
    fn name(&self) -> &'static str;

    /// Handles one frame. `Some` replies are sent by the read loop; `None`
    /// means the handler replies asynchronously (or not at all).
    async fn handle(
        &self,
        frame: Frame,
        ctx: &EventContext,
        conn: &Arc<Connection>,
    ) -> Option<Reply>;
}

/// The event routing table.
pub struct EventTable {
    handlers: HashMap<&'static str, Box<dyn EventHandler>>,
}

impl EventTable {
    /// Builds the standard table covering every defined client event.
    pub fn standard() -> Self {
        let mut table = Self {
            handlers: HashMap::new(),
        };
        table.register(Box::new(DispatchHandler));
        table.register(Box::new(InputResponseHandler));
        table.register(Box::new(GetSchemaHandler));
        table.register(Box::new(DiscoverHandler));
        table.register(Box::new(IntrospectHandler));
        table.register(Box::new(CacheStatsHandler));
        table.register(Box::new(ClearCacheHandler));
        table.register(Box::new(SetQueryTtlHandler));
        table.register(Box::new(BroadcastHandler));
        table
    }

    pub fn register(&mut self, handler: Box<dyn EventHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    /// Routes one frame. Unknown events produce an error reply rather than
    /// a disconnect.
    pub async fn route(
        &self,
        frame: Frame,
        ctx: &EventContext,
        conn: &Arc<Connection>,
    ) -> Option<Reply> {
        match self.handlers.get(frame.event.as_str()) {
            Some(handler) => handler.handle(frame, ctx, conn).await,
            None => {
                let err = BridgeError::BadFrame(format!("unknown event: {}", frame.event));
                Some(Reply::error(&frame.event, frame.id, &err))
            }
        }
    }
}

/// `dispatch`: execute a named command on a worker task.
struct DispatchHandler;

#[async_trait]
impl EventHandler for DispatchHandler {
    fn name(&self) -> &'static str {
        events::DISPATCH
    }

    async fn handle(
        &self,
        frame: Frame,
        ctx: &EventContext,
        conn: &Arc<Connection>,
    ) -> Option<Reply> {
        let Some(command) = frame.data.get("command").and_then(Value::as_str) else {
            let err = BridgeError::BadFrame("dispatch requires data.command".into());
            return Some(Reply::error(events::DISPATCH, frame.id, &err));
        };
        let command = command.to_string();
        let args = frame.data.get("args").cloned().unwrap_or(Value::Null);

        let dispatch = ctx.dispatch.clone();
        let clients = ctx.clients.clone();
        let cancel = ctx.cancel.clone();
        let handle = ConnectionHandle::new(conn.clone(), ctx.prompts.clone());
        let conn = conn.clone();
        let id = frame.id;

        // The read loop must keep consuming frames while the command runs;
        // the reply travels through the mailbox when the worker finishes.
        tokio::spawn(async move {
            let result = tokio::select! {
                result = dispatch.execute(&command, args, &conn.auth, handle) => result,
                _ = cancel.cancelled() => {
                    debug!(conn = conn.id, command = %command, "dispatch worker cancelled by shutdown");
                    return;
                }
            };
            let reply = match &result {
                Ok(executed) => Reply::ok(events::DISPATCH, id, dispatch_reply_data(executed)),
                Err(err) => Reply::error(events::DISPATCH, id, err),
            };
            conn.outbox.send_text(reply.to_json());

            if let Ok(Executed {
                effect: DispatchEffect::Mutated { model },
                ..
            }) = result
            {
                let update = server_frame(events::DATA_UPDATED, None, json!({ "model": model }));
                let report = clients.broadcast_text(&update, Some(conn.id));
                debug!(
                    conn = conn.id,
                    command = %command,
                    delivered = report.delivered,
                    "data_updated broadcast"
                );
            }
        });

        None
    }
}

/// Shapes the dispatch reply payload. Cacheable (read-only) results carry a
/// `cached` marker: arrays as `{rows, cached}`, objects with the flag mixed
/// in, scalars as `{value, cached}`. Mutation results pass through verbatim.
fn dispatch_reply_data(executed: &Executed) -> Value {
    if executed.effect != DispatchEffect::None {
        return executed.data.clone();
    }
    match &executed.data {
        Value::Array(rows) => json!({ "rows": rows, "cached": executed.cached }),
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("cached".into(), json!(executed.cached));
            Value::Object(map)
        }
        other => json!({ "value": other, "cached": executed.cached }),
    }
}

/// `input_response`: wake the prompt waiting on this id.
struct InputResponseHandler;

#[async_trait]
impl EventHandler for InputResponseHandler {
    fn name(&self) -> &'static str {
        events::INPUT_RESPONSE
    }

    async fn handle(
        &self,
        frame: Frame,
        ctx: &EventContext,
        conn: &Arc<Connection>,
    ) -> Option<Reply> {
        let Some(id) = frame.id else {
            let err = BridgeError::BadFrame("input_response requires an id".into());
            return Some(Reply::error(events::INPUT_RESPONSE, None, &err));
        };
        let value = frame.data.get("value").cloned().unwrap_or(Value::Null);
        if !ctx.prompts.resolve(&id, value) {
            warn!(conn = conn.id, prompt = %id, "reply for unknown prompt id dropped");
        }
        None
    }
}

/// `get_schema`: fetch or lazily load one model's schema.
struct GetSchemaHandler;

#[async_trait]
impl EventHandler for GetSchemaHandler {
    fn name(&self) -> &'static str {
        events::GET_SCHEMA
    }

    async fn handle(
        &self,
        frame: Frame,
        ctx: &EventContext,
        _conn: &Arc<Connection>,
    ) -> Option<Reply> {
        let Some(model) = frame.data.get("model").and_then(Value::as_str) else {
            let err = BridgeError::BadFrame("get_schema requires data.model".into());
            return Some(Reply::error(events::GET_SCHEMA, frame.id, &err));
        };
        match ctx.info.load_schema(model).await {
            Some(schema) => Some(Reply::ok(
                events::GET_SCHEMA,
                frame.id,
                json!({ "model": model, "schema": schema }),
            )),
            None => {
                let err = BridgeError::Command(format!("unknown model: {model}"));
                Some(Reply::error(events::GET_SCHEMA, frame.id, &err))
            }
        }
    }
}

/// `discover`: list known models with capabilities.
struct DiscoverHandler;

#[async_trait]
impl EventHandler for DiscoverHandler {
    fn name(&self) -> &'static str {
        events::DISCOVER
    }

    async fn handle(
        &self,
        frame: Frame,
        ctx: &EventContext,
        _conn: &Arc<Connection>,
    ) -> Option<Reply> {
        Some(Reply::ok(events::DISCOVER, frame.id, ctx.info.discover().await))
    }
}

/// `introspect`: full schema and allowed operations for one model.
struct IntrospectHandler;

#[async_trait]
impl EventHandler for IntrospectHandler {
    fn name(&self) -> &'static str {
        events::INTROSPECT
    }

    async fn handle(
        &self,
        frame: Frame,
        ctx: &EventContext,
        _conn: &Arc<Connection>,
    ) -> Option<Reply> {
        let Some(model) = frame.data.get("model").and_then(Value::as_str) else {
            let err = BridgeError::BadFrame("introspect requires data.model".into());
            return Some(Reply::error(events::INTROSPECT, frame.id, &err));
        };
        match ctx.info.introspect(model).await {
            Some(payload) => Some(Reply::ok(events::INTROSPECT, frame.id, payload)),
            None => {
                let err = BridgeError::Command(format!("unknown model: {model}"));
                Some(Reply::error(events::INTROSPECT, frame.id, &err))
            }
        }
    }
}

/// `cache_stats`: statistics snapshot plus the live connection count.
struct CacheStatsHandler;

#[async_trait]
impl EventHandler for CacheStatsHandler {
    fn name(&self) -> &'static str {
        events::CACHE_STATS
    }

    async fn handle(
        &self,
        frame: Frame,
        ctx: &EventContext,
        _conn: &Arc<Connection>,
    ) -> Option<Reply> {
        let mut data = serde_json::to_value(ctx.cache.stats()).unwrap_or_default();
        if let Value::Object(map) = &mut data {
            map.insert("connections".into(), json!(ctx.clients.len()));
        }
        Some(Reply::ok(events::CACHE_STATS, frame.id, data))
    }
}

/// `clear_cache`: clear schemas, queries, or both.
struct ClearCacheHandler;

#[async_trait]
impl EventHandler for ClearCacheHandler {
    fn name(&self) -> &'static str {
        events::CLEAR_CACHE
    }

    async fn handle(
        &self,
        frame: Frame,
        ctx: &EventContext,
        _conn: &Arc<Connection>,
    ) -> Option<Reply> {
        let kind = frame
            .data
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("all");
        let Ok(clear) = kind.parse::<ClearKind>() else {
            let err = BridgeError::BadFrame(format!(
                "clear_cache kind must be schemas, queries or all, got {kind:?}"
            ));
            return Some(Reply::error(events::CLEAR_CACHE, frame.id, &err));
        };
        ctx.cache.clear(clear);
        Some(Reply::ok(events::CLEAR_CACHE, frame.id, json!({ "cleared": kind })))
    }
}

/// `set_query_cache_ttl`: update the global default TTL.
struct SetQueryTtlHandler;

#[async_trait]
impl EventHandler for SetQueryTtlHandler {
    fn name(&self) -> &'static str {
        events::SET_QUERY_CACHE_TTL
    }

    async fn handle(
        &self,
        frame: Frame,
        ctx: &EventContext,
        _conn: &Arc<Connection>,
    ) -> Option<Reply> {
        let Some(seconds) = frame.data.get("seconds").and_then(Value::as_u64).filter(|s| *s > 0)
        else {
            let err =
                BridgeError::BadFrame("set_query_cache_ttl requires data.seconds > 0".into());
            return Some(Reply::error(events::SET_QUERY_CACHE_TTL, frame.id, &err));
        };
        ctx.cache.set_default_query_ttl(seconds);
        Some(Reply::ok(
            events::SET_QUERY_CACHE_TTL,
            frame.id,
            json!({ "default_ttl_seconds": seconds }),
        ))
    }
}

/// `broadcast`: re-emit a client payload to all other peers, behind the
/// `allow_client_broadcast` flag (default off).
struct BroadcastHandler;

#[async_trait]
impl EventHandler for BroadcastHandler {
    fn name(&self) -> &'static str {
        events::BROADCAST
    }

    async fn handle(
        &self,
        frame: Frame,
        ctx: &EventContext,
        conn: &Arc<Connection>,
    ) -> Option<Reply> {
        if !ctx.config.bridge.allow_client_broadcast {
            let err = BridgeError::Policy("client broadcast is disabled".into());
            return Some(Reply::error(events::BROADCAST, frame.id, &err));
        }
        let relayed = server_frame(events::BROADCAST, None, frame.data);
        let report = ctx.clients.broadcast_text(&relayed, Some(conn.id));
        Some(Reply::ok(
            events::BROADCAST,
            frame.id,
            json!({ "delivered": report.delivered, "dropped": report.dropped }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthInfo;
    use crate::backend::{EchoDispatcher, ModelInfo, SchemaProvider, StaticSessionProvider};
    use crate::connection::Outbox;
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    struct UsersOnly;

    #[async_trait]
    impl SchemaProvider for UsersOnly {
        async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
            Ok(vec![ModelInfo {
                name: "users".into(),
                operations: vec!["list".into()],
            }])
        }

        async fn introspect_model(&self, name: &str) -> anyhow::Result<Option<Value>> {
            Ok((name == "users").then(|| json!({"fields": ["id"]})))
        }
    }

    fn context(allow_client_broadcast: bool) -> EventContext {
        let config = Arc::new(Config {
            bridge: crate::config::BridgeConfig {
                allow_client_broadcast,
                ..Default::default()
            },
            ..Default::default()
        });
        let cache = Arc::new(BridgeCache::new(60));
        let schemas: Arc<dyn SchemaProvider> = Arc::new(UsersOnly);
        EventContext {
            config: config.clone(),
            cache: cache.clone(),
            prompts: Arc::new(PromptRouter::new()),
            dispatch: Arc::new(DispatchAdapter::new(
                Arc::new(EchoDispatcher),
                cache.clone(),
                StdHashMap::new(),
            )),
            info: Arc::new(InfoProvider::new(
                schemas,
                Arc::new(StaticSessionProvider),
                cache,
                &config.bridge,
            )),
            clients: ClientRegistry::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn connection(id: u64) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Arc::new(Connection::new(
                id,
                "127.0.0.1:9".parse().unwrap(),
                AuthInfo::anonymous(),
                Outbox::new(id, tx),
            )),
            rx,
        )
    }

    fn frame(event: &str, id: Option<&str>, data: Value) -> Frame {
        Frame {
            event: event.to_string(),
            id: id.map(str::to_string),
            data,
        }
    }

    async fn route(ctx: &EventContext, conn: &Arc<Connection>, f: Frame) -> Option<Reply> {
        EventTable::standard().route(f, ctx, conn).await
    }

    fn reply_json(reply: Reply) -> Value {
        serde_json::from_str(&reply.to_json()).unwrap()
    }

    #[tokio::test]
    async fn unknown_events_get_an_error_reply() {
        let ctx = context(false);
        let (conn, _rx) = connection(1);
        let reply = route(&ctx, &conn, frame("frobnicate", Some("1"), Value::Null))
            .await
            .unwrap();
        let v = reply_json(reply);
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"]["kind"], "bad_frame");
        assert_eq!(v["id"], "1");
    }

    #[tokio::test]
    async fn dispatch_replies_through_the_mailbox() {
        let ctx = context(false);
        let (conn, mut rx) = connection(1);

        let inline = route(
            &ctx,
            &conn,
            frame("dispatch", Some("7"), json!({"command": "echo", "args": {"x": 1}})),
        )
        .await;
        assert!(inline.is_none());

        let Message::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected text reply");
        };
        let v: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(v["event"], "dispatch");
        assert_eq!(v["id"], "7");
        assert_eq!(v["status"], "ok");
        // echo is a bare key, classified as a mutation: payload passes through
        assert_eq!(v["data"]["x"], 1);
    }

    #[tokio::test]
    async fn dispatch_without_command_is_a_bad_frame() {
        let ctx = context(false);
        let (conn, _rx) = connection(1);
        let reply = route(&ctx, &conn, frame("dispatch", Some("1"), json!({})))
            .await
            .unwrap();
        assert_eq!(reply_json(reply)["error"]["kind"], "bad_frame");
    }

    #[tokio::test]
    async fn get_schema_roundtrip_and_unknown_model() {
        let ctx = context(false);
        let (conn, _rx) = connection(1);

        let ok = route(
            &ctx,
            &conn,
            frame("get_schema", Some("1"), json!({"model": "users"})),
        )
        .await
        .unwrap();
        let v = reply_json(ok);
        assert_eq!(v["status"], "ok");
        assert_eq!(v["data"]["schema"]["fields"][0], "id");

        let missing = route(
            &ctx,
            &conn,
            frame("get_schema", Some("2"), json!({"model": "ghost"})),
        )
        .await
        .unwrap();
        assert_eq!(reply_json(missing)["error"]["kind"], "command");
    }

    #[tokio::test]
    async fn discover_and_introspect() {
        let ctx = context(false);
        let (conn, _rx) = connection(1);

        let discover = route(&ctx, &conn, frame("discover", None, Value::Null))
            .await
            .unwrap();
        let v = reply_json(discover);
        assert_eq!(v["data"]["models"][0]["name"], "users");

        let introspect = route(
            &ctx,
            &conn,
            frame("introspect", None, json!({"model": "users"})),
        )
        .await
        .unwrap();
        let v = reply_json(introspect);
        assert_eq!(v["data"]["operations"][0], "list");
    }

    #[tokio::test]
    async fn cache_stats_include_connection_count() {
        let ctx = context(false);
        let (conn, _rx) = connection(1);
        ctx.clients.add(conn.clone());

        let reply = route(&ctx, &conn, frame("cache_stats", Some("s"), Value::Null))
            .await
            .unwrap();
        let v = reply_json(reply);
        assert_eq!(v["data"]["connections"], 1);
        assert_eq!(v["data"]["default_ttl_seconds"], 60);
    }

    #[tokio::test]
    async fn clear_cache_validates_its_kind() {
        let ctx = context(false);
        let (conn, _rx) = connection(1);
        ctx.cache.put_query("k", "users", json!(1), 0);

        let reply = route(
            &ctx,
            &conn,
            frame("clear_cache", None, json!({"kind": "queries"})),
        )
        .await
        .unwrap();
        assert_eq!(reply_json(reply)["status"], "ok");
        assert_eq!(ctx.cache.stats().query_size, 0);

        let bad = route(
            &ctx,
            &conn,
            frame("clear_cache", None, json!({"kind": "everything"})),
        )
        .await
        .unwrap();
        assert_eq!(reply_json(bad)["error"]["kind"], "bad_frame");
    }

    #[tokio::test]
    async fn set_ttl_updates_the_default() {
        let ctx = context(false);
        let (conn, _rx) = connection(1);

        let reply = route(
            &ctx,
            &conn,
            frame("set_query_cache_ttl", None, json!({"seconds": 120})),
        )
        .await
        .unwrap();
        assert_eq!(reply_json(reply)["status"], "ok");
        assert_eq!(ctx.cache.stats().default_ttl_seconds, 120);

        let bad = route(
            &ctx,
            &conn,
            frame("set_query_cache_ttl", None, json!({"seconds": 0})),
        )
        .await
        .unwrap();
        assert_eq!(reply_json(bad)["error"]["kind"], "bad_frame");
    }

    #[tokio::test]
    async fn client_broadcast_is_off_by_default() {
        let ctx = context(false);
        let (conn, _rx) = connection(1);
        let reply = route(&ctx, &conn, frame("broadcast", Some("b"), json!({"hi": 1})))
            .await
            .unwrap();
        assert_eq!(reply_json(reply)["error"]["kind"], "policy");
    }

    #[tokio::test]
    async fn client_broadcast_reaches_other_peers_when_enabled() {
        let ctx = context(true);
        let (sender, _sender_rx) = connection(1);
        let (peer, mut peer_rx) = connection(2);
        ctx.clients.add(sender.clone());
        ctx.clients.add(peer.clone());

        let reply = route(
            &ctx,
            &sender,
            frame("broadcast", Some("b"), json!({"note": "hello"})),
        )
        .await
        .unwrap();
        let v = reply_json(reply);
        assert_eq!(v["status"], "ok");
        assert_eq!(v["data"]["delivered"], 1);

        let Message::Text(text) = peer_rx.recv().await.unwrap() else {
            panic!("expected relayed frame");
        };
        let relayed: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(relayed["event"], "broadcast");
        assert_eq!(relayed["data"]["note"], "hello");
    }

    #[tokio::test]
    async fn input_response_with_unknown_id_is_dropped_silently() {
        let ctx = context(false);
        let (conn, _rx) = connection(1);
        let reply = route(
            &ctx,
            &conn,
            frame("input_response", Some("p404"), json!({"value": "x"})),
        )
        .await;
        assert!(reply.is_none());
    }
}
