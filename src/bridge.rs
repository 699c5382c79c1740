//! The bridge server: listener, per-connection lifecycle, broadcast, and
//! graceful shutdown.
//!
//! Each accepted socket runs the same pipeline: WebSocket handshake with
//! origin/token capture, the auth gate, registration in the clients set, an
//! `info` frame, then the read loop feeding frames into the event table.
//! Every connection gets two tasks: the read loop and a writer draining the
//! bounded mailbox, so one slow peer never blocks another and broadcasts
//! never block the broadcaster.
//!
//! # Examples
//!
//! ```rust,no_run
//! use hashi::bridge::Bridge;
//! use hashi::config::Config;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::resolve(None, None, None)?;
//! let bridge = Arc::new(Bridge::builder(config).build());
//! let listener = bridge.bind().await?;
//! bridge.run(listener).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::auth::{AuthGate, HandshakeInfo};
use crate::backend::{
    CredentialStore, Dispatcher, EchoDispatcher, EmptySchemaProvider, NullCredentialStore,
    SchemaProvider, SessionProvider, StaticSessionProvider,
};
use crate::cache::BridgeCache;
use crate::config::Config;
use crate::connection::{ClientRegistry, ConnState, Connection, Outbox, SendOutcome};
use crate::dispatch::DispatchAdapter;
use crate::error::BridgeError;
use crate::handler::{EventContext, EventTable};
use crate::info::InfoProvider;
use crate::prompt::PromptRouter;
use crate::protocol::{events, server_frame, Frame, Reply};
use crate::shutdown::{Shutdown, ShutdownController};

/// Configures a [`Bridge`] with its collaborator seams.
///
/// Unset collaborators fall back to the stand-ins from [`crate::backend`],
/// which is enough for smoke tests and local development.
pub struct BridgeBuilder {
    config: Config,
    dispatcher: Arc<dyn Dispatcher>,
    credentials: Arc<dyn CredentialStore>,
    schemas: Arc<dyn SchemaProvider>,
    sessions: Arc<dyn SessionProvider>,
}

impl BridgeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            dispatcher: Arc::new(EchoDispatcher),
            credentials: Arc::new(NullCredentialStore),
            schemas: Arc::new(EmptySchemaProvider),
            sessions: Arc::new(StaticSessionProvider),
        }
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn schemas(mut self, schemas: Arc<dyn SchemaProvider>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn sessions(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.sessions = sessions;
        self
    }

    /// Builds the bridge and wires the event table, cache, prompt router and
    /// auth gate together.
    pub fn build(self) -> Bridge {
        let config = Arc::new(self.config);
        let cache = Arc::new(BridgeCache::new(config.bridge.default_query_ttl_seconds));
        let ttl_overrides: HashMap<String, u64> = config.bridge.ttl_overrides.clone();

        let gate = AuthGate::new(&config.bridge, self.credentials);
        let ctx = EventContext {
            config: config.clone(),
            cache: cache.clone(),
            prompts: Arc::new(PromptRouter::new()),
            dispatch: Arc::new(DispatchAdapter::new(self.dispatcher, cache.clone(), ttl_overrides)),
            info: Arc::new(InfoProvider::new(
                self.schemas,
                self.sessions,
                cache,
                &config.bridge,
            )),
            clients: ClientRegistry::new(),
            cancel: tokio_util::sync::CancellationToken::new(),
        };

        Bridge {
            ctx,
            table: EventTable::standard(),
            gate,
            shutdown: ShutdownController::new(),
            next_conn_id: AtomicU64::new(0),
        }
    }
}

/// The WebSocket bridge server.
pub struct Bridge {
    ctx: EventContext,
    table: EventTable,
    gate: AuthGate,
    shutdown: ShutdownController,
    next_conn_id: AtomicU64,
}

impl Bridge {
    pub fn builder(config: Config) -> BridgeBuilder {
        BridgeBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn cache(&self) -> &Arc<BridgeCache> {
        &self.ctx.cache
    }

    pub fn prompts(&self) -> &Arc<PromptRouter> {
        &self.ctx.prompts
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.ctx.clients
    }

    /// Binds the configured listener. A port conflict is fatal; the bridge
    /// never silently picks another port.
    pub async fn bind(&self) -> Result<TcpListener, BridgeError> {
        let addr = self.ctx.config.bridge.bind_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })
    }

    /// Accept loop. Returns cleanly when shutdown is triggered; an accept
    /// failure is a per-process error and bubbles up to the host.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), BridgeError> {
        let local = listener
            .local_addr()
            .map_err(|e| BridgeError::Internal(format!("listener has no local address: {e}")))?;
        info!(addr = %local, "bridge listening");

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted.map_err(|e| {
                        BridgeError::Internal(format!("accept loop failed: {e}"))
                    })?;
                    let bridge = self.clone();
                    let guard = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        bridge.serve_connection(stream, addr, guard).await;
                    });
                }
            }
        }
        info!("bridge stopped accepting connections");
        Ok(())
    }

    /// Triggers graceful shutdown: stop accepting, close every connection
    /// with a going-away frame, and wait for tasks to drain within the
    /// configured deadline. Idempotent; returns `true` when everything
    /// drained in time.
    pub async fn shutdown(&self) -> bool {
        // Abort dispatch workers first so slow backends cannot hold the
        // drain past the deadline.
        self.ctx.cancel.cancel();
        self.shutdown
            .shutdown(self.ctx.config.bridge.shutdown_deadline())
            .await
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Full lifecycle of one socket, handshake to drain.
    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown: Shutdown,
    ) {
        let mut handshake = HandshakeInfo::default();
        let callback = |request: &Request, response: Response| {
            handshake.origin = request
                .headers()
                .get("origin")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            handshake.authorization = request
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            handshake.query = request.uri().query().map(str::to_string);
            Ok(response)
        };

        let mut ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(err) => {
                debug!(%addr, %err, "websocket handshake failed");
                return;
            }
        };

        let auth = match self.gate.authenticate(&handshake).await {
            Ok(auth) => auth,
            Err(err) => {
                warn!(%addr, %err, "connection rejected by policy");
                let _ = ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Policy,
                        reason: err.to_string().into(),
                    }))
                    .await;
                return;
            }
        };

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (mailbox_tx, mut mailbox_rx) =
            mpsc::channel::<Message>(self.ctx.config.bridge.mailbox_capacity);
        let conn = Arc::new(Connection::new(id, addr, auth, Outbox::new(id, mailbox_tx)));
        conn.set_state(ConnState::Authed);

        let (mut sink, mut ws_stream) = ws.split();

        // Writer task: sole owner of the sink. Frames leave in mailbox order,
        // and a close frame is always the last thing written.
        let writer = tokio::spawn(async move {
            while let Some(message) = mailbox_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() {
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.ctx.clients.add(conn.clone());
        info!(conn = id, %addr, identity = %conn.auth.identity, "client connected");

        let info_payload = self
            .ctx
            .info
            .server_info(&conn.auth, self.ctx.clients.len())
            .await;
        conn.outbox
            .send_text(server_frame(events::INFO, None, info_payload));
        conn.set_state(ConnState::Active);

        let close_frame = self.read_loop(&conn, &mut ws_stream, &mut shutdown).await;

        conn.set_state(ConnState::Closing);
        self.ctx.clients.remove(id);
        self.ctx.prompts.cancel_connection(id);

        // The close frame terminates the writer after the mailbox drains. If
        // it cannot even be enqueued the peer is wedged; force the socket
        // shut instead of waiting on a full mailbox.
        if conn.outbox.send(Message::Close(Some(close_frame))) != SendOutcome::Sent {
            writer.abort();
        }
        let _ = writer.await;
        conn.set_state(ConnState::Closed);
        info!(conn = id, %addr, "client disconnected");
    }

    /// Consumes frames until the connection ends one way or another, and
    /// says how to close the socket.
    async fn read_loop(
        &self,
        conn: &Arc<Connection>,
        stream: &mut SplitStream<WebSocketStream<TcpStream>>,
        shutdown: &mut Shutdown,
    ) -> CloseFrame {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    return CloseFrame {
                        code: CloseCode::Away,
                        reason: "server shutting down".into(),
                    };
                }
                _ = conn.outbox.condemned().cancelled() => {
                    warn!(conn = conn.id, "closing slow consumer");
                    return CloseFrame {
                        code: CloseCode::Error,
                        reason: "send queue overflow".into(),
                    };
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => match Frame::parse(text.as_str()) {
                        Ok(frame) => {
                            if let Some(reply) = self.table.route(frame, &self.ctx, conn).await {
                                conn.outbox.send_text(reply.to_json());
                            }
                        }
                        Err(err) => {
                            conn.outbox
                                .send_text(Reply::error("error", None, &err).to_json());
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        let err = BridgeError::BadFrame(
                            "binary frames are not supported".into(),
                        );
                        conn.outbox
                            .send_text(Reply::error("error", None, &err).to_json());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        conn.outbox.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        return CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                    }
                    Some(Err(err)) => {
                        debug!(conn = conn.id, %err, "read error");
                        return CloseFrame {
                            code: CloseCode::Protocol,
                            reason: "read error".into(),
                        };
                    }
                    None => {
                        return CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_uses_stand_in_collaborators() {
        let bridge = Bridge::builder(Config::default()).build();
        assert!(bridge.clients().is_empty());
        assert_eq!(bridge.cache().stats().default_ttl_seconds, 60);
        assert!(!bridge.is_shutdown());
    }

    #[tokio::test]
    async fn bind_error_is_fatal_and_reports_the_address() {
        let mut config = Config::default();
        config.bridge.port = 0;
        let first = Bridge::builder(config).build();
        let listener = first.bind().await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = Config::default();
        config.bridge.port = port;
        let second = Bridge::builder(config).build();
        let err = second.bind().await.unwrap_err();
        assert_eq!(err.kind(), "bind");
        assert!(err.is_fatal());
    }
}
