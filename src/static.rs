//! Static file companion server.
//!
//! An independent HTTP server that serves files from a configured root on
//! its own port, intended to run alongside the bridge and share only its
//! shutdown discipline. Directory listings are disabled (directories answer
//! 403, except `/` which serves `index.html` when present), paths are
//! canonicalized so nothing escapes the root, MIME types come from the file
//! extension, and responses carry `Cache-Control: no-store`. CORS is either
//! wide open for local development or off entirely, per configuration.
//!
//! # Examples
//!
//! ```rust,no_run
//! use hashi::config::HttpConfig;
//! use hashi::r#static::StaticServer;
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HttpConfig {
//!     enabled: true,
//!     root: Some(PathBuf::from("./public")),
//!     ..HttpConfig::default()
//! };
//! let server = StaticServer::start(&config).await?;
//! println!("serving on {}", server.local_addr());
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, StatusCode};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::fs;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::{CorsMode, HttpConfig};
use crate::error::BridgeError;
use crate::shutdown::ShutdownController;

/// Bound on how long `stop` waits for in-flight handlers.
const STOP_DEADLINE: Duration = Duration::from_secs(5);

type StaticResponse = hyper::Response<Full<Bytes>>;

/// Handle to a running static file server.
#[derive(Debug)]
pub struct StaticServer {
    addr: SocketAddr,
    shutdown: Arc<ShutdownController>,
}

impl StaticServer {
    /// Binds the configured address and starts serving on a background
    /// task. A port conflict is a fatal startup error; no alternative port
    /// is tried.
    pub async fn start(config: &HttpConfig) -> Result<StaticServer, BridgeError> {
        let root = config
            .root
            .clone()
            .ok_or_else(|| BridgeError::Config("http.root is not configured".into()))?;
        let root = root
            .canonicalize()
            .map_err(|e| BridgeError::Config(format!("http.root {root:?}: {e}")))?;

        let bind = config.bind_addr();
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|source| BridgeError::Bind { addr: bind, source })?;
        let addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Internal(format!("listener has no local address: {e}")))?;

        let shutdown = Arc::new(ShutdownController::new());
        let cors = config.cors;
        info!(%addr, root = %root.display(), "static file server listening");

        let controller = shutdown.clone();
        tokio::spawn(async move {
            let mut accept_guard = controller.subscribe();
            loop {
                tokio::select! {
                    _ = accept_guard.recv() => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                warn!(%err, "static accept failed");
                                continue;
                            }
                        };
                        let root = root.clone();
                        let guard = controller.subscribe();
                        tokio::spawn(async move {
                            let _guard = guard;
                            let io = TokioIo::new(stream);
                            let svc = service_fn(move |req| {
                                let root = root.clone();
                                async move {
                                    Ok::<_, Infallible>(handle_request(&root, cors, &req).await)
                                }
                            });
                            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await
                            {
                                debug!(%peer, %err, "static connection error");
                            }
                        });
                    }
                }
            }
        });

        Ok(StaticServer { addr, shutdown })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Closes the listener and waits for in-flight handlers, bounded by a
    /// few seconds. Idempotent.
    pub async fn stop(&self) -> bool {
        self.shutdown.shutdown(STOP_DEADLINE).await
    }
}

/// How a request path maps onto the filesystem.
#[derive(Debug, PartialEq, Eq)]
enum Resolved {
    File(PathBuf),
    Forbidden,
    NotFound,
}

/// Resolves a request path against the canonicalized root. Anything that
/// escapes the root is forbidden; directories are forbidden too (listings
/// are off), except the root itself which falls through to `index.html`.
fn resolve_path(root: &Path, request_path: &str) -> Resolved {
    let relative = request_path.trim_start_matches('/');
    let joined = root.join(relative);

    let Ok(canonical) = joined.canonicalize() else {
        return Resolved::NotFound;
    };
    if !canonical.starts_with(root) {
        return Resolved::Forbidden;
    }
    if canonical.is_dir() {
        if relative.is_empty() {
            let index = canonical.join("index.html");
            if index.is_file() {
                return Resolved::File(index);
            }
        }
        return Resolved::Forbidden;
    }
    Resolved::File(canonical)
}

/// Serves one request. Infallible by construction; I/O failures map to 500.
async fn handle_request<B>(
    root: &Path,
    cors: CorsMode,
    req: &http::Request<B>,
) -> StaticResponse {
    if req.method() == Method::OPTIONS {
        return with_cors(cors, status_response(StatusCode::NO_CONTENT, ""));
    }
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return with_cors(cors, status_response(StatusCode::METHOD_NOT_ALLOWED, ""));
    }

    let response = match resolve_path(root, req.uri().path()) {
        Resolved::Forbidden => status_response(StatusCode::FORBIDDEN, "forbidden"),
        Resolved::NotFound => status_response(StatusCode::NOT_FOUND, "not found"),
        Resolved::File(path) => match fs::read(&path).await {
            Ok(contents) => {
                let mime = mime_guess::from_path(&path).first_or_octet_stream();
                let body = if req.method() == Method::HEAD {
                    Bytes::new()
                } else {
                    Bytes::from(contents)
                };
                hyper::Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, mime.to_string())
                    .header(header::CACHE_CONTROL, "no-store")
                    .body(Full::new(body))
                    .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR, ""))
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "file read failed");
                status_response(StatusCode::INTERNAL_SERVER_ERROR, "read error")
            }
        },
    };

    with_cors(cors, response)
}

fn status_response(status: StatusCode, body: &'static str) -> StaticResponse {
    let mut response = hyper::Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Adds the permissive development CORS headers when the policy is open.
fn with_cors(cors: CorsMode, mut response: StaticResponse) -> StaticResponse {
    if cors == CorsMode::Open {
        let headers = response.headers_mut();
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            header::HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            header::HeaderValue::from_static("GET,HEAD,OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            header::HeaderValue::from_static("*"),
        );
    }
    response
}
