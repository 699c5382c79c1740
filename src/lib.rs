//! A real-time WebSocket bridge core for declarative CLI/UI frontends.
//!
//! Hashi routes typed JSON events between browser/terminal clients and a
//! pluggable backend command layer. It owns the hard parts of that job:
//! connection lifecycle with origin and token gating, a two-tier cache
//! (permanent schemas plus TTL-bounded query results) shared by concurrent
//! connections, command dispatch offloaded to workers so the event loop
//! never stalls, a cooperative input-prompt protocol that lets the server
//! ask a specific client for a value mid-operation, and a static-file HTTP
//! companion for serving frontend assets.
//!
//! # High-level features
//! - Typed wire envelope with an explicit event routing table
//! - Origin allow-list and bearer/query token authentication
//! - Single-flight schema cache and TTL query cache with fingerprint keys
//! - Worker-offloaded dispatch with automatic cache fill and invalidation
//! - Server-initiated input prompts correlated by request id
//! - Broadcast with snapshot-under-lock delivery and slow-peer protection
//! - Graceful, idempotent, deadline-bounded shutdown
//! - Companion static file server with traversal guards and dev CORS
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - WebSocket: `tokio-tungstenite`
//! - HTTP companion: `hyper` 1.x
//!
//! # Quickstart
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
//!
//! # Key concepts
//! - [bridge::Bridge] owns the listener, clients set and shutdown barrier.
//! - [handler::EventTable] maps event tags to handler capabilities.
//! - [backend] defines the collaborator seams hosts implement.
//! - [cache::BridgeCache] serves schemas and query results.
//! - [prompt::ConnectionHandle] lets a command prompt its own client.

/// Origin validation and token authentication at the connection gate.
pub mod auth;

/// Collaborator seams: credential store, dispatcher, schema and session
/// providers.
pub mod backend;

/// The WebSocket bridge server and its builder.
pub mod bridge;

/// Two-tier schema/query cache with single-flight loading.
pub mod cache;

/// Layered configuration resolution.
pub mod config;

/// Per-connection state, mailboxes and the clients registry.
pub mod connection;

/// Adapter from wire dispatch events into the command layer.
pub mod dispatch;

/// Error taxonomy shared across the crate.
pub mod error;

/// Deterministic cache-key fingerprints.
pub mod fingerprint;

/// Event routing table and per-event handlers.
pub mod handler;

/// Server/connection info assembly for `info`, `discover`, `introspect`.
pub mod info;

/// Input-prompt correlation between server requests and client replies.
pub mod prompt;

/// Wire protocol envelope and reply construction.
pub mod protocol;

/// Graceful shutdown controller and per-task guards.
pub mod shutdown;

/// Static file companion server.
pub mod r#static;

/// Structured logging bootstrap.
pub mod tracing;

pub use bridge::{Bridge, BridgeBuilder};
pub use config::Config;
pub use error::BridgeError;
