//! Collaborator seams consumed by the bridge core.
//!
//! The bridge never imports concrete backends. Each external subsystem is
//! reached through one narrow trait defined here: credential validation,
//! command dispatch, schema discovery, and session snapshots. Hosts embed
//! the bridge by implementing these and handing them to the builder; the
//! stand-in implementations at the bottom keep the binary and tests running
//! without a real backend.
//!
//! # Examples
//!
//! ```rust
//! use hashi::backend::{Dispatcher, CommandKind};
//! use hashi::auth::AuthInfo;
//! use hashi::prompt::ConnectionHandle;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//!
//! struct Uppercase;
//!
//! #[async_trait]
//! impl Dispatcher for Uppercase {
//!     async fn dispatch(
//!         &self,
//!         command: &str,
//!         args: Value,
//!         _auth: &AuthInfo,
//!         _conn: ConnectionHandle,
//!     ) -> anyhow::Result<Value> {
//!         let text = args["text"].as_str().unwrap_or_default();
//!         Ok(json!({ "command": command, "text": text.to_uppercase() }))
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::auth::AuthInfo;
use crate::prompt::ConnectionHandle;

/// Identity returned by the credential store for a valid token.
#[derive(Debug, Clone)]
pub struct Identity {
    pub identity: String,
    pub role: String,
}

/// Validates bearer/query tokens presented at handshake time.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Returns the identity behind `token`, or `None` when the token is
    /// unknown, expired, or malformed.
    async fn validate_token(&self, token: &str) -> Option<Identity>;
}

/// How the adapter treats a command: read-only results are cacheable,
/// mutations invalidate instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    ReadOnly { model: Option<String> },
    Mutating { model: Option<String> },
}

impl CommandKind {
    pub fn model(&self) -> Option<&str> {
        match self {
            CommandKind::ReadOnly { model } | CommandKind::Mutating { model } => model.as_deref(),
        }
    }
}

/// Verbs classified as read-only by the default `model.verb` convention.
const READ_VERBS: &[&str] = &[
    "get", "list", "find", "lookup", "introspect", "discover", "describe", "count",
];

/// Default classification for `model.verb`-shaped command keys.
///
/// A bare key without a dot is classified by the whole key as the verb, with
/// no model; anything not in the read-verb set is treated as a mutation.
pub fn classify_command(command: &str) -> CommandKind {
    let (model, verb) = match command.rsplit_once('.') {
        Some((model, verb)) => (Some(model.to_string()), verb),
        None => (None, command),
    };
    if READ_VERBS.contains(&verb) {
        CommandKind::ReadOnly { model }
    } else {
        CommandKind::Mutating { model }
    }
}

/// Executes named backend commands on behalf of clients.
///
/// Dispatch may block on I/O; the bridge always runs it on a worker task so
/// the calling connection keeps reading frames. The `conn` capability lets a
/// command prompt its own client for input mid-operation.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        command: &str,
        args: Value,
        auth: &AuthInfo,
        conn: ConnectionHandle,
    ) -> anyhow::Result<Value>;

    /// Classifies a command for caching and invalidation. The default
    /// follows the `model.verb` convention.
    fn classify(&self, command: &str) -> CommandKind {
        classify_command(command)
    }
}

/// One discoverable model and the operations it supports.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub operations: Vec<String>,
}

/// Exposes the declarative schema layer to discovery and introspection.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>>;
    async fn introspect_model(&self, name: &str) -> anyhow::Result<Option<Value>>;
}

/// Produces the minimal session snapshot included in `info` frames.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn snapshot(&self) -> Value;
}

/// Credential store that knows no tokens. Every supplied token is invalid;
/// useful together with `require_auth = false` for local development.
pub struct NullCredentialStore;

#[async_trait]
impl CredentialStore for NullCredentialStore {
    async fn validate_token(&self, _token: &str) -> Option<Identity> {
        None
    }
}

/// Schema provider with no models.
pub struct EmptySchemaProvider;

#[async_trait]
impl SchemaProvider for EmptySchemaProvider {
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }

    async fn introspect_model(&self, _name: &str) -> anyhow::Result<Option<Value>> {
        Ok(None)
    }
}

/// Session provider that reports the connection role and nothing else.
pub struct StaticSessionProvider;

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn snapshot(&self) -> Value {
        json!({ "mode": "standalone" })
    }
}

/// Minimal dispatcher for smoke-testing a bridge without a backend: `echo`
/// returns its arguments, `ping` returns `"pong"`, everything else fails.
pub struct EchoDispatcher;

#[async_trait]
impl Dispatcher for EchoDispatcher {
    async fn dispatch(
        &self,
        command: &str,
        args: Value,
        _auth: &AuthInfo,
        _conn: ConnectionHandle,
    ) -> anyhow::Result<Value> {
        match command {
            "echo" => Ok(args),
            "ping" => Ok(json!("pong")),
            other => anyhow::bail!("unknown command: {other}"),
        }
    }
}
