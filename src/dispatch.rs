//! Adapter between wire `dispatch` events and the external command layer.
//!
//! The adapter owns the caching contract around the dispatcher: read-only
//! commands consult the query cache first and store their results under a
//! fingerprint on success; mutating commands are never cached and invalidate
//! the affected model's query entries when they succeed (all entries when
//! the model is unknown, the documented fallback). Dispatcher failures are
//! folded into the error taxonomy, with prompt cancellation and timeouts
//! surfaced under their own kinds.
//!
//! Offloading is the caller's side of the contract: the bridge runs
//! [`DispatchAdapter::execute`] on a spawned worker task so the connection's
//! read loop keeps consuming frames (and can deliver `input_response`) while
//! a command is in flight.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::auth::AuthInfo;
use crate::backend::{CommandKind, Dispatcher};
use crate::cache::BridgeCache;
use crate::error::BridgeError;
use crate::fingerprint::fingerprint;
use crate::prompt::{ConnectionHandle, PromptError};

/// Side effect of a successfully executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEffect {
    /// Read-only command; nothing to invalidate or announce.
    None,
    /// A mutation succeeded; peers should hear `data_updated` for `model`.
    Mutated { model: Option<String> },
}

/// Successful outcome of one dispatch.
#[derive(Debug, Clone)]
pub struct Executed {
    pub data: Value,
    pub cached: bool,
    pub effect: DispatchEffect,
}

/// Call boundary from the bridge into the command layer.
pub struct DispatchAdapter {
    dispatcher: Arc<dyn Dispatcher>,
    cache: Arc<BridgeCache>,
    ttl_overrides: HashMap<String, u64>,
}

impl DispatchAdapter {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        cache: Arc<BridgeCache>,
        ttl_overrides: HashMap<String, u64>,
    ) -> Self {
        Self {
            dispatcher,
            cache,
            ttl_overrides,
        }
    }

    /// Executes one command on behalf of `handle`'s client.
    ///
    /// May suspend for as long as the dispatcher does, including nested
    /// input prompts; run it on a worker, never on the read loop.
    pub async fn execute(
        &self,
        command: &str,
        args: Value,
        auth: &AuthInfo,
        handle: ConnectionHandle,
    ) -> Result<Executed, BridgeError> {
        let kind = self.dispatcher.classify(command);

        let cache_key = match &kind {
            CommandKind::ReadOnly { model } => {
                let key = fingerprint(command, model.as_deref().unwrap_or(""), &args);
                if let Some(data) = self.cache.get_query(&key) {
                    debug!(command, "dispatch served from query cache");
                    return Ok(Executed {
                        data,
                        cached: true,
                        effect: DispatchEffect::None,
                    });
                }
                Some(key)
            }
            CommandKind::Mutating { .. } => None,
        };

        let data = self
            .dispatcher
            .dispatch(command, args, auth, handle)
            .await
            .map_err(map_dispatch_error)?;

        let effect = match kind {
            CommandKind::ReadOnly { model } => {
                let ttl = self
                    .ttl_overrides
                    .get(command)
                    .map(|secs| *secs as i64)
                    .unwrap_or(0);
                if let Some(key) = cache_key {
                    self.cache
                        .put_query(&key, model.as_deref().unwrap_or(""), data.clone(), ttl);
                }
                DispatchEffect::None
            }
            CommandKind::Mutating { model } => {
                self.cache.invalidate_model(model.as_deref());
                DispatchEffect::Mutated { model }
            }
        };

        Ok(Executed {
            data,
            cached: false,
            effect,
        })
    }
}

/// Folds dispatcher failures into the wire taxonomy. Prompt cancellation and
/// timeouts keep their own kinds so clients can tell them from backend
/// failures.
fn map_dispatch_error(err: anyhow::Error) -> BridgeError {
    match err.downcast_ref::<PromptError>() {
        Some(PromptError::Cancelled) => BridgeError::Cancelled,
        Some(PromptError::Timeout) => BridgeError::Timeout,
        Some(PromptError::AlreadyPending) | None => BridgeError::Command(err.to_string()),
    }
}
