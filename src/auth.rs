//! Connection gatekeeping: origin validation and token authentication.
//!
//! The gate runs once per connection, between the WebSocket handshake and the
//! first application frame. Origin checking is an exact-match allow-list
//! (empty list accepts any origin, the local-development default). Tokens are
//! extracted from the connect URL's `token` query parameter first, then from
//! an `Authorization: Bearer` header, and validated against the pluggable
//! credential store. The resulting [`AuthInfo`] is immutable for the
//! connection lifetime.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::backend::CredentialStore;
use crate::config::BridgeConfig;
use crate::error::BridgeError;

/// Where a connection's token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    None,
    Query,
    Bearer,
}

/// A token pulled out of the handshake, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedToken {
    pub value: String,
    pub kind: TokenKind,
}

/// Authenticated identity attached to a connection at handshake time.
#[derive(Debug, Clone, Serialize)]
pub struct AuthInfo {
    pub identity: String,
    pub role: String,
    pub token_kind: TokenKind,
}

impl AuthInfo {
    /// The identity assigned when no token is supplied and auth is optional.
    pub fn anonymous() -> AuthInfo {
        AuthInfo {
            identity: "anonymous".to_string(),
            role: "guest".to_string(),
            token_kind: TokenKind::None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.token_kind == TokenKind::None
    }
}

/// Raw material captured from the WebSocket handshake request.
#[derive(Debug, Clone, Default)]
pub struct HandshakeInfo {
    pub origin: Option<String>,
    pub query: Option<String>,
    pub authorization: Option<String>,
}

/// Decides whether a freshly-connected socket may proceed, and with which
/// identity.
pub struct AuthGate {
    allowed_origins: Vec<String>,
    require_auth: bool,
    credentials: Arc<dyn CredentialStore>,
}

impl AuthGate {
    pub fn new(cfg: &BridgeConfig, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            allowed_origins: cfg.allowed_origins.clone(),
            require_auth: cfg.require_auth,
            credentials,
        }
    }

    /// Exact-match origin check. An empty allow-list accepts everything,
    /// including connections that sent no `Origin` header at all.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.iter().any(|allowed| allowed == origin),
            None => false,
        }
    }

    /// Pulls a token out of the handshake. The `token` query parameter wins
    /// over the bearer header; the first source found is the only one used.
    pub fn extract_token(
        query: Option<&str>,
        authorization: Option<&str>,
    ) -> Option<ExtractedToken> {
        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                if key == "token" && !value.is_empty() {
                    return Some(ExtractedToken {
                        value: value.into_owned(),
                        kind: TokenKind::Query,
                    });
                }
            }
        }

        authorization
            .and_then(|header| header.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| ExtractedToken {
                value: token.to_string(),
                kind: TokenKind::Bearer,
            })
    }

    /// Runs the full gate: origin, then token. Policy failures close the
    /// connection with 1008 before any application frame is sent.
    pub async fn authenticate(&self, handshake: &HandshakeInfo) -> Result<AuthInfo, BridgeError> {
        if !self.origin_allowed(handshake.origin.as_deref()) {
            return Err(BridgeError::Policy(format!(
                "origin {:?} is not allowed",
                handshake.origin.as_deref().unwrap_or("<none>")
            )));
        }

        let token = Self::extract_token(
            handshake.query.as_deref(),
            handshake.authorization.as_deref(),
        );

        match token {
            None if self.require_auth => {
                Err(BridgeError::Policy("authentication required".into()))
            }
            None => Ok(AuthInfo::anonymous()),
            // A supplied token is always validated, even when auth is optional.
            Some(token) => match self.credentials.validate_token(&token.value).await {
                Some(identity) => {
                    debug!(identity = %identity.identity, role = %identity.role, "token accepted");
                    Ok(AuthInfo {
                        identity: identity.identity,
                        role: identity.role,
                        token_kind: token.kind,
                    })
                }
                None => Err(BridgeError::Policy("invalid token".into())),
            },
        }
    }
}
