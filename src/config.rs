//! Layered configuration resolution for the bridge host process.
//!
//! Values merge from five sources, lowest to highest precedence: built-in
//! defaults, the machine-scoped TOML file, the environment-scoped TOML file,
//! process environment variables (`HASHI_BRIDGE_*` / `HASHI_HTTP_*`), and a
//! runtime override layer supplied at construction. The resolved [`Config`]
//! is immutable after startup; a config whose required-for-mode fields are
//! missing fails fast with a descriptive error.
//!
//! # Examples
//!
//! ```rust,no_run
//! use hashi::config::Config;
//! use std::path::Path;
//!
//! let config = Config::resolve(
//!     Some(Path::new("/etc/hashi/config.toml")),
//!     Some(Path::new("./hashi.toml")),
//!     None,
//! )
//! .expect("invalid configuration");
//! println!("bridge on {}:{}", config.bridge.host, config.bridge.port);
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::BridgeError;

/// CORS policy of the static file companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorsMode {
    /// Permissive headers suitable for local development (the default).
    #[default]
    Open,
    /// No CORS headers at all.
    Off,
}

impl CorsMode {
    fn parse(s: &str) -> Result<CorsMode, BridgeError> {
        match s {
            "open" => Ok(CorsMode::Open),
            "off" => Ok(CorsMode::Off),
            other => Err(BridgeError::Config(format!(
                "http.cors must be \"open\" or \"off\", got {other:?}"
            ))),
        }
    }
}

/// Bridge listener settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub require_auth: bool,
    /// Exact-match origin allow-list; empty accepts any origin.
    pub allowed_origins: Vec<String>,
    pub default_query_ttl_seconds: u64,
    pub mailbox_capacity: usize,
    pub shutdown_deadline_seconds: u64,
    pub allow_client_broadcast: bool,
    /// Per-command TTL overrides in seconds, keyed by command key.
    pub ttl_overrides: HashMap<String, u64>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            require_auth: false,
            allowed_origins: Vec::new(),
            default_query_ttl_seconds: 60,
            mailbox_capacity: 64,
            shutdown_deadline_seconds: 5,
            allow_client_broadcast: false,
            ttl_overrides: HashMap::new(),
        }
    }
}

impl BridgeConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_seconds)
    }
}

/// Static file companion settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub root: Option<PathBuf>,
    pub cors: CorsMode,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8788,
            root: None,
            cors: CorsMode::Open,
        }
    }
}

impl HttpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Fully resolved, validated configuration. Read-only after init.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub http: HttpConfig,
}

/// One partial configuration source. Every field is optional; set fields
/// override whatever lower-precedence layers produced.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigLayer {
    #[serde(default)]
    pub bridge: BridgeLayer,
    #[serde(default)]
    pub http: HttpLayer,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeLayer {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub require_auth: Option<bool>,
    pub allowed_origins: Option<Vec<String>>,
    pub default_query_ttl_seconds: Option<u64>,
    pub mailbox_capacity: Option<usize>,
    pub shutdown_deadline_seconds: Option<u64>,
    pub allow_client_broadcast: Option<bool>,
    pub ttl_overrides: Option<HashMap<String, u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpLayer {
    pub enabled: Option<bool>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub root: Option<PathBuf>,
    pub cors: Option<String>,
}

impl Config {
    /// Resolves the full layer stack. File paths that do not exist are
    /// skipped; files that exist but fail to parse are config errors.
    pub fn resolve(
        machine: Option<&Path>,
        environment: Option<&Path>,
        overrides: Option<ConfigLayer>,
    ) -> Result<Config, BridgeError> {
        let mut config = Config::default();

        for path in [machine, environment].into_iter().flatten() {
            if let Some(layer) = read_layer(path)? {
                config.apply(layer)?;
            }
        }
        config.apply(env_layer())?;
        if let Some(layer) = overrides {
            config.apply(layer)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, layer: ConfigLayer) -> Result<(), BridgeError> {
        let ConfigLayer { bridge, http } = layer;

        if let Some(host) = bridge.host {
            self.bridge.host = host;
        }
        if let Some(port) = bridge.port {
            self.bridge.port = port;
        }
        if let Some(require_auth) = bridge.require_auth {
            self.bridge.require_auth = require_auth;
        }
        if let Some(origins) = bridge.allowed_origins {
            self.bridge.allowed_origins = origins;
        }
        if let Some(ttl) = bridge.default_query_ttl_seconds {
            self.bridge.default_query_ttl_seconds = ttl;
        }
        if let Some(capacity) = bridge.mailbox_capacity {
            self.bridge.mailbox_capacity = capacity;
        }
        if let Some(deadline) = bridge.shutdown_deadline_seconds {
            self.bridge.shutdown_deadline_seconds = deadline;
        }
        if let Some(allow) = bridge.allow_client_broadcast {
            self.bridge.allow_client_broadcast = allow;
        }
        if let Some(overrides) = bridge.ttl_overrides {
            self.bridge.ttl_overrides = overrides;
        }

        if let Some(enabled) = http.enabled {
            self.http.enabled = enabled;
        }
        if let Some(host) = http.host {
            self.http.host = host;
        }
        if let Some(port) = http.port {
            self.http.port = port;
        }
        if let Some(root) = http.root {
            self.http.root = Some(root);
        }
        if let Some(cors) = http.cors {
            self.http.cors = CorsMode::parse(&cors)?;
        }

        Ok(())
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if self.bridge.mailbox_capacity == 0 {
            return Err(BridgeError::Config(
                "bridge.mailbox_capacity must be at least 1".into(),
            ));
        }
        if self.bridge.default_query_ttl_seconds == 0 {
            return Err(BridgeError::Config(
                "bridge.default_query_ttl_seconds must be at least 1".into(),
            ));
        }
        if self.http.enabled {
            let Some(root) = &self.http.root else {
                return Err(BridgeError::Config(
                    "http.enabled is set but http.root is missing".into(),
                ));
            };
            if !root.is_dir() {
                return Err(BridgeError::Config(format!(
                    "http.root {root:?} is not a directory"
                )));
            }
        }
        Ok(())
    }
}

fn read_layer(path: &Path) -> Result<Option<ConfigLayer>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("cannot read {path:?}: {e}")))?;
    let layer = toml::from_str(&raw)
        .map_err(|e| BridgeError::Config(format!("cannot parse {path:?}: {e}")))?;
    Ok(Some(layer))
}

/// Builds the environment-variable layer from the process environment.
fn env_layer() -> ConfigLayer {
    layer_from_lookup(|name| std::env::var(name).ok())
}

fn layer_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigLayer {
    let parse_bool = |v: String| matches!(v.as_str(), "1" | "true" | "yes" | "on");

    ConfigLayer {
        bridge: BridgeLayer {
            host: lookup("HASHI_BRIDGE_HOST"),
            port: lookup("HASHI_BRIDGE_PORT").and_then(|v| v.parse().ok()),
            require_auth: lookup("HASHI_BRIDGE_REQUIRE_AUTH").map(parse_bool),
            allowed_origins: lookup("HASHI_BRIDGE_ALLOWED_ORIGINS").map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            }),
            default_query_ttl_seconds: lookup("HASHI_BRIDGE_DEFAULT_QUERY_TTL_SECONDS")
                .and_then(|v| v.parse().ok()),
            mailbox_capacity: lookup("HASHI_BRIDGE_MAILBOX_CAPACITY")
                .and_then(|v| v.parse().ok()),
            shutdown_deadline_seconds: lookup("HASHI_BRIDGE_SHUTDOWN_DEADLINE_SECONDS")
                .and_then(|v| v.parse().ok()),
            allow_client_broadcast: lookup("HASHI_BRIDGE_ALLOW_CLIENT_BROADCAST").map(parse_bool),
            ttl_overrides: None,
        },
        http: HttpLayer {
            enabled: lookup("HASHI_HTTP_ENABLED").map(parse_bool),
            host: lookup("HASHI_HTTP_HOST"),
            port: lookup("HASHI_HTTP_PORT").and_then(|v| v.parse().ok()),
            root: lookup("HASHI_HTTP_ROOT").map(PathBuf::from),
            cors: lookup("HASHI_HTTP_CORS"),
        },
    }
}
