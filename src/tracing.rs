//! Structured logging bootstrap for the bridge host process.
//!
//! Wires a `tracing-subscriber` formatter with an environment-driven filter:
//! `RUST_LOG` selects levels per target, defaulting to `info` for the whole
//! process when unset. Connection ids and remote addresses ride along as
//! span/event fields throughout the crate.

use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Initializes the global tracing subscriber with formatted output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_level(true)
                .with_filter(filter),
        )
        .init();
}
