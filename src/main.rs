use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use hashi::bridge::Bridge;
use hashi::config::Config;
use hashi::error::BridgeError;
use hashi::r#static::StaticServer;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 2;
const EXIT_BIND: i32 = 3;
const EXIT_RUNTIME: i32 = 4;

#[tokio::main]
async fn main() {
    hashi::tracing::init_tracing();
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let machine = std::env::var("HASHI_MACHINE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/hashi/config.toml"));
    let environment = std::env::var("HASHI_ENV_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("hashi.toml"));

    let config = match Config::resolve(Some(&machine), Some(&environment), None) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "invalid configuration");
            return EXIT_CONFIG;
        }
    };

    let bridge = Arc::new(Bridge::builder(config.clone()).build());
    let listener = match bridge.bind().await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, "cannot bind bridge listener");
            return EXIT_BIND;
        }
    };

    let static_server = if config.http.enabled {
        match StaticServer::start(&config.http).await {
            Ok(server) => Some(server),
            Err(err) => {
                error!(%err, "cannot start static file server");
                return match err {
                    BridgeError::Bind { .. } => EXIT_BIND,
                    _ => EXIT_CONFIG,
                };
            }
        }
    } else {
        None
    };

    let mut runner = tokio::spawn(bridge.clone().run(listener));

    let finished_early = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            None
        }
        result = &mut runner => Some(result),
    };

    // The bridge and the HTTP companion stop in parallel; the shutdown path
    // runs even when the accept loop died on its own.
    let (drained, _) = tokio::join!(bridge.shutdown(), async {
        if let Some(server) = &static_server {
            server.stop().await;
        }
    });
    if !drained {
        warn!("some connections did not drain before the shutdown deadline");
    }

    let result = match finished_early {
        Some(result) => result,
        None => runner.await,
    };
    match result {
        Ok(Ok(())) => EXIT_OK,
        Ok(Err(err)) => {
            error!(%err, "bridge terminated abnormally");
            EXIT_RUNTIME
        }
        Err(err) => {
            error!(%err, "bridge task panicked");
            EXIT_RUNTIME
        }
    }
}
