//! WebSocket Relay Proxy command line tool
//!
//! This binary is the command-line interface for the relay proxy.

use std::env;
use std::sync::Arc;

use log::{error, info};

use ws_relay_proxy::common::{init_logger, set_log_level, Result};
use ws_relay_proxy::config::{self, defaults::LOG_LEVEL_STR};
use ws_relay_proxy::{Proxy, APP_NAME, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    // Installed before loading so configuration warnings are not lost
    init_logger(LOG_LEVEL_STR);

    let config = config::auto_load(env::args().collect())?;
    set_log_level(config.log_level());

    info!("Starting {} v{}", APP_NAME, VERSION);
    config.log();

    let proxy = Proxy::new(Arc::new(config));

    info!("Proxy service ready, press Ctrl+C to stop");

    proxy.run_until(shutdown_signal()).await
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
