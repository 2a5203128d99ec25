//! WebSocket Relay Proxy: transparent WebSocket forwarding
//!
//! This library implements a proxy that accepts WebSocket clients and pairs
//! each of them with a WebSocket connection to one configured remote
//! origin. The inbound request path is appended to the remote base URL and
//! the client's subprotocol list is offered upstream verbatim. Frames are
//! relayed unchanged in both directions until either side closes.
//!
//! # Main Features
//!
//! - Path-appended forwarding to a single `ws://` or `wss://` origin
//! - Subprotocol pass-through (e.g. OCPP chargers)
//! - Joint teardown of both legs as soon as either one ends
//! - Layered configuration from defaults, file, environment and command line
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ws_relay_proxy::{config, Proxy, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = config::ConfigBuilder::new()
//!         .with_defaults()
//!         .with_env(config::ENV_PREFIX)
//!         .build()?;
//!
//!     let proxy = Proxy::new(Arc::new(config));
//!     proxy.run_until(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await
//! }
//! ```

// Public modules
pub mod common;
pub mod config;
pub mod proxy;

// Re-export commonly used structures and functions for convenience
pub use common::{init_logger, parse_socket_addr, ProxyError, Result};
pub use config::ProxyConfig;
pub use proxy::Proxy;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
