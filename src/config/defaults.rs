//! Default configuration values
//!
//! This module provides default values for configuration options.
//! It is designed to be a single source of truth for defaults,
//! making it easier to maintain consistent defaults across the application.

/// Environment variable prefix for all configuration options
pub const ENV_PREFIX: &str = "WS_RELAY_PROXY_";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Default bind host (all interfaces)
pub const HOST_STR: &str = "0.0.0.0";

/// Default bind port
pub const PORT: u16 = 8765;

/// Default remote base URL
pub const REMOTE_URL_STR: &str = "wss://hass.moot.ovh:9000";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Default upstream connect timeout in seconds
pub const CONNECT_TIMEOUT: u64 = 10;

/// Default idle timeout in seconds (0 disables it)
pub const IDLE_TIMEOUT: u64 = 0;

/// Default concurrent session limit (0 means unlimited)
pub const MAX_CONNECTIONS: usize = 0;

/// Payload logging is off by default
pub const LOG_PAYLOADS: bool = false;

/// Default maximum message size (64 MiB)
pub const MAX_MESSAGE_SIZE: usize = 64 << 20;

/// Time allowed for a close handshake during session teardown, in seconds
pub const CLOSE_TIMEOUT: u64 = 5;

/// Grace period for running sessions after the listener stops, in seconds
pub const SHUTDOWN_GRACE: u64 = 10;

/// Valid log levels
pub const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
