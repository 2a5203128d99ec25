//! Configuration types
//!
//! This module contains the main configuration types used throughout the application.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::common::{self, bind_addr};
use crate::config::defaults::{
    CONNECT_TIMEOUT, HOST_STR, IDLE_TIMEOUT, LOG_LEVEL_STR, LOG_PAYLOADS, MAX_CONNECTIONS,
    MAX_MESSAGE_SIZE, PORT, REMOTE_URL_STR,
};

/// Source of a configuration value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueSource {
    /// Default value
    Default,
    /// From configuration file
    File,
    /// From environment variable
    Environment,
    /// From command line argument
    CommandLine,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::Default => write!(f, "default"),
            ValueSource::File => write!(f, "file"),
            ValueSource::Environment => write!(f, "environment"),
            ValueSource::CommandLine => write!(f, "command line"),
        }
    }
}

/// Configuration values
///
/// Every field is optional so that each source only carries what it actually
/// sets; the builder fills the gaps with defaults at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigValues {
    // --- Listener ---

    /// Bind host (IP address or resolvable name)
    #[serde(default)]
    pub host: Option<String>,

    /// Bind port
    #[serde(default)]
    pub port: Option<u16>,

    // --- Upstream ---

    /// Remote base URL; the inbound request path is appended to it
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Upstream connect timeout in seconds
    #[serde(default)]
    pub connect_timeout: Option<u64>,

    // --- Sessions ---

    /// Per-direction idle timeout in seconds (0 disables it)
    #[serde(default)]
    pub idle_timeout: Option<u64>,

    /// Maximum number of concurrent sessions (0 means unlimited)
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Maximum message size accepted on either leg, in bytes
    #[serde(default)]
    pub max_message_size: Option<usize>,

    // --- Logging ---

    /// Log level (error, warn, info, debug, trace)
    #[serde(default)]
    pub log_level: Option<String>,

    /// Include message payloads in relay logs
    #[serde(default)]
    pub log_payloads: Option<bool>,
}

/// Proxy configuration
///
/// Contains all configuration options needed for the proxy server.
/// Supports loading from command-line arguments, environment variables,
/// and configuration files. Once built it is shared read-only through an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Configuration values
    pub values: ConfigValues,

    /// Configuration file path
    pub config_file: Option<PathBuf>,

    /// Source tracking for configuration values
    pub sources: HashMap<String, ValueSource>,
}

impl Deref for ProxyConfig {
    type Target = ConfigValues;

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let mut config = Self::empty();

        // Apply default values and track their source
        config.set_default_values();

        config
    }
}

impl ProxyConfig {
    /// A configuration with no values and no source information
    pub fn empty() -> Self {
        Self {
            values: ConfigValues::default(),
            config_file: None,
            sources: HashMap::new(),
        }
    }

    /// Wrap values coming from a single source
    pub fn from_values(values: ConfigValues, source: ValueSource) -> Self {
        let mut config = Self::empty();
        config.values = values;

        for name in config.present_fields() {
            config.sources.insert(name.to_string(), source);
        }

        config
    }

    /// Names of the fields that carry a value
    fn present_fields(&self) -> Vec<&'static str> {
        let v = &self.values;
        [
            ("host", v.host.is_some()),
            ("port", v.port.is_some()),
            ("remote_url", v.remote_url.is_some()),
            ("connect_timeout", v.connect_timeout.is_some()),
            ("idle_timeout", v.idle_timeout.is_some()),
            ("max_connections", v.max_connections.is_some()),
            ("max_message_size", v.max_message_size.is_some()),
            ("log_level", v.log_level.is_some()),
            ("log_payloads", v.log_payloads.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
        .collect()
    }

    /// Set default values for all configuration options
    pub fn set_default_values(&mut self) {
        macro_rules! default_field {
            ($name:ident, $value:expr) => {
                if self.values.$name.is_none() {
                    self.values.$name = Some($value);
                    self.sources.insert(stringify!($name).to_string(), ValueSource::Default);
                }
            };
        }

        default_field!(host, HOST_STR.to_string());
        default_field!(port, PORT);
        default_field!(remote_url, REMOTE_URL_STR.to_string());
        default_field!(connect_timeout, CONNECT_TIMEOUT);
        default_field!(idle_timeout, IDLE_TIMEOUT);
        default_field!(max_connections, MAX_CONNECTIONS);
        default_field!(max_message_size, MAX_MESSAGE_SIZE);
        default_field!(log_level, LOG_LEVEL_STR.to_string());
        default_field!(log_payloads, LOG_PAYLOADS);
    }

    /// Merge two configurations
    ///
    /// Values present in `other` win and are recorded as coming from `source`.
    pub fn merge(&self, other: &ProxyConfig, source: ValueSource) -> Self {
        let mut result = self.clone();

        macro_rules! merge_field {
            ($name:ident) => {
                if other.values.$name.is_some() {
                    result.values.$name = other.values.$name.clone();
                    result.sources.insert(stringify!($name).to_string(), source);
                }
            };
        }

        merge_field!(host);
        merge_field!(port);
        merge_field!(remote_url);
        merge_field!(connect_timeout);
        merge_field!(idle_timeout);
        merge_field!(max_connections);
        merge_field!(max_message_size);
        merge_field!(log_level);
        merge_field!(log_payloads);

        // Configuration file path
        if let Some(path) = &other.config_file {
            result.config_file = Some(path.clone());
        }

        result
    }

    /// Get the source of a configuration value
    pub fn source(&self, name: &str) -> String {
        self.sources
            .get(name)
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Get the bind host
    pub fn host(&self) -> &str {
        self.values.host.as_deref().unwrap_or(HOST_STR)
    }

    /// Get the bind port
    pub fn port(&self) -> u16 {
        self.values.port.unwrap_or(PORT)
    }

    /// Resolve the bind address from host and port
    pub fn listen_addr(&self) -> common::Result<SocketAddr> {
        bind_addr(self.host(), self.port())
    }

    /// Get the remote base URL
    pub fn remote_url(&self) -> &str {
        self.values.remote_url.as_deref().unwrap_or(REMOTE_URL_STR)
    }

    /// Get the upstream connect timeout in seconds
    pub fn connect_timeout(&self) -> u64 {
        self.values.connect_timeout.unwrap_or(CONNECT_TIMEOUT)
    }

    /// Get the idle timeout in seconds (0 means disabled)
    pub fn idle_timeout(&self) -> u64 {
        self.values.idle_timeout.unwrap_or(IDLE_TIMEOUT)
    }

    /// Idle timeout as a duration, `None` when disabled
    pub fn idle_timeout_duration(&self) -> Option<Duration> {
        match self.idle_timeout() {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Get the concurrent session limit (0 means unlimited)
    pub fn max_connections(&self) -> usize {
        self.values.max_connections.unwrap_or(MAX_CONNECTIONS)
    }

    /// Get the maximum message size in bytes
    pub fn max_message_size(&self) -> usize {
        self.values.max_message_size.unwrap_or(MAX_MESSAGE_SIZE)
    }

    /// Get the log level
    pub fn log_level(&self) -> &str {
        self.values.log_level.as_deref().unwrap_or(LOG_LEVEL_STR)
    }

    /// Whether relay logs include payloads
    pub fn log_payloads(&self) -> bool {
        self.values.log_payloads.unwrap_or(LOG_PAYLOADS)
    }

    /// Get the configuration file path
    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Log the configuration with source information
    pub fn log(&self) {
        info!("=== Configuration ===");
        info!("Listener:");
        info!("  Host: {} (from {})", self.host(), self.source("host"));
        info!("  Port: {} (from {})", self.port(), self.source("port"));
        info!("Upstream:");
        info!("  Remote URL: {} (from {})", self.remote_url(), self.source("remote_url"));
        info!("  Connect timeout: {} seconds (from {})", self.connect_timeout(), self.source("connect_timeout"));
        info!("Sessions:");
        match self.idle_timeout() {
            0 => info!("  Idle timeout: disabled (from {})", self.source("idle_timeout")),
            secs => info!("  Idle timeout: {} seconds (from {})", secs, self.source("idle_timeout")),
        }
        match self.max_connections() {
            0 => info!("  Max connections: unlimited (from {})", self.source("max_connections")),
            n => info!("  Max connections: {} (from {})", n, self.source("max_connections")),
        }
        info!("  Max message size: {} bytes (from {})", self.max_message_size(), self.source("max_message_size"));
        info!("Logging:");
        info!("  Log level: {} (from {})", self.log_level(), self.source("log_level"));
        info!("  Log payloads: {} (from {})", self.log_payloads(), self.source("log_payloads"));

        if let Some(file) = self.config_file() {
            info!("  Configuration file: {}", file.display());
        }

        info!("=====================");
    }
}
