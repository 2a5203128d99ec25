//! Configuration sources
//!
//! This module defines traits and implementations for loading configuration
//! from different sources.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::Parser;
use log::{debug, warn};

use crate::config::error::{ConfigError, Result};
use crate::config::types::{ConfigValues, ProxyConfig, ValueSource};

/// Configuration source trait
pub trait ConfigSource {
    /// Load configuration from this source
    fn load(&self) -> Result<ProxyConfig>;

    /// Get the source type
    fn source_type(&self) -> ValueSource;
}

/// Default configuration source
pub struct DefaultSource;

impl ConfigSource for DefaultSource {
    fn load(&self) -> Result<ProxyConfig> {
        debug!("Loading default configuration");
        Ok(ProxyConfig::default())
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::Default
    }
}

/// File configuration source (JSON)
pub struct FileSource {
    pub path: PathBuf,
}

impl FileSource {
    /// Create a new file source
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<ProxyConfig> {
        debug!("Loading configuration from file: {}", self.path.display());

        if !self.path.exists() {
            warn!("Configuration file not found: {}", self.path.display());
            return Ok(ProxyConfig::empty());
        }

        let contents = fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::FileReadError(self.path.clone(), e.to_string()))?;

        let values: ConfigValues = serde_json::from_str(&contents).map_err(|e| {
            ConfigError::ParseError(format!("Error parsing {}: {}", self.path.display(), e))
        })?;

        let mut config = ProxyConfig::from_values(values, self.source_type());
        config.config_file = Some(self.path.clone());

        Ok(config)
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::File
    }
}

/// Environment variable configuration source
pub struct EnvSource {
    pub prefix: String,
}

impl EnvSource {
    /// Create a new environment source
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn var(&self, name: &str) -> Option<(String, String)> {
        let key = format!("{}{}", self.prefix, name);
        env::var(&key).ok().map(|value| {
            debug!("Found environment variable {}={}", key, value);
            (key, value)
        })
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.var(name) {
            Some((key, value)) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue(key, format!("'{}': {}", value, e))),
            None => Ok(None),
        }
    }
}

impl ConfigSource for EnvSource {
    fn load(&self) -> Result<ProxyConfig> {
        debug!("Loading configuration from environment variables with prefix: {}", self.prefix);

        let log_payloads = match self.var("LOG_PAYLOADS") {
            Some((key, value)) => Some(
                parse_bool(&value)
                    .ok_or_else(|| ConfigError::InvalidValue(key, format!("'{}' is not a boolean", value)))?,
            ),
            None => None,
        };

        let values = ConfigValues {
            host: self.var("HOST").map(|(_, v)| v),
            port: self.parsed("PORT")?,
            remote_url: self.var("REMOTE_URL").map(|(_, v)| v),
            connect_timeout: self.parsed("CONNECT_TIMEOUT")?,
            idle_timeout: self.parsed("IDLE_TIMEOUT")?,
            max_connections: self.parsed("MAX_CONNECTIONS")?,
            max_message_size: self.parsed("MAX_MESSAGE_SIZE")?,
            log_level: self.var("LOG_LEVEL").map(|(_, v)| v.to_lowercase()),
            log_payloads,
        };

        Ok(ProxyConfig::from_values(values, self.source_type()))
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::Environment
    }
}

/// Parse the boolean spellings accepted in environment variables
fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Command line arguments
///
/// Every option is optional so unset flags fall through to lower priority sources.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ws-relay-proxy", version, about = "Transparent WebSocket forwarding proxy", long_about = None)]
pub struct CliArgs {
    /// Host to bind to [default: 0.0.0.0]
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to [default: 8765]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Remote WebSocket base URL; the request path is appended to it
    #[arg(short, long, alias = "remote_url")]
    pub remote_url: Option<String>,

    /// Upstream connect timeout in seconds [default: 10]
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Idle timeout per direction in seconds, 0 disables it [default: 0]
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Maximum concurrent sessions, 0 means unlimited [default: 0]
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum message size in bytes [default: 67108864]
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Log level (error, warn, info, debug, trace) [default: info]
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Include message payloads in relay logs (`--log-payloads=false` turns it off)
    #[arg(long, num_args = 0..=1, default_missing_value = "true", require_equals = true)]
    pub log_payloads: Option<bool>,

    /// Load configuration from a JSON file [default: config.json]
    #[arg(short, long)]
    pub config_file: Option<PathBuf>,
}

impl CliArgs {
    /// Values explicitly given on the command line
    pub fn values(&self) -> ConfigValues {
        ConfigValues {
            host: self.host.clone(),
            port: self.port,
            remote_url: self.remote_url.clone(),
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
            max_connections: self.max_connections,
            max_message_size: self.max_message_size,
            log_level: self.log_level.as_ref().map(|l| l.to_lowercase()),
            log_payloads: self.log_payloads,
        }
    }
}

/// Command line configuration source
pub struct CliSource {
    pub args: Vec<String>,
}

impl CliSource {
    /// Create a new command line source; `args` includes the program name
    pub fn new(args: Vec<String>) -> Self {
        Self { args }
    }
}

impl ConfigSource for CliSource {
    fn load(&self) -> Result<ProxyConfig> {
        debug!("Loading configuration from command line arguments");
        let args = CliArgs::try_parse_from(&self.args)?;
        Ok(ProxyConfig::from_values(args.values(), self.source_type()))
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::CommandLine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cli_source() {
        let source = CliSource::new(args(&[
            "ws-relay-proxy",
            "--host", "127.0.0.1",
            "--port", "9001",
            "--remote_url", "wss://example.test:9000",
            "--idle-timeout", "60",
            "--log-payloads",
        ]));

        let config = source.load().unwrap();
        assert_eq!(config.values.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.values.port, Some(9001));
        assert_eq!(config.values.remote_url.as_deref(), Some("wss://example.test:9000"));
        assert_eq!(config.values.idle_timeout, Some(60));
        assert_eq!(config.values.log_payloads, Some(true));
        assert_eq!(config.values.connect_timeout, None);
        assert_eq!(config.source("port"), "command line");
        assert_eq!(config.source("connect_timeout"), "unknown");
    }

    #[test]
    fn test_cli_log_payloads_override() {
        let load = |list: &[&str]| CliSource::new(args(list)).load().unwrap().values.log_payloads;

        assert_eq!(load(&["ws-relay-proxy"]), None);
        assert_eq!(load(&["ws-relay-proxy", "--log-payloads"]), Some(true));
        assert_eq!(load(&["ws-relay-proxy", "--log-payloads=false"]), Some(false));

        // A command line "false" wins over a file that turned it on
        let file = ProxyConfig::from_values(
            ConfigValues {
                log_payloads: Some(true),
                ..Default::default()
            },
            ValueSource::File,
        );
        let cli = CliSource::new(args(&["ws-relay-proxy", "--log-payloads=false"])).load().unwrap();
        let merged = ProxyConfig::default()
            .merge(&file, ValueSource::File)
            .merge(&cli, ValueSource::CommandLine);
        assert!(!merged.log_payloads());
        assert_eq!(merged.source("log_payloads"), "command line");
    }

    #[test]
    fn test_cli_source_rejects_bad_port() {
        let source = CliSource::new(args(&["ws-relay-proxy", "--port", "not-a-port"]));
        assert!(matches!(source.load(), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let config = FileSource::new("definitely-missing-config.json").load().unwrap();
        assert_eq!(config.values, ConfigValues::default());
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
