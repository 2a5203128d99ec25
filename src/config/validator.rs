//! Configuration validator
//!
//! This module provides functionality for validating configuration.

use log::warn;
use url::Url;

use crate::config::defaults::LOG_LEVELS;
use crate::config::error::{ConfigError, Result};
use crate::config::types::ProxyConfig;

/// Validate the configuration
pub fn validate_config(config: &ProxyConfig) -> Result<()> {
    validate_listener_settings(config)?;
    validate_upstream_settings(config)?;
    validate_session_settings(config)?;

    for warning in check_warnings(config) {
        warn!("{}", warning);
    }

    Ok(())
}

/// Validate listener settings
fn validate_listener_settings(config: &ProxyConfig) -> Result<()> {
    if config.host().trim().is_empty() {
        return Err(ConfigError::InvalidValue(
            "host".to_string(),
            "Host must not be empty".to_string(),
        ));
    }

    config.listen_addr().map_err(|e| {
        ConfigError::InvalidValue("host".to_string(), e.to_string())
    })?;

    Ok(())
}

/// Validate the remote base URL and the connect timeout
fn validate_upstream_settings(config: &ProxyConfig) -> Result<()> {
    parse_remote_url(config.remote_url())?;

    if config.connect_timeout() == 0 {
        return Err(ConfigError::InvalidValue(
            "connect_timeout".to_string(),
            "Connect timeout must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Validate session settings
fn validate_session_settings(config: &ProxyConfig) -> Result<()> {
    if config.max_message_size() == 0 {
        return Err(ConfigError::InvalidValue(
            "max_message_size".to_string(),
            "Maximum message size must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

/// Parse the remote base URL and make sure it is a WebSocket origin
pub fn parse_remote_url(remote_url: &str) -> Result<Url> {
    let url = Url::parse(remote_url).map_err(|e| {
        ConfigError::InvalidValue("remote_url".to_string(), format!("'{}': {}", remote_url, e))
    })?;

    match url.scheme() {
        "ws" | "wss" => {}
        scheme => {
            return Err(ConfigError::InvalidValue(
                "remote_url".to_string(),
                format!("Unsupported scheme '{}', expected ws or wss", scheme),
            ))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidValue(
            "remote_url".to_string(),
            format!("'{}' has no host", remote_url),
        ));
    }

    Ok(url)
}

/// Check configuration for potential issues that do not prevent startup
pub fn check_warnings(config: &ProxyConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if !LOG_LEVELS.contains(&config.log_level()) {
        warnings.push(format!("Invalid log level '{}', using default 'info'", config.log_level()));
    }

    let remote_url = config.remote_url();
    if remote_url.contains('?') || remote_url.contains('#') {
        warnings.push(format!(
            "Remote URL '{}' has a query or fragment; request paths are appended after it",
            remote_url
        ));
    } else if remote_url.ends_with('/') {
        warnings.push(format!(
            "Remote URL '{}' ends with '/'; upstream paths will start with '//'",
            remote_url
        ));
    }

    if config.log_payloads() {
        warnings.push("Payload logging is enabled; relayed message contents will appear in logs".to_string());
    }

    warnings
}
