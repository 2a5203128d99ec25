//! Configuration module
//!
//! This module handles application configuration, including loading from
//! different sources (files, environment variables, command line arguments)
//! and validating the configuration.
//!
//! Values are bound once at startup; the resulting [`ProxyConfig`] is
//! immutable for the lifetime of the process and handed to the proxy
//! explicitly.

pub mod builder;
pub mod defaults;
pub mod error;
pub mod source;
pub mod types;
pub mod validator;

pub use self::builder::{auto_load, ConfigBuilder};
pub use self::error::ConfigError;
pub use self::source::{CliArgs, ConfigSource};
pub use self::types::{ConfigValues, ProxyConfig, ValueSource};
pub use self::validator::{check_warnings, parse_remote_url, validate_config};

pub use defaults::{DEFAULT_CONFIG_FILE, ENV_PREFIX};
