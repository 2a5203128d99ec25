//! Logging helpers
//!
//! Wraps `env_logger` so the binary and the tests initialise logging the same way.
//! The logger is installed once, before configuration is loaded, and the
//! configured level is applied afterwards with [`set_log_level`].

use std::env;
use std::str::FromStr;

use log::LevelFilter;

use crate::config::defaults::LOG_LEVELS;

/// Map a configured level name onto a filter, falling back to `info`
pub fn level_filter(level: &str) -> LevelFilter {
    let level = level.trim().to_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return LevelFilter::Info;
    }
    LevelFilter::from_str(&level).unwrap_or(LevelFilter::Info)
}

/// Initialise the logging system
///
/// `RUST_LOG` takes precedence over `level` when it is set.
///
/// # Parameters
///
/// * `level` - Default log level (error, warn, info, debug, trace)
pub fn init_logger(level: &str) {
    // Without RUST_LOG the logger passes everything and the global max level filters
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", "trace");

    // A second initialisation (tests, embedding) is not an error worth surfacing.
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();

    set_log_level(level);
}

/// Apply the configured log level
///
/// Does nothing when `RUST_LOG` is set; its filters stay in charge.
pub fn set_log_level(level: &str) {
    if env::var_os("RUST_LOG").is_some() {
        return;
    }
    log::set_max_level(level_filter(level));
}
