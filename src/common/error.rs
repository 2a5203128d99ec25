//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use thiserror::Error;
use std::io;
use tokio_tungstenite::tungstenite;

/// WebSocket relay proxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// WebSocket protocol or transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The remote base URL combined with the request path is not a usable WebSocket URL
    #[error("Invalid upstream URL '{url}': {reason}")]
    InvalidUrl {
        /// The offending URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// The upstream connection or its WebSocket handshake failed
    #[error("Upstream handshake with {url} failed: {source}")]
    UpstreamHandshake {
        /// Target URL of the failed attempt
        url: String,
        /// Underlying WebSocket error
        #[source]
        source: tungstenite::Error,
    },

    /// The upstream connection did not establish in time
    #[error("Upstream connection to {url} timed out after {timeout_secs}s")]
    ConnectTimeout {
        /// Target URL of the failed attempt
        url: String,
        /// Configured timeout in seconds
        timeout_secs: u64,
    },

    /// The client did not complete its WebSocket upgrade in time
    #[error("Client {peer} did not complete the WebSocket handshake within {timeout_secs}s")]
    HandshakeTimeout {
        /// Client address
        peer: String,
        /// Configured timeout in seconds
        timeout_secs: u64,
    },

    /// The upstream selected a different subprotocol than the client was answered with
    #[error("Subprotocol mismatch: client was answered with {answered:?}, upstream selected {selected:?}")]
    SubprotocolMismatch {
        /// Subprotocol given to the client
        answered: Option<String>,
        /// Subprotocol the upstream selected
        selected: Option<String>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (address parsing, resolution)
    #[error("Network error: {0}")]
    Network(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

impl ProxyError {
    /// Whether this error happened while establishing the upstream leg
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl { .. }
                | Self::UpstreamHandshake { .. }
                | Self::ConnectTimeout { .. }
                | Self::SubprotocolMismatch { .. }
        )
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        // Test IO error conversion
        let io_err = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let proxy_err: ProxyError = io_err.into();

        match proxy_err {
            ProxyError::Io(_) => {}
            _ => panic!("Should convert to IO error"),
        }

        let ws_err: ProxyError = tungstenite::Error::ConnectionClosed.into();
        assert!(matches!(ws_err, ProxyError::WebSocket(_)));
        assert!(!ws_err.is_upstream_failure());
    }

    #[test]
    fn test_error_display() {
        let err = ProxyError::Config("Invalid configuration".to_string());
        assert!(err.to_string().contains("Invalid configuration"));

        let err = ProxyError::ConnectTimeout {
            url: "wss://example.test:9000/cp1".to_string(),
            timeout_secs: 10,
        };
        let err_str = err.to_string();
        assert!(err_str.contains("wss://example.test:9000/cp1"));
        assert!(err_str.contains("10s"));
        assert!(err.is_upstream_failure());
    }
}
