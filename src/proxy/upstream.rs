//! Upstream connector
//!
//! Derives the remote target of a session from the inbound upgrade request
//! and opens the outbound WebSocket connection.

use std::time::Duration;

use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::HeaderMap;
use http::HeaderValue;
use log::{debug, info};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as ClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::Request as UpgradeHttpRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::common::{ProxyError, Result};

/// The outbound leg of a session
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the proxy keeps from an inbound upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request path including the query string
    pub path: String,
    /// Subprotocols offered by the client, in the order offered
    pub protocols: Vec<String>,
}

impl UpgradeRequest {
    /// Capture path and offered subprotocols from the client's handshake request
    pub fn from_http(request: &UpgradeHttpRequest) -> Self {
        let path = request
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            path,
            protocols: offered_protocols(request.headers()),
        }
    }
}

/// Collect every `Sec-WebSocket-Protocol` token, across repeated headers
pub fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build the upstream target: remote base followed by the request path
///
/// Plain concatenation; the result only has to be a valid ws/wss URL.
pub fn target_url(remote_base: &str, path: &str) -> Result<String> {
    let target = format!("{}{}", remote_base, path);

    let url = Url::parse(&target).map_err(|e| ProxyError::InvalidUrl {
        url: target.clone(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "ws" | "wss" => Ok(target),
        scheme => Err(ProxyError::InvalidUrl {
            url: target,
            reason: format!("unsupported scheme '{}'", scheme),
        }),
    }
}

/// Build the client handshake request, offering the client's subprotocols verbatim
pub fn build_request(target: &str, protocols: &[String]) -> Result<ClientRequest> {
    let mut request = target.into_client_request().map_err(|e| ProxyError::InvalidUrl {
        url: target.to_string(),
        reason: e.to_string(),
    })?;

    if !protocols.is_empty() {
        let value = HeaderValue::from_str(&protocols.join(", ")).map_err(|e| {
            ProxyError::Other(format!("Invalid subprotocol list {:?}: {}", protocols, e))
        })?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    Ok(request)
}

/// Upstream connector
///
/// One attempt per session, no retries.
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    remote_base: String,
    connect_timeout: Duration,
    ws_config: WebSocketConfig,
}

impl UpstreamConnector {
    /// Create a connector for one remote origin
    pub fn new(remote_base: impl Into<String>, connect_timeout: Duration, ws_config: WebSocketConfig) -> Self {
        Self {
            remote_base: remote_base.into(),
            connect_timeout,
            ws_config,
        }
    }

    /// The remote base URL requests are appended to
    pub fn remote_base(&self) -> &str {
        &self.remote_base
    }

    /// Resolve the target URL for an inbound request
    pub fn target_for(&self, request: &UpgradeRequest) -> Result<String> {
        target_url(&self.remote_base, &request.path)
    }

    /// Open the outbound connection
    ///
    /// Returns the established socket and the subprotocol the upstream selected.
    pub async fn connect(&self, target: &str, protocols: &[String]) -> Result<(UpstreamSocket, Option<String>)> {
        let request = build_request(target, protocols)?;

        debug!("Connecting to upstream {} offering {:?}", target, protocols);

        let (socket, response) = timeout(
            self.connect_timeout,
            connect_async_with_config(request, Some(self.ws_config), false),
        )
        .await
        .map_err(|_| ProxyError::ConnectTimeout {
            url: target.to_string(),
            timeout_secs: self.connect_timeout.as_secs(),
        })?
        .map_err(|source| ProxyError::UpstreamHandshake {
            url: target.to_string(),
            source,
        })?;

        let selected = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        info!("Upstream connected: {} (status {}, subprotocol {:?})", target, response.status(), selected);

        Ok((socket, selected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url_concatenates() {
        assert_eq!(
            target_url("wss://example.test:9000", "/cp1").unwrap(),
            "wss://example.test:9000/cp1"
        );
        assert_eq!(
            target_url("wss://ocpp.example.test/ocpp", "/CP-42?token=a").unwrap(),
            "wss://ocpp.example.test/ocpp/CP-42?token=a"
        );
        // No normalisation beyond concatenation
        assert_eq!(
            target_url("ws://127.0.0.1:9000/", "/x").unwrap(),
            "ws://127.0.0.1:9000//x"
        );
    }

    #[test]
    fn test_target_url_rejects_non_websocket() {
        assert!(matches!(
            target_url("https://example.test", "/cp1"),
            Err(ProxyError::InvalidUrl { .. })
        ));
        assert!(target_url("", "/cp1").is_err());
    }

    #[test]
    fn test_build_request_offers_client_protocols() {
        let request = build_request("wss://example.test:9000/cp1", &["ocpp1.6".to_string()]).unwrap();
        assert_eq!(request.uri().to_string(), "wss://example.test:9000/cp1");
        assert_eq!(request.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(), "ocpp1.6");

        let request = build_request(
            "ws://127.0.0.1:9000/cp1",
            &["ocpp2.0.1".to_string(), "ocpp1.6".to_string()],
        )
        .unwrap();
        assert_eq!(request.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(), "ocpp2.0.1, ocpp1.6");

        let request = build_request("ws://127.0.0.1:9000/cp1", &[]).unwrap();
        assert!(request.headers().get(SEC_WEBSOCKET_PROTOCOL).is_none());
    }

    #[test]
    fn test_upgrade_request_capture() {
        let request = http::Request::builder()
            .uri("/cp1?x=1")
            .header(SEC_WEBSOCKET_PROTOCOL, "ocpp2.0.1, ocpp1.6")
            .header(SEC_WEBSOCKET_PROTOCOL, "ocpp1.5")
            .body(())
            .unwrap();

        let upgrade = UpgradeRequest::from_http(&request);
        assert_eq!(upgrade.path, "/cp1?x=1");
        assert_eq!(upgrade.protocols, vec!["ocpp2.0.1", "ocpp1.6", "ocpp1.5"]);
    }

    #[tokio::test]
    async fn test_connect_refused_is_handshake_failure() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = UpstreamConnector::new(
            format!("ws://{}", addr),
            Duration::from_secs(2),
            WebSocketConfig::default(),
        );
        let target = connector
            .target_for(&UpgradeRequest { path: "/cp1".to_string(), protocols: vec![] })
            .unwrap();

        let err = connector.connect(&target, &[]).await.unwrap_err();
        assert!(err.is_upstream_failure(), "unexpected error: {}", err);
    }
}
