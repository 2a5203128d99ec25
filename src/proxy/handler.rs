//! Connection handler module
//!
//! This module takes one accepted TCP connection through the client
//! handshake, the upstream connect and the supervised relay.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http::HeaderValue;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::common::{ProxyError, Result};
use crate::config::ProxyConfig;

use super::session::{RelaySettings, Session, SessionInfo, SessionOutcome};
use super::upstream::{UpgradeRequest, UpstreamConnector};

/// Reason sent to the client when the upstream leg cannot be established
pub const UPSTREAM_UNAVAILABLE: &str = "upstream unavailable";

/// Reason sent to both legs when the upstream picks another subprotocol
pub const SUBPROTOCOL_MISMATCH: &str = "subprotocol mismatch";

/// WebSocket settings applied to both legs
pub fn websocket_config(config: &ProxyConfig) -> WebSocketConfig {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size());
    ws_config
}

/// Per-connection handler
///
/// Built once from the configuration and shared by every session.
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    connector: UpstreamConnector,
    settings: RelaySettings,
    ws_config: WebSocketConfig,
    /// Bound on the client's upgrade request, so silent sockets release their slot
    handshake_timeout: Duration,
}

impl ConnectionHandler {
    /// Create a handler from the configuration
    pub fn new(config: &ProxyConfig) -> Self {
        let ws_config = websocket_config(config);
        let connect_timeout = Duration::from_secs(config.connect_timeout());

        Self {
            connector: UpstreamConnector::new(config.remote_url(), connect_timeout, ws_config),
            settings: RelaySettings::from_config(config),
            ws_config,
            handshake_timeout: connect_timeout,
        }
    }

    /// Override the relay settings
    pub fn with_settings(mut self, settings: RelaySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Relay settings used for every session
    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Handle a single client connection
    ///
    /// # Parameters
    ///
    /// * `stream` - Accepted client stream
    /// * `peer` - Client address
    /// * `shutdown` - Process wide shutdown token
    ///
    /// # Returns
    ///
    /// The session outcome, or an error when the client handshake or the
    /// upstream connection failed and no relaying took place.
    pub async fn handle<S>(&self, stream: S, peer: SocketAddr, shutdown: CancellationToken) -> Result<SessionOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = Uuid::new_v4();

        let mut upgrade: Option<UpgradeRequest> = None;
        let callback = |request: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
            let captured = UpgradeRequest::from_http(request);

            // Answer with the first offered subprotocol so strict clients accept the upgrade
            if let Some(first) = captured.protocols.first() {
                if let Ok(value) = HeaderValue::from_str(first) {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                }
            }

            upgrade = Some(captured);
            Ok(response)
        };

        let client = timeout(
            self.handshake_timeout,
            accept_hdr_async_with_config(stream, callback, Some(self.ws_config)),
        )
        .await
        .map_err(|_| {
            warn!("[{}] Client {} sent no WebSocket upgrade within {:?}", id, peer, self.handshake_timeout);
            ProxyError::HandshakeTimeout {
                peer: peer.to_string(),
                timeout_secs: self.handshake_timeout.as_secs(),
            }
        })?
        .map_err(|e| {
            warn!("[{}] WebSocket handshake with {} failed: {}", id, peer, e);
            ProxyError::WebSocket(e)
        })?;

        let upgrade = upgrade.unwrap_or_else(|| UpgradeRequest {
            path: "/".to_string(),
            protocols: Vec::new(),
        });

        info!("[{}] New client connected: {} {} (subprotocols {:?})", id, peer, upgrade.path, upgrade.protocols);

        let target = match self.connector.target_for(&upgrade) {
            Ok(target) => target,
            Err(e) => {
                error!("[{}] {}", id, e);
                self.close_leg(client, CloseCode::Error, UPSTREAM_UNAVAILABLE).await;
                return Err(e);
            }
        };

        info!("[{}] New remote url {}", id, target);

        let (upstream, selected) = match self.connector.connect(&target, &upgrade.protocols).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("[{}] Upstream unavailable: {:?}", id, e);
                self.close_leg(client, CloseCode::Error, UPSTREAM_UNAVAILABLE).await;
                return Err(e);
            }
        };

        // Both legs must speak the subprotocol the client was answered with
        let answered = upgrade.protocols.first().cloned();
        if selected != answered {
            let e = ProxyError::SubprotocolMismatch { answered, selected };
            error!("[{}] {}", id, e);
            tokio::join!(
                self.close_leg(client, CloseCode::Protocol, SUBPROTOCOL_MISMATCH),
                self.close_leg(upstream, CloseCode::Protocol, SUBPROTOCOL_MISMATCH),
            );
            return Err(e);
        }

        let info = SessionInfo {
            id,
            peer,
            path: upgrade.path,
            target_url: target,
            offered_protocols: upgrade.protocols,
            selected_protocol: selected,
            created_at: SystemTime::now(),
        };

        let session = Session::new(info, client, upstream);
        Ok(session.run(&self.settings, &shutdown).await)
    }

    /// Close a leg that never started relaying
    async fn close_leg<S>(&self, mut socket: WebSocketStream<S>, code: CloseCode, reason: &'static str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };

        let closing = async {
            if let Err(e) = socket.close(Some(frame)).await {
                debug!("Closing rejected leg: {}", e);
            }
            while let Some(Ok(_)) = socket.next().await {}
        };

        if timeout(self.settings.close_timeout, closing).await.is_err() {
            debug!("Rejected leg did not finish the closing handshake");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigValues, ValueSource};

    #[test]
    fn test_websocket_config_uses_message_limit() {
        let config = ProxyConfig::default().merge(
            &ProxyConfig::from_values(
                ConfigValues {
                    max_message_size: Some(1024),
                    ..Default::default()
                },
                ValueSource::CommandLine,
            ),
            ValueSource::CommandLine,
        );

        assert_eq!(websocket_config(&config).max_message_size, Some(1024));
    }

    #[test]
    fn test_handler_settings_follow_config() {
        let handler = ConnectionHandler::new(&ProxyConfig::default());
        assert_eq!(handler.settings(), &RelaySettings::from_config(&ProxyConfig::default()));
        assert_eq!(handler.connector.remote_base(), "wss://hass.moot.ovh:9000");
        assert_eq!(handler.handshake_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let config = ProxyConfig::default().merge(
            &ProxyConfig::from_values(
                ConfigValues {
                    connect_timeout: Some(1),
                    ..Default::default()
                },
                ValueSource::CommandLine,
            ),
            ValueSource::CommandLine,
        );
        let handler = ConnectionHandler::new(&config);

        // The far end stays open but never writes an upgrade request
        let (_silent, near) = tokio::io::duplex(1024);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let result = timeout(
            Duration::from_secs(5),
            handler.handle(near, peer, CancellationToken::new()),
        )
        .await
        .expect("handshake was not bounded");

        assert!(matches!(result, Err(ProxyError::HandshakeTimeout { timeout_secs: 1, .. })));
    }
}
