//! Session supervisor
//!
//! A session pairs one inbound client connection with one outbound upstream
//! connection. The supervisor runs both forwarding loops, stops the survivor
//! as soon as either one exits and closes both legs together.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::defaults::CLOSE_TIMEOUT;
use crate::config::ProxyConfig;
use crate::proxy::forwarder::{Direction, FailureKind, ForwardingLoop, LoopExit, LoopReport};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Both loops running
    Open,
    /// One loop exited, teardown in progress
    Closing,
    /// Both loops stopped and both legs closed
    Closed,
    /// Ended abnormally
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Open => write!(f, "open"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A peer sent a close frame
    NormalClosure,
    /// A leg reset or ended without a close frame
    AbnormalClosure,
    /// A peer violated the WebSocket protocol
    ProtocolError,
    /// A direction stayed silent for longer than the idle timeout
    IdleTimeout,
    /// The proxy is shutting down
    Shutdown,
    /// Any other error, including a panicked loop
    Unclassified,
}

impl Outcome {
    fn from_failure(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Closed => Outcome::NormalClosure,
            FailureKind::AbnormalClosure => Outcome::AbnormalClosure,
            FailureKind::ProtocolError => Outcome::ProtocolError,
            FailureKind::Unclassified => Outcome::Unclassified,
        }
    }

    /// Whether the session counts as failed
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Outcome::AbnormalClosure | Outcome::ProtocolError | Outcome::Unclassified
        )
    }

    /// Close frame sent on legs that have not closed yet
    pub fn close_frame(&self) -> CloseFrame {
        let (code, reason) = match self {
            Outcome::NormalClosure => (CloseCode::Normal, ""),
            Outcome::AbnormalClosure => (CloseCode::Error, "peer connection lost"),
            Outcome::ProtocolError => (CloseCode::Protocol, "protocol error"),
            Outcome::IdleTimeout => (CloseCode::Away, "idle timeout"),
            Outcome::Shutdown => (CloseCode::Away, "proxy shutting down"),
            Outcome::Unclassified => (CloseCode::Error, "relay error"),
        };

        CloseFrame {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::NormalClosure => write!(f, "normal closure"),
            Outcome::AbnormalClosure => write!(f, "abnormal closure"),
            Outcome::ProtocolError => write!(f, "protocol error"),
            Outcome::IdleTimeout => write!(f, "idle timeout"),
            Outcome::Shutdown => write!(f, "shutdown"),
            Outcome::Unclassified => write!(f, "unclassified error"),
        }
    }
}

/// Descriptive attributes of a session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session id
    pub id: Uuid,
    /// Client peer address
    pub peer: SocketAddr,
    /// Inbound request path including the query string
    pub path: String,
    /// Upstream target URL
    pub target_url: String,
    /// Subprotocols offered by the client
    pub offered_protocols: Vec<String>,
    /// Subprotocol selected by the upstream
    pub selected_protocol: Option<String>,
    /// When the session was created
    pub created_at: SystemTime,
}

impl SessionInfo {
    /// Create session info with a fresh id
    pub fn new(peer: SocketAddr, path: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            path: path.into(),
            target_url: target_url.into(),
            offered_protocols: Vec::new(),
            selected_protocol: None,
            created_at: SystemTime::now(),
        }
    }
}

/// Relay settings shared by every session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Per-direction idle timeout, `None` when disabled
    pub idle_timeout: Option<Duration>,
    /// Include payloads in relay logs
    pub log_payloads: bool,
    /// Bound on stopping the sibling loop and on each closing handshake
    pub close_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            log_payloads: false,
            close_timeout: Duration::from_secs(CLOSE_TIMEOUT),
        }
    }
}

impl RelaySettings {
    /// Build relay settings from the configuration
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout_duration(),
            log_payloads: config.log_payloads(),
            ..Self::default()
        }
    }
}

/// Final report of a session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Session id
    pub id: Uuid,
    /// Terminal state
    pub state: SessionState,
    /// Classification of the first loop exit
    pub outcome: Outcome,
    /// Direction whose loop exited first
    pub ended_by: Direction,
    /// Human readable detail of the first exit
    pub detail: String,
    /// Messages relayed client->upstream
    pub client_to_upstream: u64,
    /// Messages relayed upstream->client
    pub upstream_to_client: u64,
    /// Session lifetime
    pub duration: Duration,
}

type Half<S> = SplitStream<WebSocketStream<S>>;
type SinkHalf<S> = SplitSink<WebSocketStream<S>, Message>;
type Report<A, B> = LoopReport<Half<A>, SinkHalf<B>>;

enum FirstExit<A, B> {
    ClientToUpstream(Result<A, JoinError>),
    UpstreamToClient(Result<B, JoinError>),
}

/// One client/upstream pairing
pub struct Session<C, U> {
    info: SessionInfo,
    client: WebSocketStream<C>,
    upstream: WebSocketStream<U>,
    state: SessionState,
}

impl<C, U> Session<C, U>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a session from two established legs
    pub fn new(info: SessionInfo, client: WebSocketStream<C>, upstream: WebSocketStream<U>) -> Self {
        Self {
            info,
            client,
            upstream,
            state: SessionState::Open,
        }
    }

    /// Session attributes
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Relay until either side stops, then tear both legs down
    ///
    /// # Parameters
    ///
    /// * `settings` - Relay settings
    /// * `shutdown` - Process wide shutdown token; cancelling it ends the session
    ///
    /// # Returns
    ///
    /// How the session ended. Errors inside the loops never escape this call.
    pub async fn run(mut self, settings: &RelaySettings, shutdown: &CancellationToken) -> SessionOutcome {
        let started = Instant::now();
        let id = self.info.id;
        let cancel = shutdown.child_token();

        let (client_sink, client_stream) = self.client.split();
        let (upstream_sink, upstream_stream) = self.upstream.split();

        let inbound = ForwardingLoop::new(id, Direction::ClientToUpstream, client_stream, upstream_sink, cancel.clone())
            .with_idle_timeout(settings.idle_timeout)
            .with_payload_logging(settings.log_payloads);
        let outbound = ForwardingLoop::new(id, Direction::UpstreamToClient, upstream_stream, client_sink, cancel.clone())
            .with_idle_timeout(settings.idle_timeout)
            .with_payload_logging(settings.log_payloads);

        let mut inbound_task: JoinHandle<Report<C, U>> = tokio::spawn(inbound.run());
        let mut outbound_task: JoinHandle<Report<U, C>> = tokio::spawn(outbound.run());

        let first = tokio::select! {
            result = &mut inbound_task => FirstExit::ClientToUpstream(result),
            result = &mut outbound_task => FirstExit::UpstreamToClient(result),
        };

        self.state = SessionState::Closing;
        cancel.cancel();

        let (inbound_result, outbound_result, ended_by) = match first {
            FirstExit::ClientToUpstream(result) => (
                result,
                join_sibling(outbound_task, settings.close_timeout).await,
                Direction::ClientToUpstream,
            ),
            FirstExit::UpstreamToClient(result) => (
                join_sibling(inbound_task, settings.close_timeout).await,
                result,
                Direction::UpstreamToClient,
            ),
        };

        let (outcome, detail) = {
            let first_exit = match ended_by {
                Direction::ClientToUpstream => inbound_result.as_ref().map(|r| &r.exit),
                Direction::UpstreamToClient => outbound_result.as_ref().map(|r| &r.exit),
            };
            classify_exit(first_exit, shutdown)
        };

        let client_to_upstream = inbound_result.as_ref().map_or(0, |r| r.relayed);
        let upstream_to_client = outbound_result.as_ref().map_or(0, |r| r.relayed);

        // Inbound loop held client read + upstream write, outbound loop the reverse
        let (client_stream, upstream_sink) = match inbound_result {
            Ok(report) => (Some(report.source), Some(report.sink)),
            Err(_) => (None, None),
        };
        let (upstream_stream, client_sink) = match outbound_result {
            Ok(report) => (Some(report.source), Some(report.sink)),
            Err(_) => (None, None),
        };

        let frame = outcome.close_frame();
        tokio::join!(
            close_leg(client_stream, client_sink, frame.clone(), settings.close_timeout),
            close_leg(upstream_stream, upstream_sink, frame, settings.close_timeout),
        );

        self.state = if outcome.is_error() {
            SessionState::Failed
        } else {
            SessionState::Closed
        };

        let result = SessionOutcome {
            id,
            state: self.state,
            outcome,
            ended_by,
            detail,
            client_to_upstream,
            upstream_to_client,
            duration: started.elapsed(),
        };

        log_outcome(&self.info, &result);

        result
    }
}

/// Wait for the cancelled sibling, aborting it if it does not stop in time
async fn join_sibling<T>(mut handle: JoinHandle<T>, limit: Duration) -> Result<T, JoinError> {
    match timeout(limit, &mut handle).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Forwarding loop did not stop within {:?}, aborting it", limit);
            handle.abort();
            handle.await
        }
    }
}

/// Map the first loop exit onto the session outcome
fn classify_exit(exit: Result<&LoopExit, &JoinError>, shutdown: &CancellationToken) -> (Outcome, String) {
    match exit {
        Ok(exit) => {
            let outcome = match exit {
                LoopExit::Closed(_) => Outcome::NormalClosure,
                LoopExit::IdleTimeout => Outcome::IdleTimeout,
                LoopExit::Cancelled if shutdown.is_cancelled() => Outcome::Shutdown,
                LoopExit::Cancelled => Outcome::Unclassified,
                LoopExit::EndOfStream | LoopExit::Failed { .. } => exit
                    .failure()
                    .map_or(Outcome::Unclassified, Outcome::from_failure),
            };
            (outcome, exit.to_string())
        }
        // A panicked loop is contained here
        Err(join_error) => (Outcome::Unclassified, format!("forwarding task failed: {:?}", join_error)),
    }
}

/// Send a close frame on one leg and wait for the closing handshake
///
/// Reunites the halves when both came back; a leg whose loop panicked is
/// closed through whatever half survived. The frame is ignored by the
/// WebSocket layer when the leg already closed.
async fn close_leg<S>(stream: Option<Half<S>>, sink: Option<SinkHalf<S>>, frame: CloseFrame, limit: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let closing = async move {
        match (stream, sink) {
            (Some(stream), Some(sink)) => match stream.reunite(sink) {
                Ok(mut socket) => {
                    if let Err(e) = socket.close(Some(frame)).await {
                        debug!("Close on reunited leg: {}", e);
                    }
                    while let Some(Ok(_)) = socket.next().await {}
                }
                Err(_) => debug!("Leg halves do not belong together; dropping them"),
            },
            (stream, sink) => {
                if let Some(mut sink) = sink {
                    let _ = sink.send(Message::Close(Some(frame))).await;
                }
                if let Some(mut stream) = stream {
                    while let Some(Ok(_)) = stream.next().await {}
                }
            }
        }
    };

    if timeout(limit, closing).await.is_err() {
        debug!("Closing handshake did not finish within {:?}", limit);
    }
}

fn log_outcome(info: &SessionInfo, result: &SessionOutcome) {
    let summary = format!(
        "[{}] {} -> {} after {:?} ({} messages up, {} down, ended by {})",
        info.id,
        info.peer,
        info.target_url,
        result.duration,
        result.client_to_upstream,
        result.upstream_to_client,
        result.ended_by,
    );

    match result.outcome {
        Outcome::NormalClosure => info!("Connection closed properly: {}: {}", summary, result.detail),
        Outcome::Shutdown => info!("Connection closed for shutdown: {}", summary),
        Outcome::IdleTimeout => warn!("Connection closed after idle timeout: {}", summary),
        Outcome::AbnormalClosure => error!("Connection closed with an error: {}: {}", summary, result.detail),
        Outcome::ProtocolError => error!("Protocol error: {}: {}", summary, result.detail),
        Outcome::Unclassified => error!("Unexpected error: {}: {}", summary, result.detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    struct Harness {
        /// Test side of the client leg
        client: WebSocketStream<DuplexStream>,
        /// Test side of the upstream leg
        upstream: WebSocketStream<DuplexStream>,
        task: JoinHandle<SessionOutcome>,
        shutdown: CancellationToken,
    }

    async fn start(settings: RelaySettings) -> Harness {
        let (client_far, client_near) = tokio::io::duplex(64 * 1024);
        let (upstream_near, upstream_far) = tokio::io::duplex(64 * 1024);

        let client = WebSocketStream::from_raw_socket(client_far, Role::Client, None).await;
        let proxy_client_leg = WebSocketStream::from_raw_socket(client_near, Role::Server, None).await;
        let proxy_upstream_leg = WebSocketStream::from_raw_socket(upstream_near, Role::Client, None).await;
        let upstream = WebSocketStream::from_raw_socket(upstream_far, Role::Server, None).await;

        let info = SessionInfo::new("127.0.0.1:40000".parse().unwrap(), "/cp1", "ws://upstream.test/cp1");
        let session = Session::new(info, proxy_client_leg, proxy_upstream_leg);
        assert_eq!(session.state(), SessionState::Open);

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { session.run(&settings, &token).await });

        Harness {
            client,
            upstream,
            task,
            shutdown,
        }
    }

    async fn finish(task: JoinHandle<SessionOutcome>) -> SessionOutcome {
        timeout(Duration::from_secs(5), task)
            .await
            .expect("session did not finish in time")
            .expect("session task panicked")
    }

    /// Read until the next close frame, returning it
    async fn next_close(socket: &mut WebSocketStream<DuplexStream>) -> Option<CloseFrame> {
        while let Some(Ok(message)) = socket.next().await {
            if let Message::Close(frame) = message {
                return frame;
            }
        }
        None
    }

    /// Keep reading so the close reply gets flushed, until the proxy drops the leg
    async fn drain(socket: &mut WebSocketStream<DuplexStream>) {
        while let Some(Ok(_)) = socket.next().await {}
    }

    #[tokio::test]
    async fn test_relay_then_upstream_close() {
        let mut h = start(RelaySettings::default()).await;

        h.client.send(Message::text("ping")).await.unwrap();
        assert_eq!(h.upstream.next().await.unwrap().unwrap(), Message::text("ping"));

        h.upstream.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
        assert_eq!(h.client.next().await.unwrap().unwrap(), Message::binary(vec![1u8, 2, 3]));

        h.upstream
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            })))
            .await
            .unwrap();

        let frame = next_close(&mut h.client).await.expect("client should see a close frame");
        assert_eq!(frame.code, CloseCode::Normal);
        assert_eq!(frame.reason.as_str(), "done");
        drain(&mut h.client).await;
        drain(&mut h.upstream).await;

        let outcome = finish(h.task).await;
        assert_eq!(outcome.outcome, Outcome::NormalClosure);
        assert_eq!(outcome.state, SessionState::Closed);
        assert_eq!(outcome.ended_by, Direction::UpstreamToClient);
        assert_eq!(outcome.client_to_upstream, 1);
        assert_eq!(outcome.upstream_to_client, 1);
    }

    #[tokio::test]
    async fn test_client_vanishing_tears_down_upstream() {
        let mut h = start(RelaySettings::default()).await;

        // Upstream loop is blocked reading; the client goes away without a close frame
        drop(h.client);

        let frame = next_close(&mut h.upstream).await.expect("upstream should see a close frame");
        assert_eq!(frame.code, CloseCode::Error);
        drain(&mut h.upstream).await;

        let outcome = finish(h.task).await;
        assert_eq!(outcome.outcome, Outcome::AbnormalClosure);
        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(outcome.ended_by, Direction::ClientToUpstream);
    }

    #[tokio::test]
    async fn test_shutdown_closes_both_legs() {
        let mut h = start(RelaySettings::default()).await;

        h.shutdown.cancel();

        let client_frame = next_close(&mut h.client).await.expect("client close frame");
        let upstream_frame = next_close(&mut h.upstream).await.expect("upstream close frame");
        assert_eq!(client_frame.code, CloseCode::Away);
        assert_eq!(upstream_frame.code, CloseCode::Away);
        drain(&mut h.client).await;
        drain(&mut h.upstream).await;

        let outcome = finish(h.task).await;
        assert_eq!(outcome.outcome, Outcome::Shutdown);
        assert_eq!(outcome.state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_session() {
        let settings = RelaySettings {
            idle_timeout: Some(Duration::from_millis(100)),
            ..RelaySettings::default()
        };
        let mut h = start(settings).await;

        let frame = next_close(&mut h.client).await.expect("client close frame");
        assert_eq!(frame.code, CloseCode::Away);
        assert_eq!(frame.reason.as_str(), "idle timeout");
        drain(&mut h.client).await;
        drain(&mut h.upstream).await;

        let outcome = finish(h.task).await;
        assert_eq!(outcome.outcome, Outcome::IdleTimeout);
    }

    #[test]
    fn test_relay_settings_from_config() {
        let settings = RelaySettings::from_config(&ProxyConfig::default());
        assert_eq!(settings, RelaySettings::default());
    }
}
