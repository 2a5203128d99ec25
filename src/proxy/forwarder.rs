//! Message forwarding module
//!
//! This module relays WebSocket messages in one direction between the two
//! legs of a session. A session runs two [`ForwardingLoop`]s, one per
//! direction, each on its own task.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, trace};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Direction of a forwarding loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Inbound read half to outbound write half
    ClientToUpstream,
    /// Outbound read half to inbound write half
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => write!(f, "client->upstream"),
            Direction::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Which side of the loop an error happened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Reading from the source
    Read,
    /// Writing to the destination
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Read => write!(f, "read"),
            Stage::Write => write!(f, "write"),
        }
    }
}

/// Classification of a relay error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The connection went away without a closing handshake
    AbnormalClosure,
    /// The peer violated the WebSocket protocol
    ProtocolError,
    /// The connection was already closed
    Closed,
    /// Anything else
    Unclassified,
}

/// Classify a WebSocket error into the session failure taxonomy
pub fn classify(error: &WsError) -> FailureKind {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => FailureKind::Closed,
        WsError::Io(_) => FailureKind::AbnormalClosure,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => FailureKind::AbnormalClosure,
        WsError::Protocol(_) | WsError::Capacity(_) | WsError::Utf8 { .. } => FailureKind::ProtocolError,
        _ => FailureKind::Unclassified,
    }
}

/// Why a forwarding loop stopped
#[derive(Debug)]
pub enum LoopExit {
    /// The source sent a close frame, which was forwarded
    Closed(Option<CloseFrame>),
    /// The source ended without a close frame
    EndOfStream,
    /// Reading or writing failed
    Failed {
        /// Where the error happened
        stage: Stage,
        /// The underlying error
        error: WsError,
    },
    /// Nothing arrived from the source within the idle timeout
    IdleTimeout,
    /// The sibling loop exited first
    Cancelled,
}

impl LoopExit {
    /// Failure classification, `None` for exits that are not errors
    pub fn failure(&self) -> Option<FailureKind> {
        match self {
            LoopExit::Failed { error, .. } => Some(classify(error)),
            LoopExit::EndOfStream => Some(FailureKind::AbnormalClosure),
            _ => None,
        }
    }

    /// Whether the destination already received a close frame from this loop
    pub fn forwarded_close(&self) -> bool {
        matches!(self, LoopExit::Closed(_))
    }
}

impl fmt::Display for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::Closed(Some(frame)) => write!(f, "closed ({} {:?})", frame.code, frame.reason.as_str()),
            LoopExit::Closed(None) => write!(f, "closed (no status)"),
            LoopExit::EndOfStream => write!(f, "end of stream without close frame"),
            LoopExit::Failed { stage, error } => write!(f, "{} failed: {}", stage, error),
            LoopExit::IdleTimeout => write!(f, "idle timeout"),
            LoopExit::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a finished loop
///
/// Hands both halves back so the supervisor can reunite and close them.
#[derive(Debug)]
pub struct LoopReport<R, W> {
    /// Direction of the loop
    pub direction: Direction,
    /// Why it stopped
    pub exit: LoopExit,
    /// Source half
    pub source: R,
    /// Destination half
    pub sink: W,
    /// Number of data messages relayed
    pub relayed: u64,
}

/// Directional relay between a source stream and a destination sink
pub struct ForwardingLoop<R, W> {
    session: Uuid,
    direction: Direction,
    source: R,
    sink: W,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
    log_payloads: bool,
}

impl<R, W> ForwardingLoop<R, W>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    /// Create a forwarding loop
    ///
    /// # Parameters
    ///
    /// * `session` - Session the loop belongs to, used in logs
    /// * `direction` - Direction tag
    /// * `source` - Read half messages are taken from
    /// * `sink` - Write half messages are sent to
    /// * `cancel` - Token the supervisor uses to stop the loop
    pub fn new(session: Uuid, direction: Direction, source: R, sink: W, cancel: CancellationToken) -> Self {
        Self {
            session,
            direction,
            source,
            sink,
            cancel,
            idle_timeout: None,
            log_payloads: false,
        }
    }

    /// Stop the loop when nothing arrives for `idle`
    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }

    /// Include payloads in the relay log
    pub fn with_payload_logging(mut self, enabled: bool) -> Self {
        self.log_payloads = enabled;
        self
    }

    /// Relay messages until the source closes, an error occurs or the loop is cancelled
    ///
    /// Messages are forwarded one at a time; the next read only starts once
    /// the previous write completed.
    pub async fn run(self) -> LoopReport<R, W> {
        let ForwardingLoop {
            session,
            direction,
            mut source,
            mut sink,
            cancel,
            idle_timeout,
            log_payloads,
        } = self;

        let mut relayed = 0u64;

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break LoopExit::Cancelled,
                next = read_next(&mut source, idle_timeout) => next,
            };

            let message = match next {
                Err(_elapsed) => break LoopExit::IdleTimeout,
                Ok(None) => break LoopExit::EndOfStream,
                Ok(Some(Err(error))) => break LoopExit::Failed { stage: Stage::Read, error },
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(_) | Message::Binary(_) => {
                    debug!("[{}] {} {}", session, direction, describe(&message, log_payloads));

                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break LoopExit::Cancelled,
                        sent = sink.send(message) => sent,
                    };

                    if let Err(error) = sent {
                        break LoopExit::Failed { stage: Stage::Write, error };
                    }
                    relayed += 1;
                }
                Message::Close(frame) => {
                    debug!("[{}] {} close frame {:?}", session, direction, frame);

                    // The sibling may already be closing the destination; a
                    // failed forward still ends this loop as closed.
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        sent = sink.send(Message::Close(frame.clone())) => {
                            if let Err(e) = sent {
                                debug!("[{}] {} could not forward close frame: {}", session, direction, e);
                            }
                        }
                    }
                    break LoopExit::Closed(frame);
                }
                // Control frames are answered per hop
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("[{}] {} control frame not forwarded", session, direction);
                }
            }
        };

        debug!("[{}] {} stopped after {} messages: {}", session, direction, relayed, exit);

        LoopReport {
            direction,
            exit,
            source,
            sink,
            relayed,
        }
    }
}

/// Read the next message, bounded by the idle timeout when one is set
async fn read_next<R>(
    source: &mut R,
    idle_timeout: Option<Duration>,
) -> Result<Option<Result<Message, WsError>>, tokio::time::error::Elapsed>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match idle_timeout {
        Some(idle) => timeout(idle, source.next()).await,
        None => Ok(source.next().await),
    }
}

/// Describe a data message for the relay log
fn describe(message: &Message, log_payloads: bool) -> String {
    match message {
        Message::Text(text) if log_payloads => format!("text: {}", text.as_str()),
        Message::Text(text) => format!("text ({} bytes)", text.len()),
        Message::Binary(data) if log_payloads => format!("binary: {}", preview(data)),
        Message::Binary(data) => format!("binary ({} bytes)", data.len()),
        other => format!("{:?}", other),
    }
}

fn preview(data: &Bytes) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    type Source = mpsc::UnboundedReceiver<Result<Message, WsError>>;
    type Dest = futures::sink::SinkMapErr<mpsc::UnboundedSender<Message>, fn(mpsc::SendError) -> WsError>;

    fn dest(tx: mpsc::UnboundedSender<Message>) -> Dest {
        fn map(_: mpsc::SendError) -> WsError {
            WsError::AlreadyClosed
        }
        tx.sink_map_err(map as fn(mpsc::SendError) -> WsError)
    }

    fn forwarding_loop(
        cancel: CancellationToken,
    ) -> (
        mpsc::UnboundedSender<Result<Message, WsError>>,
        mpsc::UnboundedReceiver<Message>,
        ForwardingLoop<Source, Dest>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, out_rx) = mpsc::unbounded();
        let relay = ForwardingLoop::new(Uuid::new_v4(), Direction::ClientToUpstream, in_rx, dest(out_tx), cancel);
        (in_tx, out_rx, relay)
    }

    #[tokio::test]
    async fn test_relays_in_order_and_forwards_close() {
        let (in_tx, mut out_rx, relay) = forwarding_loop(CancellationToken::new());

        in_tx.unbounded_send(Ok(Message::text("first"))).unwrap();
        in_tx.unbounded_send(Ok(Message::Ping(Bytes::from_static(b"p")))).unwrap();
        in_tx.unbounded_send(Ok(Message::binary(vec![0u8, 1, 2]))).unwrap();
        in_tx.unbounded_send(Ok(Message::text("second"))).unwrap();
        in_tx
            .unbounded_send(Ok(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))))
            .unwrap();

        let report = relay.run().await;
        assert_eq!(report.relayed, 3);
        assert!(report.exit.forwarded_close());
        assert!(report.exit.failure().is_none());

        assert_eq!(out_rx.next().await.unwrap(), Message::text("first"));
        assert_eq!(out_rx.next().await.unwrap(), Message::binary(vec![0u8, 1, 2]));
        assert_eq!(out_rx.next().await.unwrap(), Message::text("second"));
        match out_rx.next().await.unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_end_of_stream_is_abnormal() {
        let (in_tx, _out_rx, relay) = forwarding_loop(CancellationToken::new());
        drop(in_tx);

        let report = relay.run().await;
        assert!(matches!(report.exit, LoopExit::EndOfStream));
        assert_eq!(report.exit.failure(), Some(FailureKind::AbnormalClosure));
    }

    #[tokio::test]
    async fn test_read_error_is_classified() {
        let (in_tx, _out_rx, relay) = forwarding_loop(CancellationToken::new());
        in_tx
            .unbounded_send(Err(WsError::Protocol(ProtocolError::UnexpectedContinueFrame)))
            .unwrap();

        let report = relay.run().await;
        assert!(matches!(report.exit, LoopExit::Failed { stage: Stage::Read, .. }));
        assert_eq!(report.exit.failure(), Some(FailureKind::ProtocolError));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_read() {
        let cancel = CancellationToken::new();
        let (_in_tx, _out_rx, relay) = forwarding_loop(cancel.clone());

        let handle = tokio::spawn(relay.run());
        cancel.cancel();

        let report = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(matches!(report.exit, LoopExit::Cancelled));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_in_tx, _out_rx, relay) = forwarding_loop(CancellationToken::new());

        let report = relay
            .with_idle_timeout(Some(Duration::from_millis(50)))
            .run()
            .await;
        assert!(matches!(report.exit, LoopExit::IdleTimeout));
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)),
            FailureKind::AbnormalClosure
        );
        assert_eq!(
            classify(&WsError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset))),
            FailureKind::AbnormalClosure
        );
        assert_eq!(
            classify(&WsError::Protocol(ProtocolError::UnexpectedContinueFrame)),
            FailureKind::ProtocolError
        );
        assert_eq!(classify(&WsError::ConnectionClosed), FailureKind::Closed);
    }

    #[test]
    fn test_describe_hides_payload_by_default() {
        let message = Message::text("secret");
        assert_eq!(describe(&message, false), "text (6 bytes)");
        assert_eq!(describe(&message, true), "text: secret");
        assert_eq!(describe(&Message::binary(vec![0xde, 0xad]), true), "binary: dead");
    }
}
