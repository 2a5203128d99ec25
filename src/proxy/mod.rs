//! Proxy service module
//!
//! This module implements the relay itself: the listener, the upstream
//! connector, the per-direction forwarding loops and the session supervisor
//! that ties one client connection to one upstream connection.
//!
//! Sessions share nothing but the read-only configuration; each one owns its
//! two WebSocket connections and its two forwarding tasks.

pub mod forwarder;
pub mod handler;
pub mod server;
pub mod session;
pub mod upstream;

pub use forwarder::{classify, Direction, FailureKind, ForwardingLoop, LoopExit, LoopReport};
pub use handler::{websocket_config, ConnectionHandler, SUBPROTOCOL_MISMATCH, UPSTREAM_UNAVAILABLE};
pub use server::Proxy;
pub use session::{Outcome, RelaySettings, Session, SessionInfo, SessionOutcome, SessionState};
pub use upstream::{offered_protocols, target_url, UpgradeRequest, UpstreamConnector};
