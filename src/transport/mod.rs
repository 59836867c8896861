//! Shared streaming transport
//!
//! One [`TransportConnection`] multiplexes every conversation over a single
//! bidirectional channel. The module is split the same way the protocol is:
//!
//! - [`frames`]     -- client and server frame types
//! - [`backoff`]    -- reconnect delay schedule
//! - [`connection`] -- state machine, reconnect supervisor, send path
//! - [`websocket`]  -- [`Connector`] over `tokio-tungstenite`
//!
//! The connection talks to the network only through the [`Connector`] seam.
//! A connector produces a [`Link`]: a pair of text channels whose inbound
//! half closing means the connection dropped.
//!
//! A connector reports a handshake the server refused for the token as
//! [`AuthError::SessionExpired`](crate::error::AuthError::SessionExpired).
//! The connection then asks its [`TokenSource`] for a renewed token.

use tokio::sync::mpsc;

use crate::error::Result;

pub mod backoff;
pub mod connection;
#[cfg(test)]
pub mod fake;
pub mod frames;
pub mod websocket;

pub use connection::TransportConnection;
pub use frames::{ClientFrame, ServerFrame};
pub use websocket::WebSocketConnector;

/// Published state of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not open, or closed explicitly.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Frames can be sent.
    Connected,
    /// Waiting out the backoff before attempt `n`.
    Reconnecting(u32),
}

/// Notifications delivered, in order, to the single inbound dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is up. `resumed` is `true` after a reconnect.
    Connected {
        /// Whether this follows an unexpected loss.
        resumed: bool,
    },
    /// A decoded server frame.
    Frame(ServerFrame),
    /// The connection dropped unexpectedly; a reconnect is scheduled.
    ConnectionLost,
    /// The connection was closed locally (sign-out or token change).
    Closed,
}

/// Text channels of one established connection.
#[derive(Debug)]
pub struct Link {
    /// Frames to write to the server.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames read from the server. Closes when the connection drops.
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens network connections on behalf of [`TransportConnection`].
#[async_trait::async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Connect, authenticating with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails. The connection retries with
    /// backoff.
    async fn connect(&self, token: &str) -> Result<Link>;
}

/// Renews the access token on behalf of the reconnect loop.
///
/// Both methods return `None` when the session could not be renewed; the
/// implementation is expected to have ended the session by then.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    /// A token that is not about to expire.
    async fn fresh_token(&self) -> Option<String>;

    /// A replacement for `token`, which the server refused.
    async fn token_rejected(&self, token: &str) -> Option<String>;
}
