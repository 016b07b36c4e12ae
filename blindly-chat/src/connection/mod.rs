//! Connection layer: the live bidirectional channel for one conversation.
//!
//! The session logic is written against the [`Connection`] and [`Connector`]
//! traits so it can run over a real WebSocket ([`ws::WsConnector`]) or a
//! deterministic in-process pair ([`loopback::LoopbackConnection`]) in tests.

pub mod loopback;
pub mod ws;

use blindly_proto::codec::CodecError;
use blindly_proto::frame::{ClientFrame, ServerFrame};
use blindly_proto::message::{ConversationId, UserId};

/// Errors that can occur on a conversation connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection is closed (locally or by the server).
    #[error("connection closed")]
    Closed,
    /// Connecting took too long.
    #[error("connection timed out")]
    Timeout,
    /// The server could not be reached.
    #[error("server unreachable: {0}")]
    Unreachable(String),
    /// The configured server URL is not usable.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Lifecycle of a conversation's connection, rendered by the UI as a
/// passive banner rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial connect or reconnect in progress.
    Connecting,
    /// Live and exchanging frames.
    Open,
    /// Lost; a retry is scheduled.
    ClosedRetrying,
}

/// A live, bidirectional frame channel for one conversation.
pub trait Connection: Send + Sync + 'static {
    /// Transmit one frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] if the frame cannot be serialized or the
    /// connection is no longer writable.
    fn send(
        &self,
        frame: &ClientFrame,
    ) -> impl std::future::Future<Output = Result<(), ConnectionError>> + Send;

    /// Wait for the next frame from the server.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] once the connection is gone.
    fn recv(&self) -> impl std::future::Future<Output = Result<ServerFrame, ConnectionError>> + Send;

    /// Whether the connection is currently usable.
    fn is_open(&self) -> bool;

    /// Release the connection. Best effort; never fails.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;
}

/// Opens connections for a conversation. The session calls this once at
/// startup and again for every reconnect attempt.
pub trait Connector: Send + Sync + 'static {
    /// The connection type this connector produces.
    type Conn: Connection;

    /// Open a connection for the given conversation as the given user.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError`] when the server cannot be reached or
    /// rejects the attempt.
    fn connect(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> impl std::future::Future<Output = Result<Self::Conn, ConnectionError>> + Send;
}
