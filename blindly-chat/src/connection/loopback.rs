//! In-process connection for testing.
//!
//! [`LoopbackConnection::create_pair`] returns a client-side connection and
//! a [`ScriptedServer`] handle. Tests drive a session deterministically by
//! pushing [`ServerFrame`]s and asserting on the [`ClientFrame`]s the
//! session transmits, with no real transport involved.

use std::collections::VecDeque;

use tokio::sync::{Mutex, mpsc};

use blindly_proto::frame::{ClientFrame, ServerFrame};
use blindly_proto::message::{ConversationId, UserId};

use super::{Connection, ConnectionError, Connector};

/// Client end of an in-process connection pair.
pub struct LoopbackConnection {
    outbound: mpsc::Sender<ClientFrame>,
    inbound: Mutex<mpsc::Receiver<ServerFrame>>,
}

/// Test-side handle playing the server role.
pub struct ScriptedServer {
    outbound: mpsc::Sender<ServerFrame>,
    inbound: Mutex<mpsc::Receiver<ClientFrame>>,
}

impl LoopbackConnection {
    /// Create a connected (client, server) pair with the given channel
    /// capacity in each direction.
    #[must_use]
    pub fn create_pair(buffer: usize) -> (Self, ScriptedServer) {
        let (client_tx, server_rx) = mpsc::channel(buffer);
        let (server_tx, client_rx) = mpsc::channel(buffer);

        let client = Self {
            outbound: client_tx,
            inbound: Mutex::new(client_rx),
        };
        let server = ScriptedServer {
            outbound: server_tx,
            inbound: Mutex::new(server_rx),
        };
        (client, server)
    }
}

impl Connection for LoopbackConnection {
    async fn send(&self, frame: &ClientFrame) -> Result<(), ConnectionError> {
        self.outbound
            .send(frame.clone())
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    async fn recv(&self) -> Result<ServerFrame, ConnectionError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(ConnectionError::Closed)
    }

    fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    async fn close(&self) {
        // Dropping the pair closes the channels; nothing to do here.
    }
}

impl ScriptedServer {
    /// Push a frame to the client. Returns `false` if the client is gone.
    pub async fn push(&self, frame: ServerFrame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    /// Wait for the next frame the client transmitted.
    pub async fn next_client_frame(&self) -> Option<ClientFrame> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await
    }

    /// Non-blocking variant of [`next_client_frame`](Self::next_client_frame).
    pub async fn try_next_client_frame(&self) -> Option<ClientFrame> {
        let mut inbound = self.inbound.lock().await;
        inbound.try_recv().ok()
    }
}

/// Connector handing out pre-scripted connections in order.
///
/// Each reconnect attempt consumes the next prepared connection; once the
/// script runs out, further attempts fail with
/// [`ConnectionError::Unreachable`].
pub struct LoopbackConnector {
    pending: Mutex<VecDeque<LoopbackConnection>>,
}

impl LoopbackConnector {
    /// Creates a connector with the given connections queued.
    #[must_use]
    pub fn with_connections(connections: Vec<LoopbackConnection>) -> Self {
        Self {
            pending: Mutex::new(connections.into()),
        }
    }

    /// Creates a connector with a single queued connection.
    #[must_use]
    pub fn single(connection: LoopbackConnection) -> Self {
        Self::with_connections(vec![connection])
    }
}

impl Connector for LoopbackConnector {
    type Conn = LoopbackConnection;

    async fn connect(
        &self,
        _conversation: &ConversationId,
        _user: &UserId,
    ) -> Result<LoopbackConnection, ConnectionError> {
        let mut pending = self.pending.lock().await;
        pending
            .pop_front()
            .ok_or_else(|| ConnectionError::Unreachable("no scripted connection left".into()))
    }
}
