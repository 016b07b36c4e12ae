//! WebSocket connection to the chat server.
//!
//! Connects to `<base>/chat/{conversation_id}?user={user_id}` and exchanges
//! JSON text frames. A background reader task decodes inbound frames into
//! an mpsc channel so [`Connection::recv`] never touches the socket
//! directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};
use url::Url;

use blindly_proto::codec;
use blindly_proto::frame::{ClientFrame, ServerFrame};
use blindly_proto::message::{ConversationId, UserId};

use super::{Connection, ConnectionError, Connector};

/// How long to wait for the WebSocket handshake before giving up.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer size for the inbound frame channel.
const INCOMING_BUFFER: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Opens [`WsConnection`]s against a fixed server base URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    /// Creates a connector for the given base URL (e.g. `ws://127.0.0.1:4000`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(
        &self,
        conversation: &ConversationId,
        user: &UserId,
    ) -> Result<WsConnection, ConnectionError> {
        let url = build_chat_url(&self.base_url, conversation, user)?;
        WsConnection::connect(&url).await
    }
}

/// Builds the per-conversation WebSocket URL.
fn build_chat_url(
    base: &str,
    conversation: &ConversationId,
    user: &UserId,
) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(base).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| ConnectionError::InvalidUrl("url cannot be a base".into()))?
        .pop_if_empty()
        .push("chat")
        .push(conversation.as_str());
    url.query_pairs_mut().append_pair("user", user.as_str());
    Ok(url)
}

/// A live WebSocket connection for one conversation.
pub struct WsConnection {
    /// Outbound half of the socket.
    writer: Mutex<WsSink>,
    /// Decoded inbound frames, fed by the reader task.
    incoming: Mutex<mpsc::Receiver<ServerFrame>>,
    /// Cleared by the reader task when the socket dies.
    open: Arc<AtomicBool>,
}

impl WsConnection {
    /// Connects and spawns the background reader task.
    async fn connect(url: &Url) -> Result<Self, ConnectionError> {
        let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(map_ws_connect_error)?;

        let (writer, reader) = stream.split();
        let (frame_tx, frame_rx) = mpsc::channel(INCOMING_BUFFER);
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(reader_loop(reader, frame_tx, Arc::clone(&open)));

        Ok(Self {
            writer: Mutex::new(writer),
            incoming: Mutex::new(frame_rx),
            open,
        })
    }
}

impl Connection for WsConnection {
    async fn send(&self, frame: &ClientFrame) -> Result<(), ConnectionError> {
        let text = codec::encode(frame)?;
        let mut writer = self.writer.lock().await;
        writer.send(WsMessage::text(text)).await.map_err(|e| {
            tracing::debug!(error = %e, "websocket write failed");
            self.open.store(false, Ordering::SeqCst);
            ConnectionError::Closed
        })
    }

    async fn recv(&self) -> Result<ServerFrame, ConnectionError> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(ConnectionError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.send(WsMessage::Close(None)).await;
    }
}

/// Background task: pull socket messages, decode, and forward frames.
///
/// Undecodable text frames are logged and dropped; they must never take
/// the connection down.
async fn reader_loop(mut reader: WsSource, frame_tx: mpsc::Sender<ServerFrame>, open: Arc<AtomicBool>) {
    while let Some(item) = reader.next().await {
        match item {
            Ok(WsMessage::Text(text)) => match codec::decode::<ServerFrame>(text.as_str()) {
                Ok(frame) => {
                    if frame_tx.send(frame).await.is_err() {
                        // Connection dropped by the session.
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping undecodable server frame");
                }
            },
            Ok(WsMessage::Close(_)) => {
                tracing::debug!("server closed the websocket");
                break;
            }
            Ok(WsMessage::Binary(_)) => {
                tracing::warn!("dropping unexpected binary frame");
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => {}
            Err(e) => {
                tracing::debug!(error = %e, "websocket read failed");
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
}

/// Maps a tungstenite connect error into a [`ConnectionError`].
fn map_ws_connect_error(e: tungstenite::Error) -> ConnectionError {
    match e {
        tungstenite::Error::Url(e) => ConnectionError::InvalidUrl(e.to_string()),
        tungstenite::Error::Io(e) => ConnectionError::Unreachable(e.to_string()),
        other => ConnectionError::Unreachable(other.to_string()),
    }
}
