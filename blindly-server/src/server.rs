//! WebSocket server core: shared state, socket handler, and frame fan-out.
//!
//! Each client connects to `/chat/{conversation_id}?user={user_id}` and
//! exchanges JSON text frames. The server assigns authoritative message
//! ids and timestamps, echoes the sender's client key back for optimistic
//! resolution, and forwards typing and seen state between participants.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use blindly_proto::codec;
use blindly_proto::frame::{ClientFrame, ServerFrame};
use blindly_proto::message::{ConversationId, UserId};

use crate::hub::HubRegistry;

/// Shared server state.
pub struct ServerState {
    /// Conversation registry.
    pub hubs: HubRegistry,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    /// Creates server state with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hubs: HubRegistry::new(),
        }
    }

    /// Creates server state with a custom per-conversation history bound.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            hubs: HubRegistry::with_max_history(max_history),
        }
    }
}

/// Query parameters of the chat endpoint.
#[derive(Debug, serde::Deserialize)]
struct ChatParams {
    #[serde(default)]
    user: Option<String>,
}

/// Handles an upgraded WebSocket connection for one participant.
///
/// The connection lifecycle:
/// 1. Reject the socket with `unauthorized` when no user id was given.
/// 2. Register the participant, displacing any previous socket for the
///    same user.
/// 3. Enter the read/write loop, fanning frames out per conversation.
/// 4. On disconnect, remove the participant (history is kept).
pub async fn handle_socket(
    socket: WebSocket,
    state: Arc<ServerState>,
    conversation: ConversationId,
    user: Option<String>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let user = match user {
        Some(u) if !u.trim().is_empty() => UserId::new(u),
        _ => {
            tracing::warn!(conversation = %conversation.as_str(), "connection without user id");
            if let Ok(text) = codec::encode(&ServerFrame::Unauthorized) {
                let _ = ws_sender.send(WsMessage::Text(text.into())).await;
            }
            let _ = ws_sender.send(WsMessage::Close(None)).await;
            return;
        }
    };

    tracing::info!(
        conversation = %conversation.as_str(),
        user = %user.as_str(),
        "participant connecting"
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    if let Some(old_sender) = state.hubs.join(&conversation, &user, tx).await {
        tracing::info!(user = %user.as_str(), "displacing existing socket for user");
        let _ = old_sender.send(WsMessage::Close(None));
    }

    // Writer task: forward frames from the channel to the socket.
    let writer_user = user.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(user = %writer_user.as_str(), "websocket write failed");
                break;
            }
        }
    });

    // Reader task: decode and dispatch inbound frames.
    let reader_state = Arc::clone(&state);
    let reader_conversation = conversation.clone();
    let reader_user = user.clone();
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_text_frame(
                        &reader_state,
                        &reader_conversation,
                        &reader_user,
                        text.as_str(),
                    )
                    .await;
                }
                WsMessage::Close(_) => {
                    tracing::debug!(user = %reader_user.as_str(), "received close frame");
                    break;
                }
                _ => {
                    // Ignore binary, ping, and pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => write_task.abort(),
        _ = &mut write_task => read_task.abort(),
    }

    state.hubs.leave(&conversation, &user).await;
    tracing::info!(
        conversation = %conversation.as_str(),
        user = %user.as_str(),
        "participant disconnected"
    );
}

/// Decodes and dispatches one inbound text frame.
async fn handle_text_frame(
    state: &Arc<ServerState>,
    conversation: &ConversationId,
    user: &UserId,
    text: &str,
) {
    let frame = match codec::decode::<ClientFrame>(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(user = %user.as_str(), error = %e, "failed to decode frame");
            send_to_user(state, conversation, user, &ServerFrame::Error {
                error: format!("invalid frame: {e}"),
            })
            .await;
            return;
        }
    };

    match frame {
        ClientFrame::MessageSent { message: draft } => {
            if let Err(e) = draft.validate() {
                send_to_user(state, conversation, user, &ServerFrame::Error {
                    error: e.to_string(),
                })
                .await;
                return;
            }
            let message = state.hubs.record_message(conversation, user, draft).await;
            tracing::debug!(
                conversation = %conversation.as_str(),
                sender = %user.as_str(),
                id = %message.id.as_str(),
                "message recorded"
            );
            // Everyone gets the broadcast, the sender included: that echo
            // is what resolves the sender's optimistic entry.
            broadcast(state, conversation, None, &ServerFrame::MessageReceived { message }).await;
        }
        ClientFrame::QueryMessages { message_query } => {
            let page = state.hubs.query(conversation, &message_query).await;
            send_to_user(
                state,
                conversation,
                user,
                &ServerFrame::MessagesQuerySuccess { message: page },
            )
            .await;
        }
        ClientFrame::MessageSeen { mark_seen } => {
            let changed = state.hubs.mark_seen(conversation, user, &mark_seen).await;
            if !changed.is_empty() {
                broadcast(
                    state,
                    conversation,
                    Some(user),
                    &ServerFrame::MessageSeen { mark_seen: changed },
                )
                .await;
            }
        }
        ClientFrame::TypingStarted => {
            broadcast(
                state,
                conversation,
                Some(user),
                &ServerFrame::TypingStarted {
                    sender_id: user.clone(),
                },
            )
            .await;
        }
        ClientFrame::TypingStopped => {
            broadcast(
                state,
                conversation,
                Some(user),
                &ServerFrame::TypingStopped {
                    sender_id: user.clone(),
                },
            )
            .await;
        }
        ClientFrame::ReactionAdded { reaction } => {
            match state.hubs.add_reaction(conversation, user, &reaction).await {
                Some(message) => {
                    broadcast(state, conversation, None, &ServerFrame::ReactionAdded { message })
                        .await;
                }
                None => {
                    send_to_user(state, conversation, user, &ServerFrame::Error {
                        error: "unknown message".to_string(),
                    })
                    .await;
                }
            }
        }
        ClientFrame::ReactionRemoved { reaction } => {
            if let Some(message) = state
                .hubs
                .remove_reaction(conversation, user, &reaction)
                .await
            {
                broadcast(
                    state,
                    conversation,
                    None,
                    &ServerFrame::ReactionRemoved { message },
                )
                .await;
            }
        }
        ClientFrame::EndChat => {
            tracing::info!(
                conversation = %conversation.as_str(),
                user = %user.as_str(),
                "conversation ended"
            );
            broadcast(state, conversation, None, &ServerFrame::EndChat).await;
            state.hubs.end(conversation).await;
        }
    }
}

/// Sends a frame to every connected participant, optionally excluding one.
async fn broadcast(
    state: &Arc<ServerState>,
    conversation: &ConversationId,
    exclude: Option<&UserId>,
    frame: &ServerFrame,
) {
    let Ok(text) = codec::encode(frame) else {
        tracing::error!("failed to encode broadcast frame");
        return;
    };
    for (participant, sender) in state.hubs.participants(conversation).await {
        if exclude == Some(&participant) {
            continue;
        }
        let _ = sender.send(WsMessage::Text(text.clone().into()));
    }
}

/// Sends a frame to one participant.
async fn send_to_user(
    state: &Arc<ServerState>,
    conversation: &ConversationId,
    user: &UserId,
    frame: &ServerFrame,
) {
    let Ok(text) = codec::encode(frame) else {
        return;
    };
    for (participant, sender) in state.hubs.participants(conversation).await {
        if participant == *user {
            let _ = sender.send(WsMessage::Text(text.into()));
            return;
        }
    }
}

/// Starts the chat server on the given address and returns the bound
/// address and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::new())).await
}

/// Starts the chat server with pre-configured [`ServerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/chat/{conversation_id}", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "chat server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::Path(conversation_id): axum::extract::Path<String>,
    axum::extract::Query(params): axum::extract::Query<ChatParams>,
    axum::extract::State(state): axum::extract::State<Arc<ServerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| {
        handle_socket(
            socket,
            state,
            ConversationId::new(conversation_id),
            params.user,
        )
    })
}
