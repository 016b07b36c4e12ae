//! End-to-end tests: two real sessions over WebSocket against the
//! development chat server.
//!
//! Verifies:
//! 1. Delivery between two clients, with the sender's optimistic entry
//!    resolving on the broadcast echo.
//! 2. Seen receipts propagating back to the sender.
//! 3. Typing indicators crossing the wire.
//! 4. Ending the conversation reaching both sides.

use std::time::Duration;

use tokio::sync::mpsc;

use blindly_chat::cache::InMemoryCache;
use blindly_chat::connection::ws::WsConnector;
use blindly_chat::session::{ChatEvent, ChatSession, SessionCommand, SessionConfig, SessionHandle};
use blindly_proto::message::{ConversationId, UserId};
use blindly_server::server::start_server;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn spawn_client(
    addr: std::net::SocketAddr,
    user: &str,
) -> (SessionHandle, mpsc::Receiver<ChatEvent>) {
    ChatSession::spawn(
        SessionConfig::default(),
        WsConnector::new(format!("ws://{addr}")),
        InMemoryCache::new(),
        UserId::new(user),
        ConversationId::new("c-e2e"),
    )
}

/// Receive events until one matches, failing the test after a timeout.
async fn wait_for<F>(events: &mut mpsc::Receiver<ChatEvent>, mut pred: F) -> ChatEvent
where
    F: FnMut(&ChatEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Wait until the session is connected and the server has answered its
/// initial history query. The answer proves the server registered this
/// participant, so frames from the counterpart cannot be missed anymore.
async fn wait_ready(events: &mut mpsc::Receiver<ChatEvent>) {
    wait_for(events, |e| *e == ChatEvent::Connected).await;
    wait_for(events, |e| matches!(e, ChatEvent::HistoryLoaded { .. })).await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn message_delivery_and_confirmation() {
    let (addr, _server) = start_server("127.0.0.1:0").await.unwrap();
    let (alice, mut alice_events) = spawn_client(addr, "alice").await;
    let (bob, mut bob_events) = spawn_client(addr, "bob").await;

    wait_ready(&mut alice_events).await;
    wait_ready(&mut bob_events).await;

    assert!(alice.send_text("hey bob").await);

    // Bob receives the message.
    let received = wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::MessageReceived { .. })
    })
    .await;
    match received {
        ChatEvent::MessageReceived { message } => {
            assert_eq!(message.sender_id, UserId::new("alice"));
            assert_eq!(message.content, "hey bob");
        }
        other => panic!("expected MessageReceived, got {other:?}"),
    }

    // Alice's optimistic entry resolves on the broadcast echo.
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::MessageConfirmed { .. })
    })
    .await;
    assert_eq!(alice.pending_count(), 0);
    assert_eq!(alice.messages().len(), 1);
    assert_eq!(bob.messages().len(), 1);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn seen_receipt_propagates_to_the_sender() {
    let (addr, _server) = start_server("127.0.0.1:0").await.unwrap();
    let (alice, mut alice_events) = spawn_client(addr, "alice").await;
    let (bob, mut bob_events) = spawn_client(addr, "bob").await;

    wait_ready(&mut alice_events).await;
    wait_ready(&mut bob_events).await;

    assert!(alice.send_text("look at this").await);

    // Bob's session reports the message seen on arrival; the receipt
    // comes back around to alice.
    wait_for(&mut bob_events, |e| {
        matches!(e, ChatEvent::MessageReceived { .. })
    })
    .await;
    wait_for(&mut alice_events, |e| {
        matches!(e, ChatEvent::SeenUpdated { .. })
    })
    .await;
    assert!(alice.messages()[0].seen);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn typing_indicator_crosses_the_wire() {
    let (addr, _server) = start_server("127.0.0.1:0").await.unwrap();
    let (alice, mut alice_events) = spawn_client(addr, "alice").await;
    let (bob, mut bob_events) = spawn_client(addr, "bob").await;

    wait_ready(&mut alice_events).await;
    wait_ready(&mut bob_events).await;

    assert!(bob.input_changed().await);

    assert_eq!(
        wait_for(&mut alice_events, |e| matches!(
            e,
            ChatEvent::RemoteTyping { .. }
        ))
        .await,
        ChatEvent::RemoteTyping { active: true }
    );

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn end_chat_reaches_both_sides() {
    let (addr, _server) = start_server("127.0.0.1:0").await.unwrap();
    let (alice, mut alice_events) = spawn_client(addr, "alice").await;
    let (bob, mut bob_events) = spawn_client(addr, "bob").await;

    wait_ready(&mut alice_events).await;
    wait_ready(&mut bob_events).await;

    assert!(alice.command(SessionCommand::EndChat).await);

    wait_for(&mut alice_events, |e| *e == ChatEvent::ChatEnded).await;
    wait_for(&mut bob_events, |e| *e == ChatEvent::ChatEnded).await;

    alice.shutdown().await;
    bob.shutdown().await;
}
