//! Integration tests for typing indicators, run under paused time.
//!
//! Verifies:
//! 1. The first keystroke broadcasts a start; further keystrokes do not.
//! 2. The quiet interval elapsing broadcasts a stop.
//! 3. Sending a message stops typing immediately.
//! 4. Remote typing is shown on start and cleared on stop or timeout.

use std::time::Duration;

use tokio::sync::mpsc;

use blindly_chat::cache::InMemoryCache;
use blindly_chat::connection::loopback::{LoopbackConnection, LoopbackConnector, ScriptedServer};
use blindly_chat::session::{ChatEvent, ChatSession, SessionConfig, SessionHandle};
use blindly_proto::frame::{ClientFrame, ServerFrame};
use blindly_proto::message::{ConversationId, UserId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn spawn_ready() -> (SessionHandle, mpsc::Receiver<ChatEvent>, ScriptedServer) {
    let (conn, server) = LoopbackConnection::create_pair(32);
    let (handle, mut events) = ChatSession::spawn(
        SessionConfig::default(),
        LoopbackConnector::single(conn),
        InMemoryCache::new(),
        UserId::new("alice"),
        ConversationId::new("c-1"),
    );

    assert_eq!(next_event(&mut events).await, ChatEvent::Connected);
    // Swallow the initial history request.
    assert!(matches!(
        server.next_client_frame().await,
        Some(ClientFrame::QueryMessages { .. })
    ));
    (handle, events, server)
}

async fn next_event(events: &mut mpsc::Receiver<ChatEvent>) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn first_keystroke_starts_and_quiet_interval_stops() {
    let (handle, _events, server) = spawn_ready().await;

    assert!(handle.input_changed().await);
    assert_eq!(
        server.next_client_frame().await,
        Some(ClientFrame::TypingStarted)
    );

    // More keystrokes while already typing broadcast nothing; the next
    // frame the server sees is the debounced stop once input goes quiet
    // (time auto-advances past the 2s deadline under paused time).
    assert!(handle.input_changed().await);
    assert!(handle.input_changed().await);
    assert_eq!(
        server.next_client_frame().await,
        Some(ClientFrame::TypingStopped)
    );

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn send_stops_typing_immediately() {
    let (handle, mut events, server) = spawn_ready().await;

    assert!(handle.input_changed().await);
    assert_eq!(
        server.next_client_frame().await,
        Some(ClientFrame::TypingStarted)
    );

    assert!(handle.send_text("done typing").await);
    match next_event(&mut events).await {
        ChatEvent::SendStaged { .. } => {}
        other => panic!("expected SendStaged, got {other:?}"),
    }

    // Stop precedes the message so the counterpart never sees "typing"
    // linger next to an already-delivered message.
    assert_eq!(
        server.next_client_frame().await,
        Some(ClientFrame::TypingStopped)
    );
    assert!(matches!(
        server.next_client_frame().await,
        Some(ClientFrame::MessageSent { .. })
    ));

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn remote_typing_shows_and_clears_on_stop() {
    let (handle, mut events, server) = spawn_ready().await;

    assert!(
        server
            .push(ServerFrame::TypingStarted {
                sender_id: UserId::new("bob"),
            })
            .await
    );
    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::RemoteTyping { active: true }
    );

    assert!(
        server
            .push(ServerFrame::TypingStopped {
                sender_id: UserId::new("bob"),
            })
            .await
    );
    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::RemoteTyping { active: false }
    );

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn remote_typing_times_out_when_stop_frame_is_lost() {
    let (handle, mut events, server) = spawn_ready().await;

    assert!(
        server
            .push(ServerFrame::TypingStarted {
                sender_id: UserId::new("bob"),
            })
            .await
    );
    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::RemoteTyping { active: true }
    );

    // No stop frame ever arrives. The display clears on its own once the
    // timeout deadline fires.
    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::RemoteTyping { active: false }
    );

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn own_typing_frames_are_ignored() {
    let (handle, mut events, server) = spawn_ready().await;

    // A server bug (or reconnect race) reflects alice's own typing back.
    assert!(
        server
            .push(ServerFrame::TypingStarted {
                sender_id: UserId::new("alice"),
            })
            .await
    );
    // Bob's typing right after is the first event the session emits.
    assert!(
        server
            .push(ServerFrame::TypingStarted {
                sender_id: UserId::new("bob"),
            })
            .await
    );
    assert_eq!(
        next_event(&mut events).await,
        ChatEvent::RemoteTyping { active: true }
    );

    handle.shutdown().await;
}
