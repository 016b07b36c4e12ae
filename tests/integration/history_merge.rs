//! Integration tests for history loading and merge.
//!
//! Verifies:
//! 1. Cached history renders before the connection opens.
//! 2. Server pages merge with the cached tail without duplicates.
//! 3. "Load older" pages backwards from the oldest confirmed message.
//! 4. A message delivered both live and in a page stays a single entry.

use std::time::Duration;

use tokio::sync::mpsc;

use blindly_chat::cache::{InMemoryCache, MessageCache};
use blindly_chat::connection::loopback::{LoopbackConnection, LoopbackConnector, ScriptedServer};
use blindly_chat::session::{ChatEvent, ChatSession, SessionConfig, SessionHandle};
use blindly_proto::frame::{ClientFrame, ServerFrame};
use blindly_proto::message::{ConversationId, Message, MessageId, MessageKind, Timestamp, UserId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn conv() -> ConversationId {
    ConversationId::new("c-1")
}

/// Build an already-seen counterpart message so the seen pipeline stays
/// quiet and these tests only exercise merging.
fn seen_message(id: &str, at: u64) -> Message {
    Message {
        id: MessageId::new(id),
        client_key: None,
        sender_id: UserId::new("bob"),
        kind: MessageKind::Text,
        content: format!("message {id}"),
        media: Vec::new(),
        reactions: Vec::new(),
        received: true,
        seen: true,
        created_at: Timestamp::from_millis(at),
    }
}

fn spawn_with_cache(
    cache: InMemoryCache,
) -> (SessionHandle, mpsc::Receiver<ChatEvent>, ScriptedServer) {
    let (conn, server) = LoopbackConnection::create_pair(32);
    let (handle, events) = ChatSession::spawn(
        SessionConfig::default(),
        LoopbackConnector::single(conn),
        cache,
        UserId::new("alice"),
        conv(),
    );
    (handle, events, server)
}

async fn next_event(events: &mut mpsc::Receiver<ChatEvent>) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cached_tail_renders_before_connecting() {
    let cache = InMemoryCache::new();
    for i in 1..=3u64 {
        cache
            .upsert(&conv(), &seen_message(&format!("m{i}"), i * 100))
            .await
            .unwrap();
    }

    let (handle, mut events, server) = spawn_with_cache(cache);

    // Cached page is published before the connection is reported live.
    assert_eq!(next_event(&mut events).await, ChatEvent::HistoryLoaded { count: 3 });
    assert_eq!(next_event(&mut events).await, ChatEvent::Connected);
    assert_eq!(ids(&handle.messages()), vec!["m1", "m2", "m3"]);

    assert!(matches!(
        server.next_client_frame().await,
        Some(ClientFrame::QueryMessages { .. })
    ));

    handle.shutdown().await;
}

#[tokio::test]
async fn server_page_merges_with_cached_tail_without_duplicates() {
    let cache = InMemoryCache::new();
    for i in 1..=3u64 {
        cache
            .upsert(&conv(), &seen_message(&format!("m{i}"), i * 100))
            .await
            .unwrap();
    }

    let (handle, mut events, server) = spawn_with_cache(cache);
    assert_eq!(next_event(&mut events).await, ChatEvent::HistoryLoaded { count: 3 });
    assert_eq!(next_event(&mut events).await, ChatEvent::Connected);
    assert!(matches!(
        server.next_client_frame().await,
        Some(ClientFrame::QueryMessages { .. })
    ));

    // The server's page overlaps the cached tail and adds one new message.
    assert!(
        server
            .push(ServerFrame::MessagesQuerySuccess {
                message: vec![
                    seen_message("m2", 200),
                    seen_message("m3", 300),
                    seen_message("m4", 400),
                ],
            })
            .await
    );

    assert_eq!(next_event(&mut events).await, ChatEvent::HistoryLoaded { count: 1 });
    assert_eq!(ids(&handle.messages()), vec!["m1", "m2", "m3", "m4"]);

    handle.shutdown().await;
}

#[tokio::test]
async fn load_older_pages_backwards_from_oldest() {
    let cache = InMemoryCache::new();
    cache
        .upsert(&conv(), &seen_message("m5", 500))
        .await
        .unwrap();

    let (handle, mut events, server) = spawn_with_cache(cache);
    assert_eq!(next_event(&mut events).await, ChatEvent::HistoryLoaded { count: 1 });
    assert_eq!(next_event(&mut events).await, ChatEvent::Connected);
    assert!(matches!(
        server.next_client_frame().await,
        Some(ClientFrame::QueryMessages { .. })
    ));

    assert!(handle.load_older().await);

    // The request cursors on the oldest confirmed message.
    match server.next_client_frame().await {
        Some(ClientFrame::QueryMessages { message_query }) => {
            assert_eq!(message_query.before_id, Some(MessageId::new("m5")));
        }
        other => panic!("expected QueryMessages, got {other:?}"),
    }

    assert!(
        server
            .push(ServerFrame::MessagesQuerySuccess {
                message: vec![seen_message("m3", 300), seen_message("m4", 400)],
            })
            .await
    );
    assert_eq!(next_event(&mut events).await, ChatEvent::HistoryLoaded { count: 2 });
    assert_eq!(ids(&handle.messages()), vec!["m3", "m4", "m5"]);

    handle.shutdown().await;
}

#[tokio::test]
async fn live_and_history_double_delivery_stays_single() {
    let (handle, mut events, server) = spawn_with_cache(InMemoryCache::new());
    assert_eq!(next_event(&mut events).await, ChatEvent::Connected);
    assert!(matches!(
        server.next_client_frame().await,
        Some(ClientFrame::QueryMessages { .. })
    ));

    // Live delivery first.
    assert!(
        server
            .push(ServerFrame::MessageReceived {
                message: seen_message("m1", 100),
            })
            .await
    );
    match next_event(&mut events).await {
        ChatEvent::MessageReceived { .. } => {}
        other => panic!("expected MessageReceived, got {other:?}"),
    }

    // The same message arrives again inside a history page.
    assert!(
        server
            .push(ServerFrame::MessagesQuerySuccess {
                message: vec![seen_message("m1", 100)],
            })
            .await
    );
    assert_eq!(next_event(&mut events).await, ChatEvent::HistoryLoaded { count: 0 });
    assert_eq!(handle.messages().len(), 1);

    handle.shutdown().await;
}
