//! Property-based tests for timeline reconciliation.
//!
//! Uses proptest to verify:
//! 1. Any interleaving of live deliveries and history batches yields a
//!    strictly ordered, id-unique timeline with no empty payloads.
//! 2. Merging is idempotent: replaying everything as one history batch
//!    changes nothing.
//! 3. Echo resolution never grows the list: n staged drafts plus their n
//!    echoes, in any order, resolve to exactly n confirmed entries.

use proptest::prelude::*;

use blindly_chat::timeline::Timeline;
use blindly_proto::message::{
    Message, MessageDraft, MessageId, MessageKind, Timestamp, UserId,
};

// --- Strategies ---

/// A server-side message drawn from a small id space so that re-delivery
/// and in-place replacement actually happen.
fn arb_server_message() -> impl Strategy<Value = Message> {
    (0..20u32, 0..10u64, any::<bool>(), prop_oneof![Just(String::new()), "[a-z]{1,8}"]).prop_map(
        |(id, ts, from_bob, content)| Message {
            id: MessageId::new(format!("m{id}")),
            client_key: None,
            sender_id: UserId::new(if from_bob { "bob" } else { "alice" }),
            kind: MessageKind::Text,
            content,
            media: Vec::new(),
            reactions: Vec::new(),
            received: true,
            seen: true,
            created_at: Timestamp::from_millis(ts * 100),
        },
    )
}

#[derive(Debug, Clone)]
enum MergeOp {
    Live(Message),
    History(Vec<Message>),
}

fn arb_merge_ops() -> impl Strategy<Value = Vec<MergeOp>> {
    prop::collection::vec(
        prop_oneof![
            arb_server_message().prop_map(MergeOp::Live),
            prop::collection::vec(arb_server_message(), 0..5).prop_map(MergeOp::History),
        ],
        0..20,
    )
}

fn apply_all(timeline: &mut Timeline, ops: Vec<MergeOp>) {
    for op in ops {
        match op {
            MergeOp::Live(message) => {
                timeline.apply_live(message);
            }
            MergeOp::History(batch) => {
                timeline.apply_history(batch);
            }
        }
    }
}

// --- Properties ---

proptest! {
    #[test]
    fn any_interleaving_yields_ordered_unique_timeline(ops in arb_merge_ops()) {
        let mut timeline = Timeline::new(UserId::new("alice"));
        apply_all(&mut timeline, ops);

        let snapshot = timeline.snapshot();
        for pair in snapshot.windows(2) {
            prop_assert!(pair[0].ordering_key() < pair[1].ordering_key());
        }
        for message in &snapshot {
            prop_assert!(message.has_renderable_content());
        }
    }

    #[test]
    fn replaying_the_merge_is_idempotent(ops in arb_merge_ops()) {
        let mut timeline = Timeline::new(UserId::new("alice"));
        apply_all(&mut timeline, ops);

        let before = timeline.snapshot();
        let merged = timeline.apply_history(before.clone());

        prop_assert_eq!(merged, 0);
        prop_assert_eq!(timeline.snapshot(), before);
    }

    #[test]
    fn echo_resolution_never_grows_the_list(
        (count, order) in (1..8usize).prop_flat_map(|n| {
            (Just(n), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        })
    ) {
        let mut timeline = Timeline::new(UserId::new("alice"));

        // Stage n drafts with identical bodies, worst case for matching.
        let mut keys = Vec::new();
        for i in 0..count {
            let draft = MessageDraft::text("you up?");
            keys.push(draft.client_key);
            prop_assert!(
                timeline
                    .push_pending(&draft, Timestamp::from_millis(i as u64))
                    .is_ok()
            );
        }
        prop_assert_eq!(timeline.pending_count(), count);

        // Echoes arrive in an arbitrary order.
        for &i in &order {
            let echo = Message {
                id: MessageId::new(format!("srv-{i}")),
                client_key: Some(keys[i]),
                sender_id: UserId::new("alice"),
                kind: MessageKind::Text,
                content: "you up?".to_string(),
                media: Vec::new(),
                reactions: Vec::new(),
                received: true,
                seen: false,
                created_at: Timestamp::from_millis(1_000 + i as u64),
            };
            timeline.apply_live(echo);
        }

        prop_assert_eq!(timeline.len(), count);
        prop_assert_eq!(timeline.pending_count(), 0);
    }
}
