//! Per-conversation state: participants and message history.
//!
//! The [`HubRegistry`] maps conversation ids to their hub. Each hub holds
//! the connected participants (one socket per user) and the authoritative
//! message history the server pages out of for `query_messages`.

use std::collections::HashMap;

use axum::extract::ws::Message as WsMessage;
use tokio::sync::{RwLock, mpsc};

use blindly_proto::frame::{MessageQuery, ReactionPayload};
use blindly_proto::message::{
    ConversationId, Message, MessageDraft, MessageId, Reaction, Timestamp, UserId,
};

/// Default bound on retained history per conversation.
const DEFAULT_MAX_HISTORY: usize = 1000;

/// Outbound channel to one participant's WebSocket writer task.
pub type ParticipantSender = mpsc::UnboundedSender<WsMessage>;

/// State for one live conversation.
#[derive(Default)]
struct ConversationHub {
    /// One writer channel per connected user.
    participants: HashMap<UserId, ParticipantSender>,
    /// Authoritative history, oldest to newest.
    history: Vec<Message>,
}

/// Registry of all live conversations.
pub struct HubRegistry {
    hubs: RwLock<HashMap<ConversationId, ConversationHub>>,
    max_history: usize,
}

impl Default for HubRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HubRegistry {
    /// Creates an empty registry with the default history bound.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    /// Creates an empty registry retaining at most `max_history` messages
    /// per conversation.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            max_history,
        }
    }

    /// Registers a participant's writer channel.
    ///
    /// A newcomer displaces any existing socket for the same user; the old
    /// sender is returned so the caller can close it.
    pub async fn join(
        &self,
        conversation: &ConversationId,
        user: &UserId,
        sender: ParticipantSender,
    ) -> Option<ParticipantSender> {
        let mut hubs = self.hubs.write().await;
        hubs.entry(conversation.clone())
            .or_default()
            .participants
            .insert(user.clone(), sender)
    }

    /// Removes a participant. The conversation's history is kept so a
    /// reconnecting client can still page through it.
    pub async fn leave(&self, conversation: &ConversationId, user: &UserId) {
        let mut hubs = self.hubs.write().await;
        if let Some(hub) = hubs.get_mut(conversation) {
            hub.participants.remove(user);
        }
    }

    /// All connected participants of a conversation.
    pub async fn participants(
        &self,
        conversation: &ConversationId,
    ) -> Vec<(UserId, ParticipantSender)> {
        let hubs = self.hubs.read().await;
        hubs.get(conversation).map_or_else(Vec::new, |hub| {
            hub.participants
                .iter()
                .map(|(user, tx)| (user.clone(), tx.clone()))
                .collect()
        })
    }

    /// Turns a draft into an authoritative message and records it.
    ///
    /// The server assigns the id and timestamp and echoes the draft's
    /// client key back so the sender can resolve its optimistic entry. The
    /// `received` flag reflects whether the counterpart is connected right
    /// now.
    pub async fn record_message(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        draft: MessageDraft,
    ) -> Message {
        let mut hubs = self.hubs.write().await;
        let hub = hubs.entry(conversation.clone()).or_default();
        let counterpart_online = hub
            .participants
            .keys()
            .any(|user| user != sender);

        let message = Message {
            id: MessageId::generate(),
            client_key: Some(draft.client_key),
            sender_id: sender.clone(),
            kind: draft.kind,
            content: draft.content,
            media: draft.media,
            reactions: Vec::new(),
            received: counterpart_online,
            seen: false,
            created_at: Timestamp::now(),
        };
        hub.history.push(message.clone());
        if hub.history.len() > self.max_history {
            let excess = hub.history.len() - self.max_history;
            hub.history.drain(..excess);
        }
        message
    }

    /// Answers a history query: up to `limit` messages oldest to newest,
    /// ending just before `before_id` when given.
    pub async fn query(
        &self,
        conversation: &ConversationId,
        query: &MessageQuery,
    ) -> Vec<Message> {
        let hubs = self.hubs.read().await;
        let Some(hub) = hubs.get(conversation) else {
            return Vec::new();
        };
        let mut messages: Vec<Message> = hub.history.clone();

        if let Some(before) = &query.before_id {
            let Some(cut) = messages.iter().position(|m| m.id == *before) else {
                return Vec::new();
            };
            messages.truncate(cut);
        }

        let start = messages.len().saturating_sub(query.limit);
        messages.split_off(start)
    }

    /// Flips the seen flag on the reporter's counterpart messages. Own
    /// messages in the list are ignored; a client cannot mark its own
    /// sends seen. Returns the ids that actually changed.
    pub async fn mark_seen(
        &self,
        conversation: &ConversationId,
        reporter: &UserId,
        ids: &[MessageId],
    ) -> Vec<MessageId> {
        let mut hubs = self.hubs.write().await;
        let Some(hub) = hubs.get_mut(conversation) else {
            return Vec::new();
        };
        let mut changed = Vec::new();
        for message in &mut hub.history {
            if ids.contains(&message.id) && message.sender_id != *reporter && !message.seen {
                message.seen = true;
                message.received = true;
                changed.push(message.id.clone());
            }
        }
        changed
    }

    /// Adds a reaction to a message, deduplicated per (user, emoji).
    /// Returns the updated message, or `None` if the message is unknown.
    pub async fn add_reaction(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        payload: &ReactionPayload,
    ) -> Option<Message> {
        let mut hubs = self.hubs.write().await;
        let hub = hubs.get_mut(conversation)?;
        let message = hub
            .history
            .iter_mut()
            .find(|m| m.id == payload.message_id)?;

        let duplicate = message
            .reactions
            .iter()
            .any(|r| r.sender_id == *sender && r.emoji == payload.emoji);
        if !duplicate {
            message.reactions.push(Reaction {
                id: uuid::Uuid::now_v7().to_string(),
                sender_id: sender.clone(),
                emoji: payload.emoji.clone(),
                created_at: Timestamp::now(),
            });
        }
        Some(message.clone())
    }

    /// Removes the sender's matching reaction from a message. Returns the
    /// updated message, or `None` if the message is unknown.
    pub async fn remove_reaction(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        payload: &ReactionPayload,
    ) -> Option<Message> {
        let mut hubs = self.hubs.write().await;
        let hub = hubs.get_mut(conversation)?;
        let message = hub
            .history
            .iter_mut()
            .find(|m| m.id == payload.message_id)?;

        message
            .reactions
            .retain(|r| !(r.sender_id == *sender && r.emoji == payload.emoji));
        Some(message.clone())
    }

    /// Drops a conversation entirely: participants and history.
    pub async fn end(&self, conversation: &ConversationId) {
        let mut hubs = self.hubs.write().await;
        hubs.remove(conversation);
    }
}
