//! Wire frames exchanged over a conversation's WebSocket.
//!
//! Every frame is a JSON object tagged by an `event` string. The event
//! names match the chat backend's protocol constants, so the same frames
//! work against the production service and the bundled development server.

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageDraft, MessageId, UserId};

/// History page size used when a query omits an explicit limit.
pub const DEFAULT_QUERY_LIMIT: usize = 10;

/// Parameters of a history page request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageQuery {
    /// Maximum number of messages to return.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Return only messages strictly older than this one. Omitted means
    /// "start from the newest".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_id: Option<MessageId>,
}

const fn default_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUERY_LIMIT,
            before_id: None,
        }
    }
}

/// Identifies one reaction on one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionPayload {
    /// Target message.
    pub message_id: MessageId,
    /// The emoji being added or removed.
    #[serde(rename = "reaction")]
    pub emoji: String,
}

/// Frames a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Submit a new message for this conversation.
    MessageSent {
        /// The outgoing draft; the server assigns id and timestamp.
        message: MessageDraft,
    },
    /// Report that the listed messages have been viewed. Idempotent.
    MessageSeen {
        /// Ids of the viewed messages.
        mark_seen: Vec<MessageId>,
    },
    /// Request a page of history. Answered asynchronously with
    /// [`ServerFrame::MessagesQuerySuccess`].
    QueryMessages {
        /// Page parameters.
        message_query: MessageQuery,
    },
    /// The local user started typing.
    TypingStarted,
    /// The local user stopped typing.
    TypingStopped,
    /// Add an emoji reaction to a message.
    ReactionAdded {
        /// Which message, which emoji.
        reaction: ReactionPayload,
    },
    /// Remove one's own emoji reaction from a message.
    ReactionRemoved {
        /// Which message, which emoji.
        reaction: ReactionPayload,
    },
    /// Permanently end the conversation.
    EndChat,
}

/// Frames the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A confirmed message, live. The sender receives its own echo through
    /// this frame as well.
    MessageReceived {
        /// The authoritative message.
        message: Message,
    },
    /// Answer to [`ClientFrame::QueryMessages`].
    MessagesQuerySuccess {
        /// The requested page. Order is server-defined; clients re-sort.
        #[serde(default)]
        message: Vec<Message>,
    },
    /// An already-delivered message changed (delivery flags, edits).
    MessageUpdated {
        /// The updated message, replacing any prior copy wholesale.
        message: Message,
    },
    /// The counterpart viewed the listed messages.
    MessageSeen {
        /// Ids of the messages now seen.
        mark_seen: Vec<MessageId>,
    },
    /// The counterpart started typing.
    TypingStarted {
        /// Who is typing.
        sender_id: UserId,
    },
    /// The counterpart stopped typing.
    TypingStopped {
        /// Who stopped.
        sender_id: UserId,
    },
    /// A reaction was added somewhere in the conversation.
    ReactionAdded {
        /// The affected message with its updated reaction set.
        message: Message,
    },
    /// A reaction was removed.
    ReactionRemoved {
        /// The affected message with its updated reaction set.
        message: Message,
    },
    /// The conversation was ended by a participant.
    EndChat,
    /// A request could not be processed. Non-fatal.
    Error {
        /// Human-readable description.
        error: String,
    },
    /// The connection carries no valid user identity. The server closes
    /// the socket after sending this.
    Unauthorized,
}
