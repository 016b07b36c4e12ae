//! Message model for the Blindly chat protocol.
//!
//! All types in this module represent the on-the-wire format for chat data
//! exchanged between a client and the chat server. They serialize as JSON
//! with the field names the server expects.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message body size in bytes (4 KB).
pub const MAX_CONTENT_SIZE: usize = 4 * 1024;

/// Server-assigned identifier for a message.
///
/// Opaque to the client. The development server issues UUID v7 strings,
/// but nothing in the client may rely on that.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an existing server-issued identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh time-ordered identifier (UUID v7).
    ///
    /// Used by the server when recording a new message.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a conversation between two matched users.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wraps an existing conversation identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a user. Issued by the authentication service, opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Wraps an existing user identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated idempotency key attached to an outgoing draft.
///
/// The server echoes the key verbatim on the confirmed message, which lets
/// the client resolve its optimistic entry even when the user sends two
/// identical texts back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientKey(Uuid);

impl ClientKey {
    /// Generates a new key (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ClientKey` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ClientKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp. Server-issued timestamps are
/// authoritative for message ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// What kind of content a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text body.
    #[default]
    Text,
    /// Image attachment(s) with optional caption.
    Image,
    /// Video attachment(s).
    Video,
    /// Audio clip.
    Audio,
    /// Generic file attachment.
    File,
}

/// Kind of an attached media object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Still image.
    Image,
    /// Video clip.
    Video,
    /// Audio clip.
    Audio,
    /// Anything else.
    File,
}

/// A media object attached to a message. Upload and storage are external;
/// the protocol only carries references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    /// Server-assigned media identifier.
    pub id: String,
    /// Media kind.
    #[serde(rename = "type")]
    pub kind: MediaKind,
    /// Download URL for the stored object.
    pub url: String,
    /// When the media record was created.
    pub created_at: Timestamp,
}

/// An emoji reaction left on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    /// Server-assigned reaction identifier.
    pub id: String,
    /// Who reacted.
    pub sender_id: UserId,
    /// The emoji itself.
    #[serde(rename = "content")]
    pub emoji: String,
    /// When the reaction was created.
    pub created_at: Timestamp,
}

/// A confirmed chat message as the server serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned identifier, authoritative once present.
    pub id: MessageId,
    /// Idempotency key from the originating draft, echoed verbatim.
    /// Absent for messages sent by clients that do not supply one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<ClientKey>,
    /// Who sent the message.
    pub sender_id: UserId,
    /// Content kind.
    #[serde(default)]
    pub kind: MessageKind,
    /// Text body. May be empty for pure media messages.
    #[serde(default)]
    pub content: String,
    /// Attached media references, in display order.
    #[serde(default)]
    pub media: Vec<Media>,
    /// Reactions left on this message. Insertion order is irrelevant.
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// Whether the recipient's device has received the message.
    #[serde(default)]
    pub received: bool,
    /// Whether the recipient has viewed the message.
    #[serde(default)]
    pub seen: bool,
    /// Server-issued creation time; authoritative for ordering.
    pub created_at: Timestamp,
}

impl Message {
    /// Whether the message has anything to render.
    ///
    /// Empty payloads (no trimmed text, no media) are heartbeat noise and
    /// get dropped before they reach a timeline.
    #[must_use]
    pub fn has_renderable_content(&self) -> bool {
        !self.content.trim().is_empty() || !self.media.is_empty()
    }

    /// Total ordering key for timeline placement: creation time first,
    /// identifier as the tiebreaker.
    #[must_use]
    pub fn ordering_key(&self) -> (Timestamp, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// Error returned when a draft fails validation before transmission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Draft has no trimmed text and no media.
    #[error("message has no content")]
    Empty,
    /// Body exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the body in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// An outgoing message before the server has confirmed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    /// Idempotency key, generated client-side per draft.
    pub client_key: ClientKey,
    /// Content kind.
    #[serde(default)]
    pub kind: MessageKind,
    /// Text body.
    #[serde(default)]
    pub content: String,
    /// Attached media references.
    #[serde(default)]
    pub media: Vec<Media>,
}

impl MessageDraft {
    /// Creates a plain text draft with a fresh idempotency key.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            client_key: ClientKey::new(),
            kind: MessageKind::Text,
            content: content.into(),
            media: Vec::new(),
        }
    }

    /// Validates this draft for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if the trimmed body is empty and
    /// no media is attached, or [`ValidationError::TooLarge`] if the body
    /// exceeds [`MAX_CONTENT_SIZE`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() && self.media.is_empty() {
            return Err(ValidationError::Empty);
        }
        let size = self.content.len();
        if size > MAX_CONTENT_SIZE {
            return Err(ValidationError::TooLarge {
                size,
                max: MAX_CONTENT_SIZE,
            });
        }
        Ok(())
    }
}
