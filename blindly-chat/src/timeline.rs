//! Timeline reconciliation.
//!
//! The [`Timeline`] is the single source of truth for what a conversation
//! shows: it merges three producers (optimistic local sends, live inbound
//! frames, and paginated history loads) into one ordered, deduplicated
//! list. It is plain synchronous data, owned exclusively by the session
//! task; all mutation is serialized there.

use blindly_proto::message::{
    ClientKey, Message, MessageDraft, MessageId, Timestamp, UserId, ValidationError,
};

/// Whether an entry is still waiting for its server echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Optimistic local send, not yet confirmed. Its message id is a local
    /// placeholder and must never be persisted.
    Pending,
    /// Confirmed by the server; the message id is authoritative.
    Confirmed,
}

/// One row of the conversation view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    /// Confirmation state.
    pub status: EntryStatus,
    /// The message itself. For pending entries the id is a placeholder
    /// derived from the draft's client key.
    pub message: Message,
}

impl TimelineEntry {
    /// Whether this entry is still unconfirmed.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self.status, EntryStatus::Pending)
    }
}

/// What merging one inbound message did to the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// An entry with the same authoritative id was replaced in place.
    Replaced,
    /// A pending entry resolved to this authoritative message.
    Confirmed {
        /// The client key of the resolved draft.
        client_key: Option<ClientKey>,
        /// Index of the entry after the merge.
        position: usize,
    },
    /// The message was new and appended.
    Appended,
    /// The message carried nothing renderable and was dropped.
    DroppedEmpty,
}

/// Ordered, deduplicated message list for one conversation.
#[derive(Debug)]
pub struct Timeline {
    self_id: UserId,
    entries: Vec<TimelineEntry>,
    /// Newest counterpart message id included in the last seen report.
    /// Guards against re-sending `mark_seen` on every render.
    last_seen_sent: Option<MessageId>,
}

impl Timeline {
    /// Creates an empty timeline for a conversation viewed by `self_id`.
    #[must_use]
    pub const fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            entries: Vec::new(),
            last_seen_sent: None,
        }
    }

    /// All entries, oldest to newest.
    #[must_use]
    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Clones the ordered message list for rendering.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Number of entries, pending included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the timeline has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries still awaiting their echo.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    /// Stages an optimistic entry for an outgoing draft.
    ///
    /// The entry becomes visible immediately with a placeholder id and the
    /// local clock as its timestamp; both are replaced wholesale when the
    /// echo arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for drafts that must not be transmitted
    /// (whitespace-only, oversized). The timeline is not mutated in that
    /// case.
    pub fn push_pending(
        &mut self,
        draft: &MessageDraft,
        now: Timestamp,
    ) -> Result<(), ValidationError> {
        draft.validate()?;
        self.entries.push(TimelineEntry {
            status: EntryStatus::Pending,
            message: Message {
                id: MessageId::new(draft.client_key.to_string()),
                client_key: Some(draft.client_key),
                sender_id: self.self_id.clone(),
                kind: draft.kind,
                content: draft.content.clone(),
                media: draft.media.clone(),
                reactions: Vec::new(),
                received: false,
                seen: false,
                created_at: now,
            },
        });
        self.sort_entries();
        Ok(())
    }

    /// Merges one live inbound message.
    ///
    /// Resolution order: same authoritative id replaces in place, then a
    /// matching pending entry is confirmed in place, then renderable
    /// messages are appended, and empty payloads are dropped.
    pub fn apply_live(&mut self, message: Message) -> MergeOutcome {
        if let Some(i) = self.position_of(&message.id) {
            self.entries[i] = TimelineEntry {
                status: EntryStatus::Confirmed,
                message,
            };
            self.sort_entries();
            return MergeOutcome::Replaced;
        }

        if let Some(i) = self.matching_pending(&message) {
            let client_key = self.entries[i].message.client_key;
            let id = message.id.clone();
            self.entries[i] = TimelineEntry {
                status: EntryStatus::Confirmed,
                message,
            };
            self.sort_entries();
            let position = self.position_of(&id).unwrap_or(i);
            return MergeOutcome::Confirmed {
                client_key,
                position,
            };
        }

        if !message.has_renderable_content() {
            return MergeOutcome::DroppedEmpty;
        }

        self.entries.push(TimelineEntry {
            status: EntryStatus::Confirmed,
            message,
        });
        self.sort_entries();
        MergeOutcome::Appended
    }

    /// Merges a history batch. Returns how many entries were added or
    /// resolved; pure re-deliveries and empty payloads do not count.
    ///
    /// A batch can never reintroduce a pending entry that has already
    /// resolved: its id now matches the confirmed entry and is replaced in
    /// place.
    pub fn apply_history(&mut self, batch: Vec<Message>) -> usize {
        let mut merged = 0;
        for message in batch {
            if let Some(i) = self.position_of(&message.id) {
                self.entries[i] = TimelineEntry {
                    status: EntryStatus::Confirmed,
                    message,
                };
            } else if let Some(i) = self.matching_pending(&message) {
                self.entries[i] = TimelineEntry {
                    status: EntryStatus::Confirmed,
                    message,
                };
                merged += 1;
            } else if message.has_renderable_content() {
                self.entries.push(TimelineEntry {
                    status: EntryStatus::Confirmed,
                    message,
                });
                merged += 1;
            } else {
                tracing::debug!("dropping empty payload from history batch");
            }
        }
        self.sort_entries();
        merged
    }

    /// Replaces an already-known message in place (flag changes, reaction
    /// updates, edits). Returns `false` when the message is unknown; an
    /// update for a message we never displayed is ignored.
    pub fn apply_update(&mut self, message: Message) -> bool {
        if let Some(i) = self.position_of(&message.id) {
            self.entries[i] = TimelineEntry {
                status: EntryStatus::Confirmed,
                message,
            };
            self.sort_entries();
            return true;
        }
        if let Some(i) = self.matching_pending(&message) {
            self.entries[i] = TimelineEntry {
                status: EntryStatus::Confirmed,
                message,
            };
            self.sort_entries();
            return true;
        }
        false
    }

    /// Marks the listed messages as seen (and received). Returns how many
    /// entries changed.
    pub fn apply_seen(&mut self, ids: &[MessageId]) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            if ids.contains(&entry.message.id) && !entry.message.seen {
                entry.message.seen = true;
                entry.message.received = true;
                changed += 1;
            }
        }
        changed
    }

    /// Seen-state convergence: returns the ids to report as seen, or
    /// `None` when there is nothing new.
    ///
    /// At most one report is produced per distinct newest unseen inbound
    /// message; repeated calls with no new inbound message return `None`.
    /// Returned ids are flipped to seen locally so the view converges
    /// before the server confirms.
    pub fn next_seen_batch(&mut self) -> Option<Vec<MessageId>> {
        let unseen: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|e| {
                !e.is_pending() && e.message.sender_id != self.self_id && !e.message.seen
            })
            .map(|e| e.message.id.clone())
            .collect();

        let newest = unseen.last()?.clone();
        if self.last_seen_sent.as_ref() == Some(&newest) {
            return None;
        }
        self.last_seen_sent = Some(newest);

        for entry in &mut self.entries {
            if unseen.contains(&entry.message.id) {
                entry.message.seen = true;
            }
        }
        Some(unseen)
    }

    /// Oldest confirmed message id, used as the pagination cursor for
    /// "load older" requests.
    #[must_use]
    pub fn oldest_confirmed_id(&self) -> Option<MessageId> {
        self.entries
            .iter()
            .find(|e| !e.is_pending())
            .map(|e| e.message.id.clone())
    }

    /// Rebuilds drafts for all still-pending entries, oldest first. Used
    /// to retransmit unconfirmed sends after a reconnect.
    #[must_use]
    pub fn pending_drafts(&self) -> Vec<MessageDraft> {
        self.entries
            .iter()
            .filter(|e| e.is_pending())
            .filter_map(|e| {
                let client_key = e.message.client_key?;
                Some(MessageDraft {
                    client_key,
                    kind: e.message.kind,
                    content: e.message.content.clone(),
                    media: e.message.media.clone(),
                })
            })
            .collect()
    }

    /// Index of the confirmed entry with this authoritative id.
    fn position_of(&self, id: &MessageId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.is_pending() && e.message.id == *id)
    }

    /// Index of the pending entry this echo resolves, if any.
    ///
    /// Matches by client key when the echo carries one, otherwise falls
    /// back to sender + trimmed body equality (oldest pending first).
    fn matching_pending(&self, message: &Message) -> Option<usize> {
        if message.sender_id != self.self_id {
            return None;
        }
        if let Some(key) = message.client_key {
            return self
                .entries
                .iter()
                .position(|e| e.is_pending() && e.message.client_key == Some(key));
        }
        let body = message.content.trim();
        self.entries
            .iter()
            .position(|e| e.is_pending() && e.message.content.trim() == body)
    }

    /// Re-derives list order from timestamps; ids break ties so the order
    /// is total. Stable, so equal keys never swap.
    fn sort_entries(&mut self) {
        self.entries
            .sort_by(|a, b| a.message.ordering_key().cmp(&b.message.ordering_key()));
    }
}
