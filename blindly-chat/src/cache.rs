//! Durable per-conversation message cache.
//!
//! The cache renders history instantly before the connection opens and
//! extends pagination past what the live session has fetched. The storage
//! engine is a platform service; [`MessageCache`] is the contract the
//! session requires of it. Only authoritative messages are persisted;
//! pending entries stay in the timeline until their echo arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};

use blindly_proto::message::{ConversationId, Message, MessageId};

/// Errors from the cache backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The backing engine failed.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Contract for a durable, per-conversation message store.
///
/// Upserts are idempotent and keyed by the authoritative message id, so
/// re-delivering a message (live push plus a later history page) leaves a
/// single record.
pub trait MessageCache: Send + Sync + 'static {
    /// Returns up to `limit` messages ordered oldest to newest, ending
    /// just before `before_id` (exclusive), or at the newest message when
    /// `before_id` is `None`. An unknown `before_id` yields an empty page.
    fn get_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
        before_id: Option<&MessageId>,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, CacheError>> + Send;

    /// Inserts or replaces one message.
    fn upsert(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send;

    /// Inserts or replaces a batch of messages.
    fn upsert_batch(
        &self,
        conversation: &ConversationId,
        messages: &[Message],
    ) -> impl std::future::Future<Output = Result<(), CacheError>> + Send;

    /// Flips the seen flag on every cached message at or before the given
    /// message. Returns how many records changed; an unknown id changes
    /// nothing.
    fn mark_all_seen_before(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
    ) -> impl std::future::Future<Output = Result<usize, CacheError>> + Send;

    /// Oldest cached message id for the conversation: the pagination
    /// cursor for requesting further history.
    fn oldest_id(
        &self,
        conversation: &ConversationId,
    ) -> impl std::future::Future<Output = Result<Option<MessageId>, CacheError>> + Send;
}

impl<S: MessageCache> MessageCache for std::sync::Arc<S> {
    async fn get_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
        before_id: Option<&MessageId>,
    ) -> Result<Vec<Message>, CacheError> {
        self.as_ref().get_messages(conversation, limit, before_id).await
    }

    async fn upsert(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> Result<(), CacheError> {
        self.as_ref().upsert(conversation, message).await
    }

    async fn upsert_batch(
        &self,
        conversation: &ConversationId,
        messages: &[Message],
    ) -> Result<(), CacheError> {
        self.as_ref().upsert_batch(conversation, messages).await
    }

    async fn mark_all_seen_before(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
    ) -> Result<usize, CacheError> {
        self.as_ref()
            .mark_all_seen_before(conversation, message_id)
            .await
    }

    async fn oldest_id(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<MessageId>, CacheError> {
        self.as_ref().oldest_id(conversation).await
    }
}

/// In-memory [`MessageCache`] backed by nested maps.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    inner: Mutex<HashMap<ConversationId, HashMap<MessageId, Message>>>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached messages for a conversation.
    pub async fn len(&self, conversation: &ConversationId) -> usize {
        self.inner
            .lock()
            .await
            .get(conversation)
            .map_or(0, HashMap::len)
    }

    /// Whether the conversation has no cached messages.
    pub async fn is_empty(&self, conversation: &ConversationId) -> bool {
        self.len(conversation).await == 0
    }
}

/// Sorted copy of a conversation's messages, oldest to newest.
fn sorted_messages(records: &HashMap<MessageId, Message>) -> Vec<Message> {
    let mut messages: Vec<Message> = records.values().cloned().collect();
    messages.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
    messages
}

impl MessageCache for InMemoryCache {
    async fn get_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
        before_id: Option<&MessageId>,
    ) -> Result<Vec<Message>, CacheError> {
        let inner = self.inner.lock().await;
        let Some(records) = inner.get(conversation) else {
            return Ok(Vec::new());
        };
        let mut messages = sorted_messages(records);

        if let Some(before) = before_id {
            let Some(cut) = messages.iter().position(|m| m.id == *before) else {
                tracing::debug!(before = %before, "pagination cursor not in cache");
                return Ok(Vec::new());
            };
            messages.truncate(cut);
        }

        let start = messages.len().saturating_sub(limit);
        Ok(messages.split_off(start))
    }

    async fn upsert(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().await;
        inner
            .entry(conversation.clone())
            .or_default()
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn upsert_batch(
        &self,
        conversation: &ConversationId,
        messages: &[Message],
    ) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().await;
        let records = inner.entry(conversation.clone()).or_default();
        for message in messages {
            records.insert(message.id.clone(), message.clone());
        }
        Ok(())
    }

    async fn mark_all_seen_before(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
    ) -> Result<usize, CacheError> {
        let mut inner = self.inner.lock().await;
        let Some(records) = inner.get_mut(conversation) else {
            return Ok(0);
        };
        let Some(target) = records.get(message_id) else {
            return Ok(0);
        };
        let cutoff = (target.created_at, target.id.clone());

        let mut changed = 0;
        for message in records.values_mut() {
            if (message.created_at, message.id.clone()) <= cutoff && !message.seen {
                message.seen = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn oldest_id(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<MessageId>, CacheError> {
        let inner = self.inner.lock().await;
        Ok(inner.get(conversation).and_then(|records| {
            records
                .values()
                .min_by(|a, b| a.ordering_key().cmp(&b.ordering_key()))
                .map(|m| m.id.clone())
        }))
    }
}

/// Warning emitted when a cache write fails and gets queued for retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheWarning {
    /// What went wrong.
    pub detail: String,
    /// Queue depth after the failure.
    pub pending: usize,
}

/// Write-through wrapper that survives a flaky cache backend.
///
/// Failed writes are queued (bounded, oldest dropped first) and a warning
/// is emitted on the channel returned by [`new`](Self::new). The session
/// calls [`flush_pending`](Self::flush_pending) after each reconnect.
pub struct ResilientCacheWriter<S> {
    cache: S,
    pending: Mutex<VecDeque<(ConversationId, Message)>>,
    warn_tx: mpsc::Sender<CacheWarning>,
    max_pending: usize,
}

impl<S: MessageCache> ResilientCacheWriter<S> {
    /// Wraps a cache. `max_pending` bounds the retry queue.
    pub fn new(cache: S, max_pending: usize) -> (Self, mpsc::Receiver<CacheWarning>) {
        let (warn_tx, warn_rx) = mpsc::channel(32);
        (
            Self {
                cache,
                pending: Mutex::new(VecDeque::new()),
                warn_tx,
                max_pending,
            },
            warn_rx,
        )
    }

    /// The wrapped cache, for reads.
    pub const fn cache(&self) -> &S {
        &self.cache
    }

    /// Persists one message; on failure, queues it and warns.
    pub async fn save(&self, conversation: &ConversationId, message: &Message) {
        if let Err(e) = self.cache.upsert(conversation, message).await {
            self.queue_failed(conversation, message, &e).await;
        }
    }

    /// Persists a batch; failed batches are queued message by message.
    pub async fn save_batch(&self, conversation: &ConversationId, messages: &[Message]) {
        if let Err(e) = self.cache.upsert_batch(conversation, messages).await {
            for message in messages {
                self.queue_failed(conversation, message, &e).await;
            }
        }
    }

    /// Retries queued writes in order. Stops at the first failure, leaving
    /// the remainder queued. Returns how many writes succeeded.
    pub async fn flush_pending(&self) -> usize {
        let mut flushed = 0;
        loop {
            let next = self.pending.lock().await.pop_front();
            let Some((conversation, message)) = next else {
                return flushed;
            };
            if let Err(e) = self.cache.upsert(&conversation, &message).await {
                tracing::debug!(error = %e, "cache still failing, keeping queue");
                self.pending
                    .lock()
                    .await
                    .push_front((conversation, message));
                return flushed;
            }
            flushed += 1;
        }
    }

    /// Current retry-queue depth.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn queue_failed(
        &self,
        conversation: &ConversationId,
        message: &Message,
        error: &CacheError,
    ) {
        let mut pending = self.pending.lock().await;
        if pending.len() >= self.max_pending {
            pending.pop_front();
        }
        pending.push_back((conversation.clone(), message.clone()));
        let warning = CacheWarning {
            detail: error.to_string(),
            pending: pending.len(),
        };
        drop(pending);
        tracing::warn!(detail = %warning.detail, queued = warning.pending, "cache write failed");
        let _ = self.warn_tx.try_send(warning);
    }
}

/// Cache test double whose writes can be toggled to fail.
#[derive(Debug, Default)]
pub struct FailingCache {
    inner: InMemoryCache,
    fail_writes: AtomicBool,
}

impl FailingCache {
    /// Creates a cache that initially succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles write failure.
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("simulated write failure".into()));
        }
        Ok(())
    }
}

impl MessageCache for FailingCache {
    async fn get_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
        before_id: Option<&MessageId>,
    ) -> Result<Vec<Message>, CacheError> {
        self.inner.get_messages(conversation, limit, before_id).await
    }

    async fn upsert(
        &self,
        conversation: &ConversationId,
        message: &Message,
    ) -> Result<(), CacheError> {
        self.check()?;
        self.inner.upsert(conversation, message).await
    }

    async fn upsert_batch(
        &self,
        conversation: &ConversationId,
        messages: &[Message],
    ) -> Result<(), CacheError> {
        self.check()?;
        self.inner.upsert_batch(conversation, messages).await
    }

    async fn mark_all_seen_before(
        &self,
        conversation: &ConversationId,
        message_id: &MessageId,
    ) -> Result<usize, CacheError> {
        self.check()?;
        self.inner.mark_all_seen_before(conversation, message_id).await
    }

    async fn oldest_id(
        &self,
        conversation: &ConversationId,
    ) -> Result<Option<MessageId>, CacheError> {
        self.inner.oldest_id(conversation).await
    }
}
