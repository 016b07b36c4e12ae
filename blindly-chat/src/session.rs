//! The chat session task.
//!
//! [`ChatSession::spawn`] starts one background task per open conversation.
//! The task owns the connection, the timeline, and the typing state, and is
//! the only place any of them mutate; the UI talks to it through a
//! [`SessionHandle`] (commands in) and an event channel (typed
//! [`ChatEvent`]s out). Dropping the handle tears the task down.
//!
//! Connection loss is a state, not an error: the task reconnects with
//! capped exponential backoff and keeps staging sends and serving cached
//! history while offline.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use blindly_proto::frame::{ClientFrame, MessageQuery, ReactionPayload, ServerFrame};
use blindly_proto::message::{
    ClientKey, ConversationId, Message, MessageDraft, MessageId, Timestamp, UserId,
    ValidationError,
};

use crate::cache::{MessageCache, ResilientCacheWriter};
use crate::connection::{Connection, ConnectionState, Connector};
use crate::timeline::{MergeOutcome, Timeline};
use crate::typing::{TypingCoordinator, TypingSignal};

/// Backoff schedule for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the backoff delay.
    pub max_delay: Duration,
    /// Give up after this many consecutive failures. `0` retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): doubles each time,
    /// capped, with up to 25% random jitter so two clients that dropped
    /// together do not hammer the server in lockstep.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1_u32 << exp)
            .min(self.max_delay);
        let jitter = rand::rng().random_range(0.0..0.25);
        base.mul_f64(1.0 + jitter).min(self.max_delay)
    }
}

/// Tunables for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Messages per history page, for the initial load and "load older".
    pub history_page_size: usize,
    /// Quiet interval after the last keystroke before typing stops.
    pub typing_quiet: Duration,
    /// How long a remote "typing" display survives without a stop frame.
    pub remote_typing_timeout: Duration,
    /// Command channel capacity.
    pub command_buffer: usize,
    /// Event channel capacity.
    pub event_buffer: usize,
    /// Bound on the failed-cache-write retry queue.
    pub cache_retry_queue: usize,
    /// Reconnect backoff schedule.
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_page_size: 50,
            typing_quiet: Duration::from_secs(2),
            remote_typing_timeout: Duration::from_secs(6),
            command_buffer: 256,
            event_buffer: 256,
            cache_retry_queue: 128,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Commands the UI sends into the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Send a text message.
    Send {
        /// Raw input text; validated before transmission.
        text: String,
    },
    /// Request the next page of older history.
    LoadOlder,
    /// The local user typed something.
    InputChanged,
    /// The conversation view is (still) on screen; converge seen state.
    MarkVisible,
    /// Add a reaction to a message.
    AddReaction {
        /// Target message.
        message_id: MessageId,
        /// Reaction content.
        emoji: String,
    },
    /// Remove a reaction from a message.
    RemoveReaction {
        /// Target message.
        message_id: MessageId,
        /// Reaction content.
        emoji: String,
    },
    /// End the conversation for both sides.
    EndChat,
    /// Stop the session task.
    Shutdown,
}

/// Events the session task publishes to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The connection is live.
    Connected,
    /// The connection dropped; a reconnect is scheduled.
    Disconnected {
        /// Why the connection ended.
        reason: String,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// 1-based attempt counter since the last successful connect.
        attempt: u32,
        /// Backoff delay before the attempt.
        delay: Duration,
    },
    /// An outgoing message was staged optimistically.
    SendStaged {
        /// The draft's idempotency key.
        client_key: ClientKey,
    },
    /// An outgoing message was rejected before transmission.
    SendRejected {
        /// Why the draft is not sendable.
        reason: ValidationError,
    },
    /// A new inbound message was merged into the timeline.
    MessageReceived {
        /// The merged message.
        message: Message,
    },
    /// A pending send resolved to its authoritative echo.
    MessageConfirmed {
        /// Idempotency key of the resolved draft, when the echo carried one.
        client_key: Option<ClientKey>,
        /// The authoritative message.
        message: Message,
    },
    /// A known message changed in place (edit, flags).
    MessageUpdated {
        /// The updated message.
        message: Message,
    },
    /// A history page was merged.
    HistoryLoaded {
        /// How many entries the page actually added or resolved.
        count: usize,
    },
    /// Seen flags changed on the listed messages.
    SeenUpdated {
        /// The affected messages.
        message_ids: Vec<MessageId>,
    },
    /// The counterpart started or stopped typing.
    RemoteTyping {
        /// Whether the indicator should be shown.
        active: bool,
    },
    /// A message's reactions changed.
    ReactionChanged {
        /// The affected message.
        message_id: MessageId,
    },
    /// The conversation was ended; the session task has exited.
    ChatEnded,
    /// A non-fatal problem worth surfacing.
    Error {
        /// Human-readable description.
        detail: String,
    },
}

/// Handle to a running session task.
///
/// Cheap to query: the timeline snapshot and connection state are shared
/// behind mutexes the task only holds for synchronous updates. Dropping
/// the handle closes the command channel, which stops the task.
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    timeline: Arc<parking_lot::Mutex<Timeline>>,
    state: Arc<parking_lot::Mutex<ConnectionState>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Sends a command to the task. Returns `false` if the task is gone.
    pub async fn command(&self, command: SessionCommand) -> bool {
        self.cmd_tx.send(command).await.is_ok()
    }

    /// Stages and sends a text message.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.command(SessionCommand::Send { text: text.into() }).await
    }

    /// Requests the next page of older history.
    pub async fn load_older(&self) -> bool {
        self.command(SessionCommand::LoadOlder).await
    }

    /// Reports a local keystroke.
    pub async fn input_changed(&self) -> bool {
        self.command(SessionCommand::InputChanged).await
    }

    /// Reports that the conversation view is on screen.
    pub async fn mark_visible(&self) -> bool {
        self.command(SessionCommand::MarkVisible).await
    }

    /// Ordered snapshot of the conversation, oldest to newest.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.timeline.lock().snapshot()
    }

    /// Number of sends still awaiting their echo.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.timeline.lock().pending_count()
    }

    /// Current connection lifecycle state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Stops the task and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(SessionCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Entry point for running one conversation.
pub struct ChatSession;

impl ChatSession {
    /// Spawns the session task for one conversation.
    ///
    /// Returns the handle and the event stream. Cached history is loaded
    /// and published before the first connect attempt so the view renders
    /// instantly offline.
    pub fn spawn<K, S>(
        config: SessionConfig,
        connector: K,
        cache: S,
        self_id: UserId,
        conversation: ConversationId,
    ) -> (SessionHandle, mpsc::Receiver<ChatEvent>)
    where
        K: Connector,
        S: MessageCache,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (writer, warn_rx) = ResilientCacheWriter::new(cache, config.cache_retry_queue);

        let timeline = Arc::new(parking_lot::Mutex::new(Timeline::new(self_id.clone())));
        let state = Arc::new(parking_lot::Mutex::new(ConnectionState::Connecting));

        let typing = TypingCoordinator::new(config.typing_quiet, config.remote_typing_timeout);
        let session = SessionState {
            config,
            connector,
            writer,
            warn_rx,
            conversation,
            self_id,
            timeline: Arc::clone(&timeline),
            typing,
            state: Arc::clone(&state),
            cmd_rx,
            event_tx,
        };
        let task = tokio::spawn(session.run());

        (
            SessionHandle {
                cmd_tx,
                timeline,
                state,
                task,
            },
            event_rx,
        )
    }
}

/// Why the connected loop returned.
enum LoopExit {
    Shutdown,
    ChatEnded,
    ConnectionLost(String),
}

struct SessionState<K: Connector, S: MessageCache> {
    config: SessionConfig,
    connector: K,
    writer: ResilientCacheWriter<S>,
    warn_rx: mpsc::Receiver<crate::cache::CacheWarning>,
    conversation: ConversationId,
    self_id: UserId,
    timeline: Arc<parking_lot::Mutex<Timeline>>,
    typing: TypingCoordinator,
    state: Arc<parking_lot::Mutex<ConnectionState>>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: mpsc::Sender<ChatEvent>,
}

impl<K: Connector, S: MessageCache> SessionState<K, S> {
    async fn run(mut self) {
        self.load_cached_tail().await;

        let mut attempt: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.connector.connect(&self.conversation, &self.self_id).await {
                Ok(conn) => {
                    attempt = 0;
                    self.set_state(ConnectionState::Open);
                    self.emit(ChatEvent::Connected);
                    self.on_connected(&conn).await;

                    let exit = self.connected_loop(&conn).await;
                    self.teardown(&conn).await;
                    match exit {
                        LoopExit::Shutdown => {
                            tracing::debug!(conversation = %self.conversation.as_str(), "session shut down");
                            return;
                        }
                        LoopExit::ChatEnded => return,
                        LoopExit::ConnectionLost(reason) => {
                            tracing::info!(reason = %reason, "connection lost, will retry");
                            self.emit(ChatEvent::Disconnected { reason });
                        }
                    }
                }
                Err(e) => {
                    tracing::info!(error = %e, "connect failed");
                    self.set_state(ConnectionState::ClosedRetrying);
                    self.emit(ChatEvent::Disconnected {
                        reason: e.to_string(),
                    });
                }
            }

            attempt += 1;
            if !self.wait_before_retry(attempt).await {
                return;
            }
        }
    }

    /// Publishes the newest cached page before the first connect.
    async fn load_cached_tail(&mut self) {
        match self
            .writer
            .cache()
            .get_messages(&self.conversation, self.config.history_page_size, None)
            .await
        {
            Ok(page) if !page.is_empty() => {
                let count = self.timeline.lock().apply_history(page);
                self.emit(ChatEvent::HistoryLoaded { count });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "cache read failed on startup");
                self.emit(ChatEvent::Error {
                    detail: format!("cache unavailable: {e}"),
                });
            }
        }
    }

    /// Post-connect housekeeping: flush queued cache writes, retransmit
    /// unconfirmed sends, and request the newest history page.
    async fn on_connected(&mut self, conn: &K::Conn) {
        let flushed = self.writer.flush_pending().await;
        if flushed > 0 {
            tracing::debug!(flushed, "recovered queued cache writes");
        }

        let drafts = self.timeline.lock().pending_drafts();
        for draft in drafts {
            self.send_frame(conn, &ClientFrame::MessageSent { message: draft })
                .await;
        }

        self.send_frame(
            conn,
            &ClientFrame::QueryMessages {
                message_query: MessageQuery {
                    limit: self.config.history_page_size,
                    before_id: None,
                },
            },
        )
        .await;
    }

    async fn connected_loop(&mut self, conn: &K::Conn) -> LoopExit {
        loop {
            let deadline = self.typing.deadline();
            tokio::select! {
                frame = conn.recv() => match frame {
                    Ok(frame) => {
                        if let Some(exit) = self.handle_frame(conn, frame).await {
                            return exit;
                        }
                    }
                    Err(e) => return LoopExit::ConnectionLost(e.to_string()),
                },
                command = self.cmd_rx.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => return LoopExit::Shutdown,
                    Some(command) => {
                        if let Some(exit) = self.handle_command(conn, command).await {
                            return exit;
                        }
                    }
                },
                () = sleep_until_opt(deadline) => {
                    self.handle_typing_deadline(conn).await;
                }
                warning = self.warn_rx.recv() => {
                    if let Some(w) = warning {
                        self.emit(ChatEvent::Error {
                            detail: format!("cache degraded: {} ({} writes queued)", w.detail, w.pending),
                        });
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, conn: &K::Conn, frame: ServerFrame) -> Option<LoopExit> {
        match frame {
            ServerFrame::MessageReceived { message } => {
                self.writer.save(&self.conversation, &message).await;
                let from_counterpart = message.sender_id != self.self_id;
                let outcome = self.timeline.lock().apply_live(message.clone());
                match outcome {
                    MergeOutcome::Confirmed { client_key, .. } => {
                        self.emit(ChatEvent::MessageConfirmed {
                            client_key,
                            message,
                        });
                    }
                    MergeOutcome::Appended | MergeOutcome::Replaced => {
                        self.emit(ChatEvent::MessageReceived { message });
                    }
                    MergeOutcome::DroppedEmpty => {
                        tracing::debug!("dropped empty inbound message");
                    }
                }
                if from_counterpart {
                    self.converge_seen(conn).await;
                }
            }
            ServerFrame::MessagesQuerySuccess { message: batch } => {
                self.writer.save_batch(&self.conversation, &batch).await;
                let count = self.timeline.lock().apply_history(batch);
                self.emit(ChatEvent::HistoryLoaded { count });
                self.converge_seen(conn).await;
            }
            ServerFrame::MessageUpdated { message } => {
                self.writer.save(&self.conversation, &message).await;
                if self.timeline.lock().apply_update(message.clone()) {
                    self.emit(ChatEvent::MessageUpdated { message });
                }
            }
            ServerFrame::ReactionAdded { message } | ServerFrame::ReactionRemoved { message } => {
                self.writer.save(&self.conversation, &message).await;
                let message_id = message.id.clone();
                if self.timeline.lock().apply_update(message) {
                    self.emit(ChatEvent::ReactionChanged { message_id });
                }
            }
            ServerFrame::MessageSeen { mark_seen } => {
                let changed = self.timeline.lock().apply_seen(&mark_seen);
                if changed > 0 {
                    if let Some(newest) = mark_seen.last() {
                        if let Err(e) = self
                            .writer
                            .cache()
                            .mark_all_seen_before(&self.conversation, newest)
                            .await
                        {
                            tracing::warn!(error = %e, "cache seen update failed");
                        }
                    }
                    self.emit(ChatEvent::SeenUpdated {
                        message_ids: mark_seen,
                    });
                }
            }
            ServerFrame::TypingStarted { sender_id } => {
                if sender_id != self.self_id {
                    let now = Instant::now();
                    let was_showing = self.typing.is_remote_typing(now);
                    self.typing.remote_started(now);
                    if !was_showing {
                        self.emit(ChatEvent::RemoteTyping { active: true });
                    }
                }
            }
            ServerFrame::TypingStopped { sender_id } => {
                if sender_id != self.self_id && self.typing.remote_stopped() {
                    self.emit(ChatEvent::RemoteTyping { active: false });
                }
            }
            ServerFrame::EndChat => {
                self.emit(ChatEvent::ChatEnded);
                return Some(LoopExit::ChatEnded);
            }
            ServerFrame::Error { error } => {
                tracing::warn!(error = %error, "server reported an error");
                self.emit(ChatEvent::Error { detail: error });
            }
            ServerFrame::Unauthorized => {
                self.emit(ChatEvent::Error {
                    detail: "not authorized for this conversation".into(),
                });
                return Some(LoopExit::ConnectionLost("unauthorized".into()));
            }
        }
        None
    }

    async fn handle_command(
        &mut self,
        conn: &K::Conn,
        command: SessionCommand,
    ) -> Option<LoopExit> {
        match command {
            SessionCommand::Send { text } => {
                let Some(draft) = self.stage_send(text) else {
                    return None;
                };
                if self.typing.stop_local() == Some(TypingSignal::Stop) {
                    self.send_frame(conn, &ClientFrame::TypingStopped).await;
                }
                self.send_frame(conn, &ClientFrame::MessageSent { message: draft })
                    .await;
            }
            SessionCommand::LoadOlder => {
                let before_id = self.timeline.lock().oldest_confirmed_id();
                self.send_frame(
                    conn,
                    &ClientFrame::QueryMessages {
                        message_query: MessageQuery {
                            limit: self.config.history_page_size,
                            before_id,
                        },
                    },
                )
                .await;
            }
            SessionCommand::InputChanged => {
                if self.typing.on_input(Instant::now()) == Some(TypingSignal::Start) {
                    self.send_frame(conn, &ClientFrame::TypingStarted).await;
                }
            }
            SessionCommand::MarkVisible => {
                self.converge_seen(conn).await;
            }
            SessionCommand::AddReaction { message_id, emoji } => {
                self.send_frame(
                    conn,
                    &ClientFrame::ReactionAdded {
                        reaction: ReactionPayload { message_id, emoji },
                    },
                )
                .await;
            }
            SessionCommand::RemoveReaction { message_id, emoji } => {
                self.send_frame(
                    conn,
                    &ClientFrame::ReactionRemoved {
                        reaction: ReactionPayload { message_id, emoji },
                    },
                )
                .await;
            }
            SessionCommand::EndChat => {
                // The server echoes `end_chat` to every participant; the
                // session exits when that echo arrives.
                self.send_frame(conn, &ClientFrame::EndChat).await;
            }
            SessionCommand::Shutdown => return Some(LoopExit::Shutdown),
        }
        None
    }

    /// Commands arriving while disconnected. Sends stage locally and are
    /// retransmitted on reconnect; history is served from the cache.
    async fn handle_offline_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send { text } => {
                self.stage_send(text);
            }
            SessionCommand::LoadOlder => {
                let before_id = self.timeline.lock().oldest_confirmed_id();
                match self
                    .writer
                    .cache()
                    .get_messages(
                        &self.conversation,
                        self.config.history_page_size,
                        before_id.as_ref(),
                    )
                    .await
                {
                    Ok(page) => {
                        let count = self.timeline.lock().apply_history(page);
                        self.emit(ChatEvent::HistoryLoaded { count });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "offline history read failed");
                        self.emit(ChatEvent::Error {
                            detail: format!("cache unavailable: {e}"),
                        });
                    }
                }
            }
            other => {
                tracing::debug!(command = ?other, "dropping command while disconnected");
            }
        }
    }

    /// Validates and stages an outgoing draft. Returns the draft when it
    /// should be transmitted.
    fn stage_send(&mut self, text: String) -> Option<MessageDraft> {
        let draft = MessageDraft::text(text);
        match self
            .timeline
            .lock()
            .push_pending(&draft, Timestamp::now())
        {
            Ok(()) => {
                self.emit(ChatEvent::SendStaged {
                    client_key: draft.client_key,
                });
                Some(draft)
            }
            Err(reason) => {
                self.emit(ChatEvent::SendRejected { reason });
                None
            }
        }
    }

    /// Reports newly visible counterpart messages as seen, at most once
    /// per distinct newest unseen message.
    async fn converge_seen(&mut self, conn: &K::Conn) {
        let Some(ids) = self.timeline.lock().next_seen_batch() else {
            return;
        };
        if let Some(newest) = ids.last() {
            if let Err(e) = self
                .writer
                .cache()
                .mark_all_seen_before(&self.conversation, newest)
                .await
            {
                tracing::warn!(error = %e, "cache seen update failed");
            }
        }
        self.send_frame(
            conn,
            &ClientFrame::MessageSeen {
                mark_seen: ids.clone(),
            },
        )
        .await;
        self.emit(ChatEvent::SeenUpdated { message_ids: ids });
    }

    async fn handle_typing_deadline(&mut self, conn: &K::Conn) {
        let outcome = self.typing.on_deadline(Instant::now());
        if outcome.local_stopped {
            self.send_frame(conn, &ClientFrame::TypingStopped).await;
        }
        if outcome.remote_cleared {
            self.emit(ChatEvent::RemoteTyping { active: false });
        }
    }

    /// Backoff between reconnect attempts. Keeps serving offline commands
    /// while waiting. Returns `false` when the session should stop.
    async fn wait_before_retry(&mut self, attempt: u32) -> bool {
        let cap = self.config.reconnect.max_attempts;
        if cap != 0 && attempt > cap {
            tracing::warn!(attempts = cap, "reconnect attempts exhausted");
            self.emit(ChatEvent::Error {
                detail: "reconnect attempts exhausted".into(),
            });
            return false;
        }

        let delay = self.config.reconnect.delay_for(attempt);
        self.set_state(ConnectionState::ClosedRetrying);
        self.emit(ChatEvent::Reconnecting { attempt, delay });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                command = self.cmd_rx.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => return false,
                    Some(command) => self.handle_offline_command(command).await,
                },
            }
        }
    }

    /// Best-effort connection teardown. A stale "typing" broadcast must
    /// never be left active.
    async fn teardown(&mut self, conn: &K::Conn) {
        if self.typing.stop_local() == Some(TypingSignal::Stop) && conn.is_open() {
            self.send_frame(conn, &ClientFrame::TypingStopped).await;
        }
        conn.close().await;
        self.set_state(ConnectionState::ClosedRetrying);
    }

    async fn send_frame(&self, conn: &K::Conn, frame: &ClientFrame) {
        if let Err(e) = conn.send(frame).await {
            // The recv side of the select loop notices the dead connection
            // and drives the reconnect; nothing to do here.
            tracing::debug!(error = %e, "frame transmit failed");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn emit(&self, event: ChatEvent) {
        if self.event_tx.try_send(event).is_err() {
            tracing::debug!("event channel full or closed, dropping event");
        }
    }
}

/// Sleeps until the instant, or forever when there is no deadline.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
