//! Typing state coordination.
//!
//! Debounces outgoing typing broadcasts (start on the first keystroke,
//! stop after a quiet interval or immediately on send) and times out the
//! remote typing display when a stop frame is lost. Time is passed in as
//! [`Instant`] so the state machine is fully deterministic in tests; the
//! session `select!`s on [`TypingCoordinator::deadline`].

use std::time::Duration;

use tokio::time::Instant;

/// A typing broadcast the session must transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    /// Broadcast `typing_started`.
    Start,
    /// Broadcast `typing_stopped`.
    Stop,
}

/// What expired when a deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeadlineOutcome {
    /// The local quiet interval elapsed; broadcast a stop.
    pub local_stopped: bool,
    /// The remote typing display timed out; clear it.
    pub remote_cleared: bool,
}

/// Per-conversation typing state, local and remote.
#[derive(Debug)]
pub struct TypingCoordinator {
    quiet_interval: Duration,
    remote_timeout: Duration,
    /// While `Some`, the local user counts as typing until this instant.
    local_until: Option<Instant>,
    /// While `Some`, the counterpart is shown as typing until this instant.
    remote_until: Option<Instant>,
}

impl TypingCoordinator {
    /// Creates a coordinator with the given local quiet interval and
    /// remote display timeout.
    #[must_use]
    pub const fn new(quiet_interval: Duration, remote_timeout: Duration) -> Self {
        Self {
            quiet_interval,
            remote_timeout,
            local_until: None,
            remote_until: None,
        }
    }

    /// Records a local keystroke. Returns [`TypingSignal::Start`] on the
    /// first keystroke after idle; further keystrokes only extend the
    /// quiet deadline.
    pub fn on_input(&mut self, now: Instant) -> Option<TypingSignal> {
        let was_idle = self.local_until.is_none();
        self.local_until = Some(now + self.quiet_interval);
        was_idle.then_some(TypingSignal::Start)
    }

    /// Clears local typing state immediately (message sent, input cleared,
    /// or session shutting down). Returns [`TypingSignal::Stop`] if a stop
    /// broadcast is owed; a stale "typing" must never be left active.
    pub fn stop_local(&mut self) -> Option<TypingSignal> {
        self.local_until.take().map(|_| TypingSignal::Stop)
    }

    /// Records a remote `typing_started`.
    pub fn remote_started(&mut self, now: Instant) {
        self.remote_until = Some(now + self.remote_timeout);
    }

    /// Records a remote `typing_stopped`. Returns `true` if the display
    /// was actually showing.
    pub fn remote_stopped(&mut self) -> bool {
        self.remote_until.take().is_some()
    }

    /// Whether the local user currently counts as typing.
    #[must_use]
    pub const fn is_local_typing(&self) -> bool {
        self.local_until.is_some()
    }

    /// Whether the counterpart should be displayed as typing.
    #[must_use]
    pub fn is_remote_typing(&self, now: Instant) -> bool {
        self.remote_until.is_some_and(|until| until > now)
    }

    /// The next instant at which [`on_deadline`](Self::on_deadline) has
    /// work to do, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match (self.local_until, self.remote_until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Applies any expired deadlines.
    pub fn on_deadline(&mut self, now: Instant) -> DeadlineOutcome {
        let mut outcome = DeadlineOutcome::default();
        if self.local_until.is_some_and(|until| until <= now) {
            self.local_until = None;
            outcome.local_stopped = true;
        }
        if self.remote_until.is_some_and(|until| until <= now) {
            self.remote_until = None;
            outcome.remote_cleared = true;
        }
        outcome
    }
}
