use std::fmt;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::ChatError;

/// Lifecycle of one assistant reply.
///
/// `Completed`, `Errored` and `Cancelled` are absorbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Completed,
    Errored(String),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Errored(_) | SessionState::Cancelled)
    }

    fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "completed",
            SessionState::Errored(_) => "errored",
            SessionState::Cancelled => "cancelled",
        }
    }

    fn can_advance_to(&self, next: &SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Idle, SessionState::Starting)
                | (SessionState::Starting, SessionState::Streaming)
                | (SessionState::Starting, SessionState::Errored(_))
                | (SessionState::Streaming, SessionState::Completed)
                | (SessionState::Streaming, SessionState::Errored(_))
        ) || (!self.is_terminal() && *next == SessionState::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State machine for a single session. Not reusable: once terminal, every
/// further transition is rejected.
#[derive(Debug)]
pub struct StreamingSession {
    id: Uuid,
    state: SessionState,
}

impl Default for StreamingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingSession {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4(), state: SessionState::Idle }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn advance(&mut self, next: SessionState) -> Result<(), ChatError> {
        if !self.state.can_advance_to(&next) {
            return Err(ChatError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Moves to `Cancelled` unless already terminal. Returns whether it moved.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Cancelled;
        true
    }
}

/// What the outside world can see of the running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub conversation_id: String,
    pub message_id: String,
    pub token: CancellationToken,
}

/// Final report of a `send_user_message` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub conversation_id: String,
    pub message_id: String,
    pub state: SessionState,
}
