use thiserror::Error;

/// Top-level error for the chat client core.
/// All variants carry a human-readable message for display/logging.
#[derive(Debug, Error)]
pub enum ChatError {
    // ── Store errors ─────────────────────────────────────────────────────────
    #[error("Conversation '{id}' not found")]
    ConversationNotFound { id: String },

    #[error("Message '{message_id}' not found in conversation '{conversation_id}'")]
    MessageNotFound { conversation_id: String, message_id: String },

    #[error("Message '{message_id}' content can no longer be edited")]
    MessageLocked { message_id: String },

    #[error("Message '{message_id}' is not streaming")]
    MessageNotStreaming { message_id: String },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    // ── Transport / remote errors ────────────────────────────────────────────
    #[error("Stream transport failed: {message}")]
    Transport { message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote API returned {status}: {message}")]
    Remote { status: u16, message: String },

    // ── Session errors ───────────────────────────────────────────────────────
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Streaming session was cancelled")]
    SessionCancelled,

    #[error("Conversation '{conversation_id}' is no longer selected")]
    SessionDetached { conversation_id: String },

    // ── Cache / config errors ────────────────────────────────────────────────
    #[error("State cache I/O failed: {0}")]
    Cache(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid value '{value}' for {key}")]
    InvalidConfig { key: String, value: String },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl ChatError {
    pub fn transport(message: impl Into<String>) -> Self {
        ChatError::Transport { message: message.into() }
    }

    pub fn conversation_not_found(id: &str) -> Self {
        ChatError::ConversationNotFound { id: id.to_string() }
    }

    pub fn message_not_found(conversation_id: &str, message_id: &str) -> Self {
        ChatError::MessageNotFound {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ChatError::ConversationNotFound { .. } | ChatError::MessageNotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ChatError::EmptyField { .. } | ChatError::FieldTooLong { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ChatError::Transport { .. } | ChatError::Http(_) | ChatError::Remote { .. })
    }
}
