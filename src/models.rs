use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// A document cited by an assistant reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentReference {
    pub filename: String,
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "MessageRecord")]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_streaming: bool,
    pub is_complete: bool,
    pub document_references: Vec<DocumentReference>,
    pub related_questions: Vec<String>,
}

/// Wire form of [`Message`]; missing fields take their defaults.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRecord {
    id: String,
    role: MessageRole,
    content: String,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    is_streaming: bool,
    #[serde(default = "default_complete")]
    is_complete: bool,
    #[serde(default)]
    document_references: Vec<DocumentReference>,
    #[serde(default)]
    related_questions: Vec<String>,
}

fn default_complete() -> bool {
    true
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        let mut message = Self {
            id: record.id,
            role: record.role,
            content: record.content,
            timestamp: record.timestamp,
            is_streaming: record.is_streaming,
            is_complete: record.is_complete,
            document_references: record.document_references,
            related_questions: record.related_questions,
        };
        message.settle_flags();
        message
    }
}

impl Message {
    /// Materializes a [`NewMessage`] with a fresh id and timestamp.
    pub fn from_new(new: NewMessage) -> Self {
        let mut message = Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: new.role,
            content: new.content,
            timestamp: Utc::now(),
            is_streaming: new.is_streaming,
            is_complete: new.is_complete,
            document_references: Vec::new(),
            related_questions: Vec::new(),
        };
        message.settle_flags();
        message
    }

    /// A streaming message is never complete.
    pub fn settle_flags(&mut self) {
        if self.is_streaming {
            self.is_complete = false;
        }
    }
}

/// The sender-supplied part of a message; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    role: MessageRole,
    content: String,
    is_streaming: bool,
    is_complete: bool,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into(), is_streaming: false, is_complete: true }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into(), is_streaming: false, is_complete: true }
    }

    /// Empty assistant message that a streaming session fills in.
    pub fn assistant_placeholder() -> Self {
        Self {
            role: MessageRole::Assistant,
            content: String::new(),
            is_streaming: true,
            is_complete: false,
        }
    }
}

/// Partial update for a stored message. Streaming and completion flags are
/// only moved by the store's streaming mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageUpdate {
    pub content: Option<String>,
    pub document_references: Option<Vec<DocumentReference>>,
    pub related_questions: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: String, title: String) -> Self {
        let now = Utc::now();
        Self { id, title, messages: Vec::new(), created_at: now, updated_at: now }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Remote failure kinds carried by `*_error` stream frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Processing,
    Timeout,
    Network,
    Validation,
}

impl RemoteErrorKind {
    pub fn from_type(kind: &str) -> Option<Self> {
        match kind {
            "processing_error" => Some(RemoteErrorKind::Processing),
            "timeout_error" => Some(RemoteErrorKind::Timeout),
            "network_error" => Some(RemoteErrorKind::Network),
            "validation_error" => Some(RemoteErrorKind::Validation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteErrorKind::Processing => "processing_error",
            RemoteErrorKind::Timeout => "timeout_error",
            RemoteErrorKind::Network => "network_error",
            RemoteErrorKind::Validation => "validation_error",
        }
    }
}

/// One decoded frame of the streaming transport.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    ContentChunk(String),
    Completed,
    /// Like `Completed`, and the transport should be torn down.
    Done,
    Thinking(Option<String>),
    /// Any other informational frame; never touches message content.
    Status { kind: String, detail: Option<String> },
    Error { kind: RemoteErrorKind, message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completed | StreamEvent::Done | StreamEvent::Error { .. })
    }
}

/// Auxiliary "what is the stream doing" signal for UI feedback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Started,
    Thinking(Option<String>),
    Info { kind: String, detail: Option<String> },
    Failed(String),
}
