use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::content::parse_assistant_content;
use crate::errors::ChatError;
use crate::models::{
    Conversation, DocumentReference, Message, MessageRole, MessageUpdate, NewMessage, StreamStatus,
};

/// Everything the UI reads. Owned by [`ChatStore`]; only its mutations touch it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    pub conversations: Vec<Conversation>,
    pub current_conversation_id: Option<String>,
    pub is_loading: bool,
    pub status: Option<StreamStatus>,
    pub error: Option<String>,
}

impl ChatState {
    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn current_conversation(&self) -> Option<&Conversation> {
        self.current_conversation_id.as_deref().and_then(|id| self.conversation(id))
    }

    /// Messages of the selected conversation, or an empty slice.
    pub fn current_messages(&self) -> &[Message] {
        self.current_conversation().map(|c| c.messages.as_slice()).unwrap_or(&[])
    }

    fn conversation_mut(&mut self, id: &str) -> Result<&mut Conversation, ChatError> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ChatError::conversation_not_found(id))
    }

    fn message_mut(&mut self, conversation_id: &str, message_id: &str) -> Result<&mut Message, ChatError> {
        self.conversation_mut(conversation_id)?
            .message_mut(message_id)
            .ok_or_else(|| ChatError::message_not_found(conversation_id, message_id))
    }

    fn push_chunk(&mut self, conversation_id: &str, message_id: &str, chunk: &str) -> Result<(), ChatError> {
        let message = self.message_mut(conversation_id, message_id)?;
        if !message.is_streaming {
            return Err(ChatError::MessageNotStreaming { message_id: message_id.to_string() });
        }
        message.content.push_str(chunk);
        Ok(())
    }

    fn finish_message(&mut self, conversation_id: &str, message_id: &str) -> Result<(), ChatError> {
        let message = self.message_mut(conversation_id, message_id)?;
        if !message.is_streaming {
            return Err(ChatError::MessageNotStreaming { message_id: message_id.to_string() });
        }
        message.is_streaming = false;
        message.is_complete = true;

        if message.role == MessageRole::Assistant {
            let parsed = parse_assistant_content(&message.content);
            message.content = parsed.content;
            message.document_references.extend(parsed.documents);
            message.related_questions.extend(parsed.related_questions);
        }

        self.conversation_mut(conversation_id)?.touch();
        self.is_loading = false;
        self.status = None;
        Ok(())
    }

    fn record_failure(&mut self, message: &str) {
        self.is_loading = false;
        self.status = Some(StreamStatus::Failed(message.to_string()));
        self.error = Some(message.to_string());
    }
}

/// The part of [`ChatState`] that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub conversations: Vec<Conversation>,
    pub current_conversation_id: Option<String>,
}

impl From<&ChatState> for PersistedState {
    fn from(state: &ChatState) -> Self {
        Self {
            conversations: state.conversations.clone(),
            current_conversation_id: state.current_conversation_id.clone(),
        }
    }
}

impl From<PersistedState> for ChatState {
    fn from(mut persisted: PersistedState) -> Self {
        for conversation in &mut persisted.conversations {
            conversation.messages.iter_mut().for_each(Message::settle_flags);
        }
        let current_conversation_id = persisted
            .current_conversation_id
            .filter(|id| persisted.conversations.iter().any(|c| &c.id == id));
        Self {
            conversations: persisted.conversations,
            current_conversation_id,
            ..ChatState::default()
        }
    }
}

/// Shared handle to the single conversation/message state.
///
/// Clones share the same state. Every mutation is validated first and only
/// a successful one notifies subscribers.
#[derive(Clone)]
pub struct ChatStore {
    state: Arc<watch::Sender<ChatState>>,
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore {
    pub fn new() -> Self {
        Self::with_state(ChatState::default())
    }

    pub fn with_state(state: ChatState) -> Self {
        let (tx, _rx) = watch::channel(state);
        Self { state: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ChatState {
        self.state.borrow().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&self.state.borrow())
    }

    pub fn is_current(&self, conversation_id: &str) -> bool {
        self.read(|s| s.current_conversation_id.as_deref() == Some(conversation_id))
    }

    /// Runs `f` against the state; subscribers hear about it only on `Ok`.
    fn mutate<R>(&self, f: impl FnOnce(&mut ChatState) -> Result<R, ChatError>) -> Result<R, ChatError> {
        let mut outcome = Err(ChatError::Unexpected("store mutation was not applied".to_string()));
        self.state.send_if_modified(|state| {
            outcome = f(state);
            outcome.is_ok()
        });
        outcome
    }

    // ── Conversations ────────────────────────────────────────────────────────

    pub fn create_conversation(&self, title: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let conversation = Conversation::new(id.clone(), title.to_string());
        self.state.send_modify(|state| {
            state.conversations.push(conversation);
            state.current_conversation_id = Some(id.clone());
        });
        debug!("Created conversation {id}");
        id
    }

    pub fn select_conversation(&self, id: &str) -> Result<(), ChatError> {
        self.mutate(|state| {
            if state.conversation(id).is_none() {
                return Err(ChatError::conversation_not_found(id));
            }
            state.current_conversation_id = Some(id.to_string());
            Ok(())
        })
    }

    /// Removes a conversation and its messages. Deleting the current one
    /// leaves nothing selected.
    pub fn delete_conversation(&self, id: &str) -> Result<(), ChatError> {
        self.mutate(|state| {
            let idx = state
                .conversations
                .iter()
                .position(|c| c.id == id)
                .ok_or_else(|| ChatError::conversation_not_found(id))?;
            state.conversations.remove(idx);
            if state.current_conversation_id.as_deref() == Some(id) {
                state.current_conversation_id = None;
            }
            Ok(())
        })
    }

    pub fn rename_conversation(&self, id: &str, title: &str) -> Result<(), ChatError> {
        self.mutate(|state| {
            let conversation = state.conversation_mut(id)?;
            conversation.title = title.to_string();
            conversation.touch();
            Ok(())
        })
    }

    /// Swaps in a message list fetched from the remote API.
    pub fn replace_messages(&self, conversation_id: &str, messages: Vec<Message>) -> Result<(), ChatError> {
        self.mutate(|state| {
            let conversation = state.conversation_mut(conversation_id)?;
            conversation.messages = messages;
            conversation.messages.iter_mut().for_each(Message::settle_flags);
            conversation.touch();
            Ok(())
        })
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    pub fn append_message(&self, conversation_id: &str, message: NewMessage) -> Result<String, ChatError> {
        self.mutate(|state| {
            let conversation = state.conversation_mut(conversation_id)?;
            let message = Message::from_new(message);
            let id = message.id.clone();
            conversation.messages.push(message);
            conversation.touch();
            Ok(id)
        })
    }

    /// Applies a partial update. Content is frozen while a message streams,
    /// and an assistant reply stays frozen once it has completed.
    pub fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        update: MessageUpdate,
    ) -> Result<(), ChatError> {
        self.mutate(|state| {
            let message = state.message_mut(conversation_id, message_id)?;
            let content_frozen =
                message.is_streaming || (message.is_complete && message.role == MessageRole::Assistant);
            if update.content.is_some() && content_frozen {
                return Err(ChatError::MessageLocked { message_id: message_id.to_string() });
            }
            if let Some(content) = update.content {
                message.content = content;
            }
            if let Some(documents) = update.document_references {
                message.document_references = documents;
            }
            if let Some(questions) = update.related_questions {
                message.related_questions = questions;
            }
            Ok(())
        })
    }

    pub fn delete_message(&self, conversation_id: &str, message_id: &str) -> Result<(), ChatError> {
        self.mutate(|state| {
            let conversation = state.conversation_mut(conversation_id)?;
            let idx = conversation
                .messages
                .iter()
                .position(|m| m.id == message_id)
                .ok_or_else(|| ChatError::message_not_found(conversation_id, message_id))?;
            conversation.messages.remove(idx);
            conversation.touch();
            Ok(())
        })
    }

    pub fn add_document_reference(
        &self,
        conversation_id: &str,
        message_id: &str,
        document: DocumentReference,
    ) -> Result<(), ChatError> {
        self.mutate(|state| {
            state.message_mut(conversation_id, message_id)?.document_references.push(document);
            Ok(())
        })
    }

    pub fn add_related_question(
        &self,
        conversation_id: &str,
        message_id: &str,
        question: &str,
    ) -> Result<(), ChatError> {
        self.mutate(|state| {
            state
                .message_mut(conversation_id, message_id)?
                .related_questions
                .push(question.to_string());
            Ok(())
        })
    }

    // ── Streaming ────────────────────────────────────────────────────────────

    pub fn begin_streaming(&self) {
        self.state.send_modify(|state| {
            state.is_loading = true;
            state.status = Some(StreamStatus::Started);
            state.error = None;
        });
    }

    /// Appends one fragment to a message that is still streaming.
    pub fn append_chunk(&self, conversation_id: &str, message_id: &str, chunk: &str) -> Result<(), ChatError> {
        self.mutate(|state| state.push_chunk(conversation_id, message_id, chunk))
    }

    pub fn set_status(&self, status: StreamStatus) {
        self.state.send_modify(|state| state.status = Some(status));
    }

    /// Marks a streaming message complete and splits its attachments out of
    /// the content.
    pub fn complete_streaming(&self, conversation_id: &str, message_id: &str) -> Result<(), ChatError> {
        self.mutate(|state| state.finish_message(conversation_id, message_id))
    }

    /// Records a session-terminal failure. The target message keeps whatever
    /// partial content and flags it had.
    pub fn fail_streaming(&self, message: &str) {
        warn!("Streaming session failed: {message}");
        self.state.send_modify(|state| state.record_failure(message));
    }

    /// Streaming mutations bound to one session's target message.
    pub fn session_writer<'a>(
        &'a self,
        token: &'a CancellationToken,
        conversation_id: &'a str,
        message_id: &'a str,
    ) -> SessionWriter<'a> {
        SessionWriter { store: self, token, conversation_id, message_id }
    }

    pub fn clear_streaming_status(&self) {
        self.state.send_if_modified(|state| {
            let changed = state.is_loading || state.status.is_some();
            state.is_loading = false;
            state.status = None;
            changed
        });
    }

    pub fn set_error(&self, message: &str) {
        self.state.send_modify(|state| state.error = Some(message.to_string()));
    }

    pub fn clear_error(&self) {
        self.state.send_if_modified(|state| state.error.take().is_some());
    }
}

/// Streaming mutations that stop applying once the session is cancelled or
/// its conversation stops being the current one.
///
/// Both conditions are checked under the store's write lock. `cancel` trips
/// the token before it touches the store, so no write from the session can
/// land after it.
pub struct SessionWriter<'a> {
    store: &'a ChatStore,
    token: &'a CancellationToken,
    conversation_id: &'a str,
    message_id: &'a str,
}

impl SessionWriter<'_> {
    fn guarded(&self, f: impl FnOnce(&mut ChatState) -> Result<(), ChatError>) -> Result<(), ChatError> {
        self.store.mutate(|state| {
            if self.token.is_cancelled() {
                return Err(ChatError::SessionCancelled);
            }
            if state.current_conversation_id.as_deref() != Some(self.conversation_id) {
                return Err(ChatError::SessionDetached { conversation_id: self.conversation_id.to_string() });
            }
            f(state)
        })
    }

    pub fn append_chunk(&self, chunk: &str) -> Result<(), ChatError> {
        self.guarded(|state| state.push_chunk(self.conversation_id, self.message_id, chunk))
    }

    pub fn set_status(&self, status: StreamStatus) -> Result<(), ChatError> {
        self.guarded(|state| {
            state.status = Some(status);
            Ok(())
        })
    }

    pub fn complete(&self) -> Result<(), ChatError> {
        self.guarded(|state| state.finish_message(self.conversation_id, self.message_id))
    }

    pub fn fail(&self, message: &str) -> Result<(), ChatError> {
        self.guarded(|state| {
            state.record_failure(message);
            Ok(())
        })?;
        warn!("Streaming session failed: {message}");
        Ok(())
    }
}
