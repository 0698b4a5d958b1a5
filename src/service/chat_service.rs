use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::ChatApi;
use crate::errors::ChatError;
use crate::models::{NewMessage, StreamEvent, StreamStatus};
use crate::service::session::{SessionHandle, SessionReport, SessionState, StreamingSession};
use crate::store::{ChatStore, SessionWriter};
use crate::stream::parser::{parse_events, ParserConfig};
use crate::stream::transport::{StreamRequest, StreamTransport};

const MAX_MESSAGE_LENGTH: usize = 8000;
const DEFAULT_TITLE: &str = "New chat";
const DEFAULT_TITLE_MAX_CHARS: usize = 40;
const STREAM_CLOSED_EARLY: &str = "stream closed before completion";

/// How `drive` left the session.
enum Outcome {
    Completed,
    /// Transport or remote failure, not yet recorded in the store.
    Failed(String),
    /// Cancelled through [`ChatService::cancel`].
    Cancelled,
    /// The target conversation or message went away underneath the session.
    Detached,
}

/// Conversation title from the first user message: whitespace collapsed,
/// cut to `max_chars` characters.
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if flat.chars().count() > max_chars {
        let head: String = flat.chars().take(max_chars).collect();
        format!("{}…", head.trim_end())
    } else {
        flat
    }
}

fn validate(text: &str) -> Result<(), ChatError> {
    if text.trim().is_empty() {
        return Err(ChatError::EmptyField { field_name: "message".to_string() });
    }
    let length = text.chars().count();
    if length > MAX_MESSAGE_LENGTH {
        return Err(ChatError::FieldTooLong {
            field_name: "message".to_string(),
            max_length: MAX_MESSAGE_LENGTH,
            actual_length: length,
        });
    }
    Ok(())
}

/// Drives assistant replies into the store, one session at a time.
pub struct ChatService<T> {
    store: ChatStore,
    transport: T,
    api: Option<Arc<dyn ChatApi>>,
    parser: ParserConfig,
    title_max_chars: usize,
    active: Mutex<Option<SessionHandle>>,
}

impl<T: StreamTransport> ChatService<T> {
    pub fn new(store: ChatStore, transport: T) -> Self {
        Self {
            store,
            transport,
            api: None,
            parser: ParserConfig::default(),
            title_max_chars: DEFAULT_TITLE_MAX_CHARS,
            active: Mutex::new(None),
        }
    }

    /// Mirrors conversation creation and finished exchanges to the remote API.
    pub fn with_api(mut self, api: Arc<dyn ChatApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_parser_config(mut self, parser: ParserConfig) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_title_max_chars(mut self, title_max_chars: usize) -> Self {
        self.title_max_chars = title_max_chars;
        self
    }

    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn active_session(&self) -> Option<SessionHandle> {
        self.active_slot().clone()
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<SessionHandle>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops the active handle if it still belongs to `session_id`.
    fn release(&self, session_id: Uuid) -> bool {
        let mut slot = self.active_slot();
        if slot.as_ref().is_some_and(|h| h.session_id == session_id) {
            *slot = None;
            return true;
        }
        false
    }

    /// Aborts the running session, if any. Calling it again is a no-op.
    pub fn cancel(&self) -> bool {
        let Some(handle) = self.active_slot().take() else {
            return false;
        };
        handle.token.cancel();
        self.store.clear_streaming_status();
        info!("Streaming session {} for conversation {} cancelled", handle.session_id, handle.conversation_id);
        true
    }

    /// Selects a conversation and refreshes its messages from the remote API.
    ///
    /// A session streaming into a different conversation is cancelled first.
    pub async fn open_conversation(&self, id: &str) -> Result<(), ChatError> {
        self.store.select_conversation(id)?;
        if self.active_session().is_some_and(|h| h.conversation_id != id) {
            self.cancel();
        }

        let Some(api) = &self.api else {
            return Ok(());
        };
        let messages = match api.fetch_messages(id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Remote message sync for conversation {id} failed: {e}");
                return Ok(());
            }
        };
        if messages.is_empty() {
            return Ok(());
        }

        let streaming_here = self.active_session().is_some_and(|h| h.conversation_id == id);
        if streaming_here || !self.store.is_current(id) {
            debug!("Skipping remote message sync for conversation {id}");
            return Ok(());
        }
        self.store.replace_messages(id, messages)
    }

    /// Deletes a conversation, cancelling a session that streams into it.
    pub fn delete_conversation(&self, id: &str) -> Result<(), ChatError> {
        if self.active_session().is_some_and(|h| h.conversation_id == id) {
            self.cancel();
        }
        self.store.delete_conversation(id)
    }

    /// Sends `text` as a user message and streams the assistant reply.
    ///
    /// Only invalid input is returned as `Err`; transport and remote failures
    /// end the session as `Errored` and land in the store's error slot.
    pub async fn send_user_message(&self, text: &str) -> Result<SessionReport, ChatError> {
        validate(text)?;
        self.cancel();

        let mut session = StreamingSession::new();
        session.advance(SessionState::Starting)?;

        let conversation_id = self.ensure_conversation(text)?;
        self.store.append_message(&conversation_id, NewMessage::user(text))?;

        self.store.begin_streaming();
        let message_id = match self
            .store
            .append_message(&conversation_id, NewMessage::assistant_placeholder())
        {
            Ok(id) => id,
            Err(e) => {
                self.store.clear_streaming_status();
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        *self.active_slot() = Some(SessionHandle {
            session_id: session.id(),
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            token: token.clone(),
        });
        session.advance(SessionState::Streaming)?;
        info!("Streaming session {} started for conversation {conversation_id}", session.id());

        let request = StreamRequest {
            conversation_id: conversation_id.clone(),
            message_id: message_id.clone(),
            message: text.to_string(),
        };
        let writer = self.store.session_writer(&token, &conversation_id, &message_id);
        let outcome = match self.drive(&request, &token, &writer).await {
            Outcome::Failed(message) => match writer.fail(&message) {
                Ok(()) => Outcome::Failed(message),
                Err(e) => interrupted(e),
            },
            other => other,
        };

        let final_state = match outcome {
            Outcome::Completed => {
                info!("Streaming session {} completed", session.id());
                self.record_exchange(&conversation_id, text);
                SessionState::Completed
            }
            Outcome::Failed(message) => SessionState::Errored(message),
            Outcome::Cancelled => SessionState::Cancelled,
            Outcome::Detached => {
                if self.release(session.id()) {
                    self.store.clear_streaming_status();
                }
                SessionState::Cancelled
            }
        };
        self.release(session.id());
        match &final_state {
            SessionState::Cancelled => {
                session.cancel();
            }
            state => session.advance(state.clone())?,
        }

        Ok(SessionReport {
            session_id: session.id(),
            conversation_id,
            message_id,
            state: final_state,
        })
    }

    fn ensure_conversation(&self, text: &str) -> Result<String, ChatError> {
        let current = self
            .store
            .read(|s| s.current_conversation().map(|c| (c.id.clone(), c.messages.is_empty())));

        let (id, untitled, created) = match current {
            Some((id, empty)) => (id, empty, false),
            None => (self.store.create_conversation(DEFAULT_TITLE), true, true),
        };

        if untitled {
            let title = derive_title(text, self.title_max_chars);
            self.store.rename_conversation(&id, &title)?;
            if created {
                self.mirror_conversation(title);
            }
        }
        Ok(id)
    }

    fn mirror_conversation(&self, title: String) {
        let Some(api) = self.api.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = api.create_conversation(&title).await {
                warn!("Remote conversation create failed: {e}");
            }
        });
    }

    fn record_exchange(&self, conversation_id: &str, text: &str) {
        let Some(api) = self.api.clone() else {
            return;
        };
        let conversation_id = conversation_id.to_string();
        let text = text.to_string();
        tokio::spawn(async move {
            if let Err(e) = api.send_message(&conversation_id, &text).await {
                warn!("Remote message record for conversation {conversation_id} failed: {e}");
            }
        });
    }

    async fn drive(&self, request: &StreamRequest, token: &CancellationToken, writer: &SessionWriter<'_>) -> Outcome {
        let bytes = tokio::select! {
            biased;
            _ = token.cancelled() => return Outcome::Cancelled,
            opened = self.transport.open(request) => match opened {
                Ok(bytes) => bytes,
                Err(e) => return Outcome::Failed(e.to_string()),
            },
        };

        let mut events = parse_events(bytes, self.parser);
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Outcome::Cancelled,
                next = events.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Outcome::Failed(e.to_string()),
                None => return Outcome::Failed(STREAM_CLOSED_EARLY.to_string()),
            };
            if let Some(outcome) = apply(writer, event) {
                return outcome;
            }
        }
    }
}

/// Applies one event through the session's writer. `Some` ends the session.
fn apply(writer: &SessionWriter<'_>, event: StreamEvent) -> Option<Outcome> {
    let applied = match event {
        StreamEvent::ContentChunk(text) => writer.append_chunk(&text),
        StreamEvent::Thinking(detail) => writer.set_status(StreamStatus::Thinking(detail)),
        StreamEvent::Status { kind, detail } => writer.set_status(StreamStatus::Info { kind, detail }),
        StreamEvent::Completed => return Some(writer.complete().map_or_else(interrupted, |()| Outcome::Completed)),
        StreamEvent::Done => {
            debug!("Done received, closing transport");
            return Some(writer.complete().map_or_else(interrupted, |()| Outcome::Completed));
        }
        StreamEvent::Error { kind, message } => {
            warn!("Remote reported a {} stream error: {message}", kind.as_str());
            return Some(Outcome::Failed(message));
        }
    };
    applied.err().map(interrupted)
}

/// Maps a refused session write onto how the session ends.
fn interrupted(e: ChatError) -> Outcome {
    match e {
        ChatError::SessionCancelled => Outcome::Cancelled,
        e => {
            debug!("Detaching streaming session: {e}");
            Outcome::Detached
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::models::MessageRole;
    use crate::service::testing::{ChannelTransport, FailingTransport, FakeApi, ScriptedTransport};

    fn frame(json: &str) -> String {
        format!("data: {json}\n\n")
    }

    fn reply_of(store: &ChatStore, report: &SessionReport) -> crate::models::Message {
        store.read(|s| {
            s.conversation(&report.conversation_id)
                .and_then(|c| c.message(&report.message_id))
                .cloned()
                .expect("placeholder message")
        })
    }

    #[test]
    fn derives_bounded_titles() {
        assert_eq!(derive_title("  Hello\n world  ", 40), "Hello world");
        assert_eq!(derive_title("abcdefghij", 4), "abcd…");
        assert_eq!(derive_title("   ", 40), "New chat");
    }

    #[tokio::test]
    async fn hello_on_empty_store() {
        let transport = ScriptedTransport::new(vec![
            "data: {\"type\":\"content_chunk\",\"content\":\"Hi\"}\n\n".to_string(),
            "data: {\"type\":\"done\"}\n\n".to_string(),
        ]);
        let service = ChatService::new(ChatStore::new(), transport);

        let report = service.send_user_message("Hello").await.unwrap();
        assert_eq!(report.state, SessionState::Completed);

        let state = service.store().snapshot();
        let conversation = state.current_conversation().unwrap();
        assert_eq!(conversation.title, "Hello");
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, MessageRole::User);
        assert_eq!(conversation.messages[0].content, "Hello");
        assert!(conversation.messages[0].is_complete);

        let reply = &conversation.messages[1];
        assert_eq!(reply.role, MessageRole::Assistant);
        assert_eq!(reply.content, "Hi");
        assert!(reply.is_complete);
        assert!(!reply.is_streaming);
        assert!(!state.is_loading);
        assert!(service.active_session().is_none());
    }

    #[tokio::test]
    async fn reuses_current_conversation_and_keeps_its_title() {
        let store = ChatStore::new();
        let service = ChatService::new(
            store.clone(),
            ScriptedTransport::new(vec![frame(r#"{"type":"completed"}"#)]),
        );
        let first = service.send_user_message("First question").await.unwrap();
        let second = service.send_user_message("Second question").await.unwrap();

        assert_eq!(first.conversation_id, second.conversation_id);
        store.read(|s| {
            let conversation = s.current_conversation().unwrap();
            assert_eq!(conversation.title, "First question");
            assert_eq!(conversation.messages.len(), 4);
        });
    }

    #[tokio::test]
    async fn empty_existing_conversation_gets_titled() {
        let store = ChatStore::new();
        store.create_conversation("New chat");
        let service = ChatService::new(
            store.clone(),
            ScriptedTransport::new(vec![frame(r#"{"type":"completed"}"#)]),
        )
        .with_title_max_chars(5);

        service.send_user_message("Summarize this").await.unwrap();
        store.read(|s| {
            assert_eq!(s.conversations.len(), 1);
            assert_eq!(s.current_conversation().unwrap().title, "Summa…");
        });
    }

    #[tokio::test]
    async fn remote_error_leaves_partial_message() {
        let transport = ScriptedTransport::new(vec![
            frame(r#"{"type":"content_chunk","content":"Par"}"#),
            frame(r#"{"type":"processing_error","message":"model crashed"}"#),
            frame(r#"{"type":"content_chunk","content":"ignored"}"#),
        ]);
        let service = ChatService::new(ChatStore::new(), transport);
        let report = service.send_user_message("Hi").await.unwrap();

        assert_eq!(report.state, SessionState::Errored("model crashed".into()));
        let reply = reply_of(service.store(), &report);
        assert_eq!(reply.content, "Par");
        assert!(reply.is_streaming);
        assert!(!reply.is_complete);

        let state = service.store().snapshot();
        assert_eq!(state.error.as_deref(), Some("model crashed"));
        assert_eq!(state.status, Some(StreamStatus::Failed("model crashed".into())));
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn transport_failure_is_reported_not_returned() {
        let service = ChatService::new(ChatStore::new(), FailingTransport);
        let report = service.send_user_message("Hi").await.unwrap();
        assert!(matches!(report.state, SessionState::Errored(ref m) if m.contains("connection refused")));
        assert!(service.store().snapshot().error.is_some());
    }

    #[tokio::test]
    async fn stream_ending_without_terminal_event_errors() {
        let transport = ScriptedTransport::new(vec![frame(r#"{"type":"content_chunk","content":"half"}"#)]);
        let service = ChatService::new(ChatStore::new(), transport);
        let report = service.send_user_message("Hi").await.unwrap();
        assert_eq!(report.state, SessionState::Errored(STREAM_CLOSED_EARLY.into()));
        assert!(!reply_of(service.store(), &report).is_complete);
    }

    #[tokio::test]
    async fn thinking_updates_status_without_touching_content() {
        let (transport, tx) = ChannelTransport::new();
        let service = Arc::new(ChatService::new(ChatStore::new(), transport));
        let mut rx = service.store().subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.send_user_message("Hi").await }
        });

        tx.send(frame(r#"{"type":"thinking","data":"searching"}"#)).await.unwrap();
        rx.wait_for(|s| s.status == Some(StreamStatus::Thinking(Some("searching".into()))))
            .await
            .unwrap();
        assert!(service.store().read(|s| s.current_messages()[1].content.is_empty()));

        tx.send(frame(r#"{"type":"completed"}"#)).await.unwrap();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(service.store().snapshot().status, None);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_stops_mutations() {
        let (transport, tx) = ChannelTransport::new();
        let service = Arc::new(ChatService::new(ChatStore::new(), transport));
        let mut rx = service.store().subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.send_user_message("Hi").await }
        });

        tx.send(frame(r#"{"type":"content_chunk","content":"Hel"}"#)).await.unwrap();
        rx.wait_for(|s| s.current_messages().get(1).is_some_and(|m| m.content == "Hel"))
            .await
            .unwrap();

        assert!(service.cancel());
        let after_first = service.store().snapshot();
        assert!(!service.cancel());
        assert_eq!(service.store().snapshot(), after_first);

        let _ = tx.send(frame(r#"{"type":"content_chunk","content":"lo"}"#)).await;
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.state, SessionState::Cancelled);

        let state = service.store().snapshot();
        let reply = reply_of(service.store(), &report);
        assert_eq!(reply.content, "Hel");
        assert!(!state.is_loading);
        assert_eq!(state.status, None);
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn deleting_target_conversation_detaches_session() {
        let (transport, tx) = ChannelTransport::new();
        let service = Arc::new(ChatService::new(ChatStore::new(), transport));
        let mut rx = service.store().subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.send_user_message("Hi").await }
        });
        rx.wait_for(|s| s.current_messages().len() == 2).await.unwrap();
        let conversation_id = service.store().read(|s| s.current_conversation_id.clone()).unwrap();

        // Straight through the store, bypassing the service's own cancel.
        service.store().delete_conversation(&conversation_id).unwrap();
        tx.send(frame(r#"{"type":"content_chunk","content":"ghost"}"#)).await.unwrap();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.state, SessionState::Cancelled);
        let state = service.store().snapshot();
        assert!(state.conversations.is_empty());
        assert!(!state.is_loading);
        assert!(service.active_session().is_none());
    }

    #[tokio::test]
    async fn delete_through_service_cancels_session() {
        let (transport, _tx) = ChannelTransport::new();
        let service = Arc::new(ChatService::new(ChatStore::new(), transport));
        let mut rx = service.store().subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.send_user_message("Hi").await }
        });
        rx.wait_for(|s| s.current_messages().len() == 2).await.unwrap();
        let conversation_id = service.active_session().unwrap().conversation_id;

        service.delete_conversation(&conversation_id).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert_eq!(report.state, SessionState::Cancelled);
        assert!(service.store().snapshot().current_messages().is_empty());
    }

    /// Store with an empty "Other" conversation and a selected "Target".
    fn two_conversations() -> (ChatStore, String, String) {
        let store = ChatStore::new();
        let other = store.create_conversation("Other");
        let target = store.create_conversation("Target");
        (store, other, target)
    }

    #[tokio::test]
    async fn selecting_another_conversation_detaches_session() {
        let (store, other, target) = two_conversations();
        let (transport, tx) = ChannelTransport::new();
        let service = Arc::new(ChatService::new(store.clone(), transport));
        let mut rx = store.subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.send_user_message("Hi").await }
        });
        rx.wait_for(|s| s.current_messages().len() == 2).await.unwrap();

        store.select_conversation(&other).unwrap();
        tx.send(frame(r#"{"type":"content_chunk","content":"ghost"}"#)).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert_eq!(report.state, SessionState::Cancelled);
        assert_eq!(report.conversation_id, target);

        let state = store.snapshot();
        let reply = reply_of(&store, &report);
        assert!(reply.content.is_empty());
        assert!(reply.is_streaming);
        assert_eq!(state.current_conversation_id.as_deref(), Some(other.as_str()));
        assert!(!state.is_loading);
        assert_eq!(state.status, None);
        assert_eq!(state.error, None);
        assert!(service.active_session().is_none());
    }

    #[tokio::test]
    async fn opening_another_conversation_cancels_session() {
        let (store, other, _target) = two_conversations();
        let (transport, _tx) = ChannelTransport::new();
        let service = Arc::new(ChatService::new(store.clone(), transport));
        let mut rx = store.subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.send_user_message("Hi").await }
        });
        rx.wait_for(|s| s.current_messages().len() == 2).await.unwrap();
        assert!(service.active_session().is_some());

        service.open_conversation(&other).await.unwrap();
        assert!(service.active_session().is_none());

        let report = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        assert_eq!(report.state, SessionState::Cancelled);
        let state = store.snapshot();
        assert!(store.is_current(&other));
        assert!(!state.is_loading);
        assert_eq!(state.status, None);
    }

    #[tokio::test]
    async fn reopening_streaming_conversation_skips_remote_sync() {
        let (store, _other, target) = two_conversations();
        let remote = vec![crate::models::Message::from_new(NewMessage::user("stale server copy"))];
        let (transport, tx) = ChannelTransport::new();
        let service = Arc::new(
            ChatService::new(store.clone(), transport).with_api(Arc::new(FakeApi::with_messages(remote))),
        );
        let mut rx = store.subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.send_user_message("Hi").await }
        });
        rx.wait_for(|s| s.current_messages().len() == 2).await.unwrap();

        service.open_conversation(&target).await.unwrap();
        let session = service.active_session().unwrap();
        assert_eq!(session.conversation_id, target);
        store.read(|s| {
            assert_eq!(s.current_messages().len(), 2);
            assert_eq!(s.current_messages()[0].content, "Hi");
        });

        tx.send(frame(r#"{"type":"content_chunk","content":"Hello"}"#)).await.unwrap();
        tx.send(frame(r#"{"type":"done"}"#)).await.unwrap();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(reply_of(&store, &report).content, "Hello");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nothing_lands_after_cancel_returns() {
        let (transport, tx) = ChannelTransport::new();
        let service = Arc::new(ChatService::new(ChatStore::new(), transport));
        let mut rx = service.store().subscribe();

        let task = tokio::spawn({
            let service = service.clone();
            async move { service.send_user_message("Hi").await }
        });
        let feeder = tokio::spawn(async move {
            while tx.send(frame(r#"{"type":"content_chunk","content":"a"}"#)).await.is_ok() {}
        });

        rx.wait_for(|s| s.current_messages().get(1).is_some_and(|m| m.content.len() >= 3))
            .await
            .unwrap();
        assert!(service.cancel());
        let at_cancel = service.store().snapshot();

        let report = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
        feeder.abort();
        assert_eq!(report.state, SessionState::Cancelled);
        assert_eq!(service.store().snapshot(), at_cancel);
        assert!(!at_cancel.is_loading);
        assert_eq!(at_cancel.error, None);
    }

    #[tokio::test]
    async fn new_send_cancels_previous_session() {
        let (transport, tx) = ChannelTransport::new();
        let service = Arc::new(ChatService::new(ChatStore::new(), transport));
        let mut rx = service.store().subscribe();

        let first = tokio::spawn({
            let service = service.clone();
            async move { service.send_user_message("one").await }
        });
        rx.wait_for(|s| s.current_messages().len() == 2).await.unwrap();
        let first_session = service.active_session().unwrap().session_id;

        let second = tokio::spawn({
            let service = service.clone();
            async move { service.send_user_message("two").await }
        });
        rx.wait_for(|s| s.current_messages().len() == 4).await.unwrap();
        assert_ne!(service.active_session().unwrap().session_id, first_session);

        tx.send(frame(r#"{"type":"content_chunk","content":"second"}"#)).await.unwrap();
        tx.send(frame(r#"{"type":"done"}"#)).await.unwrap();

        assert_eq!(first.await.unwrap().unwrap().state, SessionState::Cancelled);
        let report = second.await.unwrap().unwrap();
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(reply_of(service.store(), &report).content, "second");
    }

    #[tokio::test]
    async fn rejects_invalid_input_before_touching_store() {
        let service = ChatService::new(ChatStore::new(), FailingTransport);
        assert!(service.send_user_message("   ").await.unwrap_err().is_validation());
        let long = "x".repeat(MAX_MESSAGE_LENGTH + 1);
        assert!(service.send_user_message(&long).await.unwrap_err().is_validation());
        assert!(service.store().snapshot().conversations.is_empty());
    }

    #[tokio::test]
    async fn open_conversation_syncs_remote_messages() {
        let store = ChatStore::new();
        let id = store.create_conversation("Remote");
        store.create_conversation("Other");

        let remote = vec![crate::models::Message::from_new(NewMessage::user("from server"))];
        let api = Arc::new(FakeApi::with_messages(remote));
        let service = ChatService::new(store.clone(), FailingTransport).with_api(api);

        service.open_conversation(&id).await.unwrap();
        store.read(|s| {
            assert_eq!(s.current_conversation_id.as_deref(), Some(id.as_str()));
            assert_eq!(s.current_messages()[0].content, "from server");
        });
        assert!(service.open_conversation("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn completed_exchange_is_mirrored_remotely() {
        let api = Arc::new(FakeApi::default());
        let service = ChatService::new(
            ChatStore::new(),
            ScriptedTransport::new(vec![frame(r#"{"type":"done"}"#)]),
        )
        .with_api(api.clone());

        let report = service.send_user_message("Record me").await.unwrap();
        for _ in 0..50 {
            if !api.sent().is_empty() && !api.created().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(api.created(), vec!["Record me".to_string()]);
        assert_eq!(api.sent(), vec![(report.conversation_id, "Record me".to_string())]);
    }
}
