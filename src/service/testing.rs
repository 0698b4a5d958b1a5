//! In-memory transports and API doubles for the service tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;

use crate::api::ChatApi;
use crate::errors::ChatError;
use crate::models::{Conversation, Message, NewMessage};
use crate::stream::parser::ByteStream;
use crate::stream::transport::{StreamRequest, StreamTransport};

/// Replays the same chunks on every `open`, then ends the body.
pub struct ScriptedTransport {
    chunks: Vec<String>,
}

impl ScriptedTransport {
    pub fn new(chunks: Vec<String>) -> Self {
        Self { chunks }
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open(&self, _request: &StreamRequest) -> Result<ByteStream, ChatError> {
        let chunks: Vec<Result<Bytes, ChatError>> =
            self.chunks.iter().map(|c| Ok(Bytes::from(c.clone()))).collect();
        Ok(stream::iter(chunks).boxed())
    }
}

/// Body fed by the test through an mpsc sender; stays open while the sender lives.
pub struct ChannelTransport {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::Sender<String>) {
        let (tx, rx) = mpsc::channel(16);
        (Self { rx: Arc::new(tokio::sync::Mutex::new(rx)) }, tx)
    }
}

#[async_trait]
impl StreamTransport for ChannelTransport {
    async fn open(&self, _request: &StreamRequest) -> Result<ByteStream, ChatError> {
        let rx = self.rx.clone();
        let body = stream::unfold(rx, |rx| async move {
            let chunk = rx.lock().await.recv().await?;
            Some((Ok(Bytes::from(chunk)), rx))
        });
        Ok(body.boxed())
    }
}

/// Refuses every connection.
pub struct FailingTransport;

#[async_trait]
impl StreamTransport for FailingTransport {
    async fn open(&self, _request: &StreamRequest) -> Result<ByteStream, ChatError> {
        Err(ChatError::transport("connection refused"))
    }
}

/// Records what the service mirrors and serves canned data.
#[derive(Default)]
pub struct FakeApi {
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    fail: bool,
    created: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl FakeApi {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self { messages, ..Self::default() }
    }

    pub fn with_conversations(conversations: Vec<Conversation>) -> Self {
        Self { conversations, ..Self::default() }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), ChatError> {
        if self.fail {
            return Err(ChatError::Remote { status: 503, message: "unavailable".to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        self.check()?;
        Ok(self.conversations.clone())
    }

    async fn create_conversation(&self, title: &str) -> Result<Conversation, ChatError> {
        self.check()?;
        self.created.lock().unwrap().push(title.to_string());
        Ok(Conversation::new(uuid::Uuid::new_v4().to_string(), title.to_string()))
    }

    async fn fetch_messages(&self, _conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        self.check()?;
        Ok(self.messages.clone())
    }

    async fn send_message(&self, conversation_id: &str, content: &str) -> Result<Message, ChatError> {
        self.check()?;
        self.sent.lock().unwrap().push((conversation_id.to_string(), content.to_string()));
        Ok(Message::from_new(NewMessage::user(content)))
    }
}
