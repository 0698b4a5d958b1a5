use async_trait::async_trait;
use reqwest::Response;
use serde::Serialize;
use tracing::error;

use crate::errors::ChatError;
use crate::models::{Conversation, Message};

/// The remote conversation/message API.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ChatError>;
    async fn create_conversation(&self, title: &str) -> Result<Conversation, ChatError>;
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError>;
    async fn send_message(&self, conversation_id: &str, content: &str) -> Result<Message, ChatError>;
}

#[derive(Serialize)]
struct CreateConversationBody<'a> {
    title: &'a str,
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    content: &'a str,
}

/// [`ChatApi`] over plain JSON HTTP endpoints.
#[derive(Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

async fn check(resp: Response) -> Result<Response, ChatError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(ChatError::Remote { status: status.as_u16(), message })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let resp = self.client.get(self.url("/conversations")).send().await.map_err(|e| {
            error!("Failed to fetch conversations: {e}");
            ChatError::from(e)
        })?;
        Ok(check(resp).await?.json::<Vec<Conversation>>().await?)
    }

    async fn create_conversation(&self, title: &str) -> Result<Conversation, ChatError> {
        let resp = self
            .client
            .post(self.url("/conversations"))
            .json(&CreateConversationBody { title })
            .send()
            .await
            .map_err(|e| {
                error!("Failed to create conversation: {e}");
                ChatError::from(e)
            })?;
        Ok(check(resp).await?.json::<Conversation>().await?)
    }

    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        let resp = self
            .client
            .get(self.url(&format!("/conversations/{conversation_id}/messages")))
            .send()
            .await
            .map_err(|e| {
                error!("Failed to fetch messages for conversation {conversation_id}: {e}");
                ChatError::from(e)
            })?;
        Ok(check(resp).await?.json::<Vec<Message>>().await?)
    }

    async fn send_message(&self, conversation_id: &str, content: &str) -> Result<Message, ChatError> {
        let resp = self
            .client
            .post(self.url(&format!("/conversations/{conversation_id}/messages")))
            .json(&SendMessageBody { content })
            .send()
            .await
            .map_err(|e| {
                error!("Failed to send message to conversation {conversation_id}: {e}");
                ChatError::from(e)
            })?;
        Ok(check(resp).await?.json::<Message>().await?)
    }
}
