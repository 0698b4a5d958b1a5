use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, error};

use crate::errors::ChatError;
use crate::stream::parser::ByteStream;

/// Body of the streaming request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRequest {
    pub conversation_id: String,
    pub message_id: String,
    pub message: String,
}

/// Opens the chunked reply body for one assistant message.
///
/// Dropping the returned stream must release the underlying connection;
/// cancellation of a session relies on it.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, ChatError>;
}

/// POSTs the request as JSON and exposes the response body as raw chunks.
#[derive(Clone)]
pub struct HttpStreamTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpStreamTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, ChatError> {
        debug!("Opening reply stream at {} for conversation {}", self.url, request.conversation_id);

        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Stream request to {} failed: {e}", self.url);
                ChatError::transport(format!("Network error: {e}"))
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ChatError::transport(format!("Server error: {status}")));
        }

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ChatError::transport(format!("Read error: {e}"))));
        Ok(Box::pin(body))
    }
}
