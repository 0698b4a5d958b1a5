use std::path::PathBuf;

use crate::errors::ChatError;
use crate::stream::parser::{FrameDelimiter, ParserConfig};

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_TITLE_MAX_CHARS: usize = 40;

/// Runtime settings, read from the environment (and `.env` via dotenvy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub api_base_url: String,
    pub stream_url: String,
    pub cache_dir: Option<PathBuf>,
    pub title_max_chars: usize,
    pub parser: ParserConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            stream_url: format!("{DEFAULT_API_BASE_URL}/chat/stream"),
            cache_dir: None,
            title_max_chars: DEFAULT_TITLE_MAX_CHARS,
            parser: ParserConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ChatError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ChatError> {
        let defaults = AppConfig::default();

        let api_base_url = lookup("CHAT_API_BASE_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base_url);
        let stream_url = lookup("CHAT_STREAM_URL").unwrap_or_else(|| format!("{api_base_url}/chat/stream"));
        let cache_dir = lookup("CHAT_CACHE_DIR").filter(|v| !v.trim().is_empty()).map(PathBuf::from);

        let title_max_chars = match lookup("CHAT_TITLE_MAX_CHARS") {
            Some(v) => parse_positive("CHAT_TITLE_MAX_CHARS", &v)?,
            None => defaults.title_max_chars,
        };

        let delimiter = match lookup("CHAT_FRAME_DELIMITER") {
            Some(v) => FrameDelimiter::parse(&v).ok_or(ChatError::InvalidConfig {
                key: "CHAT_FRAME_DELIMITER".to_string(),
                value: v,
            })?,
            None => defaults.parser.delimiter,
        };
        let max_pending_bytes = match lookup("CHAT_MAX_PENDING_BYTES") {
            Some(v) => parse_positive("CHAT_MAX_PENDING_BYTES", &v)?,
            None => defaults.parser.max_pending_bytes,
        };

        Ok(Self {
            api_base_url,
            stream_url,
            cache_dir,
            title_max_chars,
            parser: ParserConfig { delimiter, max_pending_bytes },
        })
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize, ChatError> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ChatError::InvalidConfig { key: key.to_string(), value: value.to_string() })
}
