//! Streaming chat client core: conversation store, incremental stream
//! parsing and the session controller that ties them together.

pub mod api;
pub mod config;
pub mod content;
pub mod db;
pub mod errors;
pub mod models;
pub mod service;
pub mod store;
pub mod stream;

pub use config::AppConfig;
pub use errors::ChatError;
pub use service::{ChatService, SessionReport, SessionState};
pub use store::{ChatState, ChatStore};
