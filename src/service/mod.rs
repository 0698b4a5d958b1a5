pub mod bootstrap;
pub mod chat_service;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use bootstrap::hydrate;
pub use chat_service::{derive_title, ChatService};
pub use session::{SessionHandle, SessionReport, SessionState, StreamingSession};
