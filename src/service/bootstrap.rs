use tracing::{error, info, warn};

use crate::api::ChatApi;
use crate::db::StateCache;
use crate::store::{ChatState, ChatStore, PersistedState};

/// Builds the startup store: local cache first, remote API as fallback.
/// A remote load is written back to the cache straight away.
///
/// Never fails. If neither source is usable the store starts empty with the
/// last failure in its error slot.
pub async fn hydrate(cache: Option<&StateCache>, api: &dyn ChatApi) -> ChatStore {
    if let Some(cache) = cache {
        match cache.load().await {
            Ok(Some(persisted)) => {
                info!(
                    "Restored {} conversations from {}",
                    persisted.conversations.len(),
                    cache.path().display()
                );
                return ChatStore::with_state(ChatState::from(persisted));
            }
            Ok(None) => {}
            Err(e) => warn!("State cache unavailable, falling back to remote API: {e}"),
        }
    }

    match api.fetch_conversations().await {
        Ok(conversations) => {
            info!("Loaded {} conversations from remote API", conversations.len());
            let persisted = PersistedState { conversations, current_conversation_id: None };
            if let Some(cache) = cache {
                if let Err(e) = cache.save(&persisted).await {
                    warn!("Failed to seed state cache: {e}");
                }
            }
            ChatStore::with_state(ChatState::from(persisted))
        }
        Err(e) => {
            error!("Failed to load conversations: {e}");
            let store = ChatStore::new();
            store.set_error(&e.to_string());
            store
        }
    }
}
