pub mod state_cache;

pub use state_cache::{spawn_persistence, StateCache, STORAGE_KEY};
