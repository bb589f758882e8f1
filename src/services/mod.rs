//! Business logic: credential pool, request queue, user store, prompt log.

pub mod key_pool;
pub mod prompt_logger;
pub mod queue;
pub mod user_store;

pub use key_pool::{KeyPool, KeySnapshot, KEY_REUSE_DELAY, RATE_LIMIT_LOCKOUT};
pub use prompt_logger::{PromptLogEntry, PromptLogger};
pub use queue::{RequestQueue, Shard, MAX_RETRIES};
pub use user_store::{User, UserStore, UserType};
