//! Context-addressed conversation memory
//!
//! Bounded per-conversation buffers with rolling summaries, durable storage,
//! and a single-flight in-process cache keyed by context address.

pub mod cache;
pub mod conversation;
pub mod record;
pub mod store;
pub mod summarizer;

pub use cache::{MemoryCache, SharedMemory};
pub use conversation::{ConversationMemory, MemoryConfig};
pub use record::{estimate_tokens, MemoryRecord, Turn, TurnRole};
pub use store::{InMemoryStore, MemoryStore, PgMemoryStore};
pub use summarizer::{FoldingSummarizer, LlmSummarizer, Summarizer};
