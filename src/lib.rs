//! Chat Relay
//!
//! Routes chat messages from multiple frontends through a language-model
//! backend and streams the reply token by token back to the originating
//! surface, while persisting a bounded per-conversation memory so follow-up
//! turns retain context:
//! - Deterministic context addressing (server/category/channel/thread → key)
//! - Token-budgeted conversation memory with summarization-triggered pruning
//! - Single-flight, LRU-bounded in-process memory cache
//! - Streaming dispatcher with paced edits and overflow splitting
//!
//! TURN FLOW:
//! INBOUND → ADDRESS → LOAD MEMORY → MODEL STREAM → DISPATCH → UPDATE → PERSIST

pub mod address;
pub mod api;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod memory;
pub mod session;

pub use error::Result;

// Re-export common types
pub use address::{ContextAddress, Frontend, Location};
pub use dispatch::{DispatcherConfig, ResponseDispatcher, Transport, STOP_SENTINEL};
pub use memory::{ConversationMemory, MemoryCache, MemoryConfig, MemoryStore};
pub use session::ConversationSession;
