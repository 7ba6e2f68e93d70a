//! Conversation memory records
//!
//! The bounded turn buffer + rolling summary persisted for each address.
//! Field names on the wire match the existing store layout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Role of a recorded turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    Human,
    Assistant,
}

/// One human or assistant message in a conversation's buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub source_message_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            source_message_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_source(mut self, source_message_id: impl Into<String>) -> Self {
        self.source_message_id = Some(source_message_id.into());
        self
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Human, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    /// Token cost of this turn as seen by the budget
    pub fn token_count(&self) -> usize {
        estimate_tokens(&self.content)
    }

    /// Render for summarization prompts and raw history
    pub fn as_transcript_line(&self) -> String {
        let role = match self.role {
            TurnRole::Human => "Human",
            TurnRole::Assistant => "Assistant",
        };
        format!("{}: {}", role, self.content)
    }
}

/// Approximate tokenizer cost: ~4 characters per token
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// Persisted memory state for one conversation.
///
/// `tokens_count` is always the recomputed cost of `message_buffer` plus
/// `summary` — it is never incrementally trusted after a mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub context_route: String,
    pub message_buffer: VecDeque<Turn>,
    pub summary: String,
    pub tokens_count: usize,
    pub last_updated: DateTime<Utc>,
}

impl MemoryRecord {
    /// Empty record for an address with no history yet
    pub fn build_empty(context_route: impl Into<String>) -> Self {
        Self {
            context_route: context_route.into(),
            message_buffer: VecDeque::new(),
            summary: String::new(),
            tokens_count: 0,
            last_updated: Utc::now(),
        }
    }

    pub fn push_turn(&mut self, turn: Turn) {
        self.message_buffer.push_back(turn);
        self.recompute_tokens();
        self.last_updated = Utc::now();
    }

    /// Remove and return the oldest buffered turn
    pub fn pop_oldest(&mut self) -> Option<Turn> {
        let turn = self.message_buffer.pop_front();
        if turn.is_some() {
            self.recompute_tokens();
            self.last_updated = Utc::now();
        }
        turn
    }

    /// Put a popped turn back at the front (summarization failure path)
    pub fn restore_oldest(&mut self, turn: Turn) {
        self.message_buffer.push_front(turn);
        self.recompute_tokens();
        self.last_updated = Utc::now();
    }

    pub fn set_summary(&mut self, summary: String) {
        self.summary = summary;
        self.recompute_tokens();
        self.last_updated = Utc::now();
    }

    /// Recompute token count from scratch (prevents drift)
    pub fn recompute_tokens(&mut self) {
        self.tokens_count = self
            .message_buffer
            .iter()
            .map(|t| t.token_count())
            .sum::<usize>()
            + estimate_tokens(&self.summary);
    }

    pub fn turn_count(&self) -> usize {
        self.message_buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_buffer.is_empty() && self.summary.is_empty()
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.message_buffer.iter()
    }
}
