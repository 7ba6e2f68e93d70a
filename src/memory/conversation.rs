//! Per-conversation memory with token-budget enforcement
//!
//! Owns one address's buffered turns + rolling summary, prunes oldest turns
//! into the summary when the budget is exceeded, and persists after every
//! update.

use crate::address::ContextAddress;
use crate::error::RelayError;
use crate::llm::{PromptRole, PromptTurn};
use crate::memory::record::{MemoryRecord, Turn};
use crate::memory::store::MemoryStore;
use crate::memory::summarizer::Summarizer;
use crate::Result;
use chrono::Utc;
use tracing::{info, warn};

/// Configuration for conversation memory
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum tokenizer-measured size of buffer + summary before pruning
    pub token_budget: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { token_budget: 1000 }
    }
}

impl MemoryConfig {
    pub fn from_env() -> Self {
        let token_budget = std::env::var("CONTEXT_TOKEN_BUDGET")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        Self { token_budget }
    }
}

/// In-process memory for one conversation
pub struct ConversationMemory {
    address: ContextAddress,
    record: MemoryRecord,
    dirty: bool,
    config: MemoryConfig,
}

impl ConversationMemory {
    /// Load-or-create for an address. An address with no prior record gets an
    /// empty one, which is not persisted until the first `update()`.
    pub async fn for_address(
        address: ContextAddress,
        store: &dyn MemoryStore,
        config: MemoryConfig,
    ) -> Result<Self> {
        let record = match store.get(&address.as_query()).await? {
            Some(record) => record,
            None => MemoryRecord::build_empty(address.as_path()),
        };

        Ok(Self {
            address,
            record,
            dirty: false,
            config,
        })
    }

    /// Empty memory without a store round trip
    pub fn build_empty(address: ContextAddress, config: MemoryConfig) -> Self {
        let record = MemoryRecord::build_empty(address.as_path());
        Self {
            address,
            record,
            dirty: false,
            config,
        }
    }

    pub fn address(&self) -> &ContextAddress {
        &self.address
    }

    pub fn record(&self) -> &MemoryRecord {
        &self.record
    }

    pub fn token_count(&self) -> usize {
        self.record.tokens_count
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Render (summary, buffer, next input) as model-call input
    pub fn prompt_turns(&self, input: &str) -> Vec<PromptTurn> {
        let mut turns = Vec::with_capacity(self.record.turn_count() + 2);

        if !self.record.summary.is_empty() {
            turns.push(PromptTurn::system(format!(
                "Summary of the conversation so far: {}",
                self.record.summary
            )));
        }

        for turn in self.record.turns() {
            turns.push(PromptTurn::from_turn(turn));
        }

        turns.push(PromptTurn::new(PromptRole::User, input));
        turns
    }

    /// Append one exchange, enforce the budget, and persist.
    ///
    /// Pruning pops oldest turns one at a time and folds each into the rolling
    /// summary until the record fits the budget or the buffer is empty. An
    /// oversized single turn therefore cannot deadlock: once the buffer is
    /// empty the over-budget state is accepted.
    pub async fn update(
        &mut self,
        human: Turn,
        assistant: Turn,
        summarizer: &dyn Summarizer,
        store: &dyn MemoryStore,
    ) -> Result<()> {
        let prior = self.record.clone();

        self.record.push_turn(human.clone());
        self.record.push_turn(assistant.clone());
        self.dirty = true;

        let budget = self.config.token_budget;
        let max_passes = self.record.turn_count();
        let mut passes = 0;

        while self.record.tokens_count > budget && self.record.turn_count() > 0 {
            if passes >= max_passes {
                // Each pass must shrink the buffer; if it hasn't, abort the
                // update and keep the prior persisted record intact.
                self.record = prior;
                self.dirty = false;
                return Err(RelayError::BudgetInvariantViolation(format!(
                    "Pruning did not converge for {} after {} passes",
                    self.address.as_path(),
                    passes
                )));
            }
            passes += 1;

            let Some(oldest) = self.record.pop_oldest() else {
                break;
            };

            match summarizer
                .fold(&self.record.summary, &oldest.as_transcript_line(), Utc::now())
                .await
            {
                Ok(summary) => {
                    info!(
                        "Pruned oldest turn for {} ({} tokens remaining)",
                        self.address.as_path(),
                        self.record.tokens_count
                    );
                    self.record.set_summary(summary);
                }
                Err(e) => {
                    // Put the turn back rather than lose it; accept running
                    // over budget until the next update.
                    warn!(
                        "Summary fold failed for {}, keeping unpruned buffer: {}",
                        self.address.as_path(),
                        e
                    );
                    self.record.restore_oldest(oldest);
                    break;
                }
            }
        }

        if self.record.tokens_count > budget {
            warn!(
                "Memory for {} remains over budget ({}/{} tokens) after pruning",
                self.address.as_path(),
                self.record.tokens_count,
                budget
            );
        }

        store.append_raw_turn(&self.address, &human).await?;
        store.append_raw_turn(&self.address, &assistant).await?;
        store.upsert_one(&self.address.as_query(), &self.record).await?;
        self.dirty = false;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Location;
    use crate::memory::record::{estimate_tokens, TurnRole};
    use crate::memory::store::InMemoryStore;
    use crate::memory::summarizer::FoldingSummarizer;
    use chrono::DateTime;

    fn test_address() -> ContextAddress {
        ContextAddress::from_location(&Location::DirectMessage {
            user_id: 1,
            user_name: "sam".to_string(),
        })
    }

    /// Summarizer that always returns a fixed marker string
    struct StubSummarizer;

    #[async_trait::async_trait]
    impl Summarizer for StubSummarizer {
        async fn fold(
            &self,
            _prior: &str,
            _pruned: &str,
            _at: DateTime<Utc>,
        ) -> Result<String> {
            Ok("[folded]".to_string())
        }
    }

    /// Summarizer that always fails
    struct FailingSummarizer;

    #[async_trait::async_trait]
    impl Summarizer for FailingSummarizer {
        async fn fold(
            &self,
            _prior: &str,
            _pruned: &str,
            _at: DateTime<Utc>,
        ) -> Result<String> {
            Err(RelayError::SummarizationError("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_load_or_create_empty() {
        let store = InMemoryStore::new();
        let memory =
            ConversationMemory::for_address(test_address(), &store, MemoryConfig::default())
                .await
                .unwrap();

        assert_eq!(memory.token_count(), 0);
        assert_eq!(memory.record().turn_count(), 0);
        // A conversation with no replies yet has no database footprint.
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn test_first_update_persists() {
        let store = InMemoryStore::new();
        let address = test_address();
        let mut memory =
            ConversationMemory::for_address(address.clone(), &store, MemoryConfig::default())
                .await
                .unwrap();

        memory
            .update(
                Turn::human("hi"),
                Turn::assistant("hello"),
                &StubSummarizer,
                &store,
            )
            .await
            .unwrap();

        let persisted = store.get(&address.as_query()).await.unwrap().unwrap();
        assert_eq!(persisted.turn_count(), 2);
        let contents: Vec<_> = persisted.turns().map(|t| t.content.clone()).collect();
        assert_eq!(contents, vec!["hi", "hello"]);
        assert_eq!(persisted.message_buffer[0].role, TurnRole::Human);
        assert_eq!(persisted.message_buffer[1].role, TurnRole::Assistant);
        assert_eq!(
            persisted.tokens_count,
            estimate_tokens("hi") + estimate_tokens("hello")
        );

        let history = store.raw_history(&address).await;
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_budget_triggers_single_prune_pass() {
        let store = InMemoryStore::new();
        let config = MemoryConfig { token_budget: 50 };
        let mut memory =
            ConversationMemory::for_address(test_address(), &store, config)
                .await
                .unwrap();

        // Fill just under the budget, then push it over with one more update.
        let filler = "x".repeat(60); // 15 tokens per turn
        memory
            .update(
                Turn::human(filler.clone()),
                Turn::assistant(filler.clone()),
                &StubSummarizer,
                &store,
            )
            .await
            .unwrap();
        assert!(memory.token_count() <= 50);
        assert_eq!(memory.record().turn_count(), 2);

        memory
            .update(
                Turn::human("short"),
                Turn::assistant("reply"),
                &StubSummarizer,
                &store,
            )
            .await
            .unwrap();

        // 15+15+2+2 = 34 tokens: still under budget, nothing pruned yet.
        assert_eq!(memory.record().turn_count(), 4);
        assert!(memory.record().summary.is_empty());

        memory
            .update(
                Turn::human(filler.clone()),
                Turn::assistant(filler.clone()),
                &StubSummarizer,
                &store,
            )
            .await
            .unwrap();

        // 64 tokens forced pruning: the two oldest filler turns were folded
        // into the summary, leaving [short, reply, filler, filler].
        assert!(memory.token_count() <= 50);
        assert_eq!(memory.record().summary, "[folded]");
        assert_eq!(memory.record().turn_count(), 4);
        assert_eq!(memory.record().turns().next().unwrap().content, "short");
    }

    #[tokio::test]
    async fn test_budget_invariant_after_updates() {
        let store = InMemoryStore::new();
        let config = MemoryConfig { token_budget: 50 };
        let mut memory =
            ConversationMemory::for_address(test_address(), &store, config)
                .await
                .unwrap();

        for i in 0..10 {
            memory
                .update(
                    Turn::human(format!("question number {}", i)),
                    Turn::assistant(format!("answer number {}", i)),
                    &StubSummarizer,
                    &store,
                )
                .await
                .unwrap();

            // Budget invariant: holds, or is vacuous on an empty buffer.
            assert!(
                memory.token_count() <= 50 || memory.record().turn_count() == 0,
                "budget violated with non-empty buffer at update {}",
                i
            );
        }
    }

    #[tokio::test]
    async fn test_oversized_single_turn_terminates() {
        let store = InMemoryStore::new();
        let config = MemoryConfig { token_budget: 50 };
        let mut memory =
            ConversationMemory::for_address(test_address(), &store, config)
                .await
                .unwrap();

        let huge = "y".repeat(4000); // 1000 tokens, far over budget alone
        memory
            .update(Turn::human("hi"), Turn::assistant(huge), &StubSummarizer, &store)
            .await
            .unwrap();

        // Buffer drained to empty; over-budget accepted instead of looping.
        assert_eq!(memory.record().turn_count(), 0);
        assert_eq!(memory.record().summary, "[folded]");
    }

    #[tokio::test]
    async fn test_failed_summarizer_keeps_turns() {
        let store = InMemoryStore::new();
        let config = MemoryConfig { token_budget: 10 };
        let mut memory =
            ConversationMemory::for_address(test_address(), &store, config)
                .await
                .unwrap();

        memory
            .update(
                Turn::human("a long enough question to overflow"),
                Turn::assistant("a long enough answer to overflow"),
                &FailingSummarizer,
                &store,
            )
            .await
            .unwrap();

        // Nothing was lost: both turns stay buffered, over budget.
        assert_eq!(memory.record().turn_count(), 2);
        assert!(memory.token_count() > 10);
    }

    #[tokio::test]
    async fn test_prompt_turns_include_summary_and_input() {
        let store = InMemoryStore::new();
        let mut memory = ConversationMemory::build_empty(
            test_address(),
            MemoryConfig { token_budget: 1000 },
        );

        memory
            .update(
                Turn::human("hi"),
                Turn::assistant("hello"),
                &FoldingSummarizer::default(),
                &store,
            )
            .await
            .unwrap();

        let turns = memory.prompt_turns("what next?");
        assert_eq!(turns.len(), 3);
        assert_eq!(turns.last().unwrap().content, "what next?");
    }
}
