//! Rolling summary maintenance
//!
//! When pruning evicts old turns from the buffer, the evicted text is folded
//! into the conversation's rolling summary so continuity survives the budget.

use crate::error::RelayError;
use crate::llm::ModelClient;
use crate::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Folds pruned conversation text into a rolling summary
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn fold(
        &self,
        prior_summary: &str,
        pruned_text: &str,
        at: DateTime<Utc>,
    ) -> Result<String>;
}

/// Model-backed summarizer
pub struct LlmSummarizer {
    model: Arc<dyn ModelClient>,
}

impl LlmSummarizer {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }
}

#[async_trait::async_trait]
impl Summarizer for LlmSummarizer {
    async fn fold(
        &self,
        prior_summary: &str,
        pruned_text: &str,
        at: DateTime<Utc>,
    ) -> Result<String> {
        if pruned_text.is_empty() {
            return Err(RelayError::SummarizationError(
                "Cannot summarize empty pruned text".to_string(),
            ));
        }

        let prompt = format!(
            r#"You maintain a rolling summary of an ongoing chat conversation.

Merge the messages below into the existing summary. Keep facts, names,
decisions, and open questions. Stay concise: the merged summary should be
shorter than the existing summary plus the new messages combined.

EXISTING SUMMARY (may be empty):
---
{}
---

MESSAGES TO FOLD IN (as of {}):
---
{}
---

MERGED SUMMARY:"#,
            prior_summary,
            at.format("%Y-%m-%d %H:%M:%S UTC"),
            pruned_text
        );

        info!("Folding pruned turns into rolling summary");

        match self.model.complete(&prompt).await {
            Ok(summary) => Ok(summary.trim().to_string()),
            Err(e) => {
                warn!("Summary fold failed: {}", e);
                Err(e)
            }
        }
    }
}

/// Deterministic fallback summarizer: concatenates and truncates.
///
/// Used by tests and keyless offline runs where no model is available.
pub struct FoldingSummarizer {
    max_chars: usize,
}

impl FoldingSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for FoldingSummarizer {
    fn default() -> Self {
        Self { max_chars: 400 }
    }
}

#[async_trait::async_trait]
impl Summarizer for FoldingSummarizer {
    async fn fold(
        &self,
        prior_summary: &str,
        pruned_text: &str,
        _at: DateTime<Utc>,
    ) -> Result<String> {
        let mut merged = if prior_summary.is_empty() {
            pruned_text.to_string()
        } else {
            format!("{} | {}", prior_summary, pruned_text)
        };

        if merged.len() > self.max_chars {
            // Keep the tail: recent context matters more than old context.
            let mut cut = merged.len() - self.max_chars;
            while !merged.is_char_boundary(cut) {
                cut += 1;
            }
            merged = merged.split_off(cut);
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fold_empty_prior() {
        let summarizer = FoldingSummarizer::default();
        let folded = summarizer
            .fold("", "Human: hi", Utc::now())
            .await
            .unwrap();
        assert_eq!(folded, "Human: hi");
    }

    #[tokio::test]
    async fn test_fold_appends_to_prior() {
        let summarizer = FoldingSummarizer::default();
        let folded = summarizer
            .fold("greeted earlier", "Human: what is RSI?", Utc::now())
            .await
            .unwrap();
        assert_eq!(folded, "greeted earlier | Human: what is RSI?");
    }

    #[tokio::test]
    async fn test_fold_truncates_to_tail() {
        let summarizer = FoldingSummarizer::new(10);
        let folded = summarizer
            .fold("abcdefghij", "klmnopqrst", Utc::now())
            .await
            .unwrap();
        assert_eq!(folded.len(), 10);
        assert!(folded.ends_with("klmnopqrst"));
    }
}
