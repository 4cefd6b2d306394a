//! Token counting for context-window budgeting.
//!
//! Uses the cl100k tokenizer when it can be loaded and falls back to a
//! four-characters-per-token estimate otherwise. Counting never fails.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

/// Counts tokens in text
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;

    fn name(&self) -> &str;
}

/// `ceil(chars / 4)`
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Character-based estimate
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    fn name(&self) -> &str {
        "chars/4"
    }
}

/// Exact BPE count via tiktoken
pub struct TiktokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenCounter {
    pub fn cl100k() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().context("Failed to load cl100k_base tokenizer")?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    fn name(&self) -> &str {
        "cl100k_base"
    }
}

/// Exact counter when available, estimate otherwise
pub fn default_counter() -> Arc<dyn TokenCounter> {
    match TiktokenCounter::cl100k() {
        Ok(counter) => Arc::new(counter),
        Err(e) => {
            warn!(error = %e, "Tokenizer unavailable, using chars/4 estimate");
            Arc::new(HeuristicCounter)
        }
    }
}
