//! Token-aware chunking for long content.
//!
//! Content that fits the per-call budget is digested in a single call.
//! Longer content is split into overlapping windows that are digested one
//! after another, then merged. Cancellation is checked between chunks and
//! the first failing chunk aborts the whole job.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::client::DigestionClient;
use super::error::DigestError;
use super::merge::merge_responses;
use super::tokens::TokenCounter;
use crate::domain::ChunkingResult;

pub const MAX_TOKENS_PER_CHUNK: usize = 4000;
pub const OVERLAP_TOKENS: usize = 200;

/// How far back from a split point to look for whitespace
const MAX_SNAP_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_tokens_per_chunk: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_chunk: MAX_TOKENS_PER_CHUNK,
            overlap_tokens: OVERLAP_TOKENS,
        }
    }
}

/// Number of calls needed for `token_count` tokens
pub fn chunk_count(token_count: usize, max_tokens_per_chunk: usize) -> usize {
    if token_count <= max_tokens_per_chunk {
        1
    } else {
        token_count.div_ceil(max_tokens_per_chunk.max(1))
    }
}

/// Told after each chunk finishes
#[async_trait]
pub trait ChunkObserver: Send + Sync {
    async fn chunk_completed(&self, completed: usize, total: usize);
}

pub struct ContentChunker {
    client: DigestionClient,
    counter: Arc<dyn TokenCounter>,
    config: ChunkingConfig,
}

impl ContentChunker {
    pub fn new(client: DigestionClient, counter: Arc<dyn TokenCounter>) -> Self {
        Self::with_config(client, counter, ChunkingConfig::default())
    }

    pub fn with_config(
        client: DigestionClient,
        counter: Arc<dyn TokenCounter>,
        config: ChunkingConfig,
    ) -> Self {
        Self {
            client,
            counter,
            config,
        }
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn count_tokens(&self, content: &str) -> usize {
        self.counter.count(content)
    }

    /// Split into overlapping windows. Short content comes back whole.
    pub fn split(&self, content: &str) -> Vec<String> {
        let total_tokens = self.counter.count(content);
        let count = chunk_count(total_tokens, self.config.max_tokens_per_chunk);
        if count <= 1 {
            return vec![content.to_string()];
        }

        let chars: Vec<char> = content.chars().collect();
        let offsets: Vec<usize> = content
            .char_indices()
            .map(|(idx, _)| idx)
            .chain(std::iter::once(content.len()))
            .collect();
        let n = chars.len();

        let chars_per_token = n as f64 / total_tokens as f64;
        let overlap = (self.config.overlap_tokens as f64 * chars_per_token).round() as usize;
        let segment = n.div_ceil(count);
        let window = (segment / 4).min(MAX_SNAP_CHARS);

        let mut bounds = Vec::with_capacity(count + 1);
        bounds.push(0);
        for i in 1..count {
            let target = (i * segment).min(n);
            let floor = bounds[i - 1];
            bounds.push(snap_to_whitespace(&chars, target, floor, window));
        }
        bounds.push(n);

        (0..count)
            .map(|i| {
                let start = if i == 0 {
                    0
                } else {
                    bounds[i].saturating_sub(overlap).max(bounds[i - 1])
                };
                content[offsets[start]..offsets[bounds[i + 1]]].to_string()
            })
            .collect()
    }

    /// Digest content, chunking when it exceeds the per-call budget
    #[instrument(skip_all, fields(chars = content.len()))]
    pub async fn digest(
        &self,
        content: &str,
        cancel: &CancellationToken,
        observer: Option<&dyn ChunkObserver>,
    ) -> Result<ChunkingResult, DigestError> {
        let tokens = self.counter.count(content);

        if tokens <= self.config.max_tokens_per_chunk {
            if cancel.is_cancelled() {
                return Err(DigestError::Cancelled);
            }
            let response = self.client.digest(content).await.into_result()?;
            if let Some(observer) = observer {
                observer.chunk_completed(1, 1).await;
            }
            return Ok(ChunkingResult::single(response));
        }

        let chunks = self.split(content);
        let total = chunks.len();
        info!(tokens, chunks = total, counter = self.counter.name(), "Digesting in chunks");

        let mut responses = Vec::with_capacity(total);
        for (index, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(completed = index, total, "Cancelled between chunks");
                return Err(DigestError::Cancelled);
            }
            let response = self.client.digest(chunk).await.into_result()?;
            responses.push(response);
            if let Some(observer) = observer {
                observer.chunk_completed(index + 1, total).await;
            }
        }

        let merged = merge_responses(&responses);
        merged
            .validate()
            .map_err(|e| DigestError::ValidationFailed(e.to_string()))?;

        Ok(ChunkingResult::chunked(merged, total))
    }
}

/// Move `target` back onto a word boundary, staying above `floor`
fn snap_to_whitespace(chars: &[char], target: usize, floor: usize, window: usize) -> usize {
    let lower = target.saturating_sub(window).max(floor + 1);
    if lower > target {
        return target;
    }
    (lower..=target)
        .rev()
        .find(|&idx| idx > 0 && idx < chars.len() && chars[idx - 1].is_whitespace())
        .unwrap_or(target)
}
