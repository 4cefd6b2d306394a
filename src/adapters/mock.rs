//! In-process provider that replays scripted replies.
//!
//! Each call pops the next scripted reply and records the request, so tests
//! can assert on how many calls were made and what was sent.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::provider::{CompletionRequest, ProviderError};
use super::CompletionProvider;

/// Provider backed by a queue of canned replies
#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a successful reply
    pub fn push_reply(&self, reply: impl Into<String>) -> &Self {
        self.lock_replies().push_back(Ok(reply.into()));
        self
    }

    /// Queue a failure
    pub fn push_error(&self, error: ProviderError) -> &Self {
        self.lock_replies().push_back(Err(error));
        self
    }

    /// Requests received so far, in call order
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Replies not yet consumed
    pub fn remaining(&self) -> usize {
        self.lock_replies().len()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, ProviderError>>> {
        self.replies.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.lock_replies()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Transport("no scripted reply left".to_string())))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
