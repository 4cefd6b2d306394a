//! Primary/fallback digestion client.
//!
//! The primary call asks the provider for a JSON object and validates it
//! against the response schema. Timeouts and unclassified provider errors
//! trigger a single plain-text fallback call whose reply is wrapped into a
//! low-confidence response. Rate limits and schema violations never fall
//! back; they surface as their own outcome for the job-level retry policy.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use super::error::DigestError;
use super::merge::first_sentence;
use crate::adapters::{CompletionProvider, CompletionRequest, ProviderError};
use crate::domain::response::{
    truncate_chars, IDEA_MAX_CHARS, IDEA_MIN_CHARS, SUMMARY_MAX_CHARS, SUMMARY_MIN_CHARS,
};
use crate::domain::{Confidence, DigestionResponse, ValidationError};
use crate::metrics;

/// Per-call time limit
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_TEMPERATURE: f32 = 0.3;

pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1000;

/// Appended to fallback summaries shorter than the schema minimum
pub const FALLBACK_SUMMARY_SUFFIX: &str = "(brief capture)";

/// Used when the fallback reply has no usable first sentence
pub const FALLBACK_IDEA_PLACEHOLDER: &str = "Review this capture";

pub const PRIMARY_SYSTEM_PROMPT: &str = "\
You digest personal notes and voice transcripts. Reply with a single JSON object:
{\"summary\": string (10-500 chars), \
\"ideas\": array of 1-10 strings (5-200 chars each), \
\"todos\": array of up to 10 objects {\"description\": string (3-200 chars), \
\"deadline\": string or null (max 50 chars), \"priority\": \"low\"|\"medium\"|\"high\"}, \
\"confidence\": \"low\"|\"medium\"|\"high\"}.
Only include todos the author clearly intends to do. Do not add commentary outside the JSON.";

pub const FALLBACK_SYSTEM_PROMPT: &str =
    "Summarize the following note in two or three plain sentences. Do not use lists or markup.";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

/// Result of one digestion attempt
#[derive(Debug, Clone, PartialEq)]
pub enum DigestOutcome {
    Success(DigestionResponse),
    RateLimited { retry_after: Option<Duration> },
    ValidationFailed(ValidationError),
    TimedOut,
    /// Fallback failed for a reason other than time
    Unavailable(String),
}

impl DigestOutcome {
    pub fn into_result(self) -> Result<DigestionResponse, DigestError> {
        match self {
            Self::Success(response) => Ok(response),
            Self::RateLimited { retry_after } => Err(DigestError::RateLimited { retry_after }),
            Self::ValidationFailed(e) => Err(DigestError::ValidationFailed(e.to_string())),
            Self::TimedOut => Err(DigestError::TimedOut),
            Self::Unavailable(reason) => Err(DigestError::TransientInfra(reason)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

enum CallResult {
    Reply(String),
    Failed(ProviderError),
    Elapsed,
}

/// Digests one piece of text through a [`CompletionProvider`]
#[derive(Clone)]
pub struct DigestionClient {
    provider: Arc<dyn CompletionProvider>,
    config: ClientConfig,
}

impl DigestionClient {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self::with_config(provider, ClientConfig::default())
    }

    pub fn with_config(provider: Arc<dyn CompletionProvider>, config: ClientConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn CompletionProvider> {
        &self.provider
    }

    #[instrument(skip_all, fields(provider = self.provider.name(), chars = content.len()))]
    pub async fn digest(&self, content: &str) -> DigestOutcome {
        let primary_timed_out = match self.call(self.primary_request(content)).await {
            CallResult::Reply(raw) => return Self::finish_primary(&raw),
            CallResult::Failed(ProviderError::RateLimited { retry_after }) => {
                debug!(?retry_after, "Primary call rate limited");
                return DigestOutcome::RateLimited { retry_after };
            }
            CallResult::Failed(e) => {
                warn!(error = %e, "Primary digestion failed, falling back to plain text");
                false
            }
            CallResult::Elapsed => {
                warn!(timeout_ms = self.config.timeout.as_millis() as u64, "Primary digestion timed out, falling back to plain text");
                true
            }
        };

        metrics::record_fallback();

        match self.call(self.fallback_request(content)).await {
            CallResult::Reply(raw) => Self::finish_fallback(&raw),
            CallResult::Failed(ProviderError::RateLimited { retry_after }) => {
                DigestOutcome::RateLimited { retry_after }
            }
            CallResult::Failed(e) if !primary_timed_out => DigestOutcome::Unavailable(e.to_string()),
            CallResult::Failed(e) => {
                warn!(error = %e, "Fallback failed after primary timeout");
                DigestOutcome::TimedOut
            }
            CallResult::Elapsed => DigestOutcome::TimedOut,
        }
    }

    async fn call(&self, request: CompletionRequest) -> CallResult {
        match timeout(self.config.timeout, self.provider.complete(&request)).await {
            Ok(Ok(reply)) => CallResult::Reply(reply),
            Ok(Err(e)) => CallResult::Failed(e),
            Err(_) => CallResult::Elapsed,
        }
    }

    fn primary_request(&self, content: &str) -> CompletionRequest {
        CompletionRequest {
            system: PRIMARY_SYSTEM_PROMPT.to_string(),
            prompt: content.to_string(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_output_tokens,
            json_output: true,
        }
    }

    fn fallback_request(&self, content: &str) -> CompletionRequest {
        CompletionRequest {
            system: FALLBACK_SYSTEM_PROMPT.to_string(),
            prompt: content.to_string(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_output_tokens,
            json_output: false,
        }
    }

    fn finish_primary(raw: &str) -> DigestOutcome {
        let parsed = DigestionResponse::from_model_output(raw).map(DigestionResponse::normalized);
        match parsed.and_then(|response| response.validate().map(|_| response)) {
            Ok(response) => DigestOutcome::Success(response),
            Err(e) => {
                warn!(error = %e, "Primary response failed schema validation");
                DigestOutcome::ValidationFailed(e)
            }
        }
    }

    fn finish_fallback(raw: &str) -> DigestOutcome {
        let response = fallback_response(raw);
        match response.validate() {
            Ok(()) => DigestOutcome::Success(response),
            Err(e) => DigestOutcome::ValidationFailed(e),
        }
    }
}

/// Wrap a plain-text reply into a low-confidence response
pub fn fallback_response(raw: &str) -> DigestionResponse {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut summary = truncate_chars(&text, SUMMARY_MAX_CHARS);
    if summary.chars().count() < SUMMARY_MIN_CHARS {
        summary = if summary.is_empty() {
            FALLBACK_SUMMARY_SUFFIX.to_string()
        } else {
            format!("{summary} {FALLBACK_SUMMARY_SUFFIX}")
        };
    }

    let sentence = first_sentence(&text);
    let idea = if sentence.chars().count() >= IDEA_MIN_CHARS {
        truncate_chars(sentence, IDEA_MAX_CHARS)
    } else {
        FALLBACK_IDEA_PLACEHOLDER.to_string()
    };

    DigestionResponse {
        summary,
        ideas: vec![idea],
        todos: Vec::new(),
        confidence: Confidence::Low,
    }
}
