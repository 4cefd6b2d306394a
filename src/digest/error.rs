//! Job-level error taxonomy.
//!
//! Every failure that can end a digestion attempt maps onto one of these
//! categories. The category decides whether the job is retried, and the
//! user-facing message never carries raw provider text.

use std::time::Duration;

use thiserror::Error;

use crate::adapters::{ExtractionError, PersistenceError};
use crate::progress::ProgressError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    /// Provider throttling; requeue at job level, no fallback
    #[error("provider rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Schema violation; terminal
    #[error("response failed validation: {0}")]
    ValidationFailed(String),

    /// Primary and fallback both ran out of time; terminal
    #[error("digestion timed out")]
    TimedOut,

    /// Broker, storage or connectivity trouble; retried via backoff
    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),

    /// Source content missing or empty; terminal
    #[error("content extraction failed: {0}")]
    ExtractionFailed(String),

    /// Cooperative cancellation observed
    #[error("digestion cancelled")]
    Cancelled,
}

impl DigestError {
    /// Stable snake_case category
    pub fn category(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::ValidationFailed(_) => "validation_failed",
            Self::TimedOut => "timed_out",
            Self::TransientInfra(_) => "transient_infra",
            Self::ExtractionFailed(_) => "extraction_failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the job should go back through the backoff table
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::TransientInfra(_))
    }

    /// Text safe to show an end user
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "The summarizer is busy right now. We'll try again shortly.",
            Self::ValidationFailed(_) => "We couldn't produce a usable summary for this capture.",
            Self::TimedOut => "Summarizing took too long and was stopped.",
            Self::TransientInfra(_) => "A temporary problem interrupted processing.",
            Self::ExtractionFailed(_) => "There was no content to summarize.",
            Self::Cancelled => "Processing was cancelled.",
        }
    }
}

impl From<ExtractionError> for DigestError {
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::Io(e) => Self::TransientInfra(e.to_string()),
            other => Self::ExtractionFailed(other.to_string()),
        }
    }
}

impl From<PersistenceError> for DigestError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::InvalidId(_) => Self::ValidationFailed(err.to_string()),
            other => Self::TransientInfra(other.to_string()),
        }
    }
}

impl From<ProgressError> for DigestError {
    fn from(err: ProgressError) -> Self {
        Self::TransientInfra(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_categories() {
        assert!(DigestError::RateLimited { retry_after: None }.is_retryable());
        assert!(DigestError::TransientInfra("broker".into()).is_retryable());

        assert!(!DigestError::ValidationFailed("bad".into()).is_retryable());
        assert!(!DigestError::TimedOut.is_retryable());
        assert!(!DigestError::ExtractionFailed("empty".into()).is_retryable());
        assert!(!DigestError::Cancelled.is_retryable());
    }

    #[test]
    fn test_user_message_hides_detail() {
        let err = DigestError::TransientInfra("redis://secret-host refused".into());
        assert!(!err.user_message().contains("secret-host"));
        assert_eq!(err.category(), "transient_infra");
    }

    #[test]
    fn test_extraction_error_mapping() {
        let err: DigestError = ExtractionError::Empty("cap-1".into()).into();
        assert_eq!(err.category(), "extraction_failed");
    }

    #[test]
    fn test_persistence_error_mapping() {
        let err: DigestError = PersistenceError::InvalidId("../x".into()).into();
        assert!(!err.is_retryable());
        let err: DigestError = PersistenceError::Unavailable("disk".into()).into();
        assert!(err.is_retryable());
    }
}
