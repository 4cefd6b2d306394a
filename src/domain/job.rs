//! Digestion jobs as they travel through the queue.
//!
//! A job is the unit of scheduling: one capture, one owner, one priority tier.
//! The serialized form doubles as the queue wire payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of raw content a capture holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Typed or pasted text
    Text,

    /// Speech that was transcribed upstream
    AudioTranscribed,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::AudioTranscribed => "audio_transcribed",
        }
    }
}

/// Scheduling tier. High always dispatches before normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// A queued request to digest one capture.
///
/// Wire shape: `{captureId, userId, contentType, priority, queuedAt, retryCount}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestionJob {
    /// Capture being digested (unique among in-flight jobs)
    pub capture_id: String,

    /// Owner of the capture
    pub user_id: String,

    /// Kind of source content
    pub content_type: ContentType,

    /// Scheduling tier
    pub priority: Priority,

    /// When the job first entered the queue
    pub queued_at: DateTime<Utc>,

    /// Number of retries already scheduled for this job
    #[serde(default)]
    pub retry_count: u32,
}

/// Longest accepted capture id
pub const MAX_CAPTURE_ID_LEN: usize = 128;

/// Capture ids name files on disk, so only `[A-Za-z0-9_-]` is accepted
pub fn is_valid_capture_id(capture_id: &str) -> bool {
    !capture_id.is_empty()
        && capture_id.len() <= MAX_CAPTURE_ID_LEN
        && capture_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Queue wire payload; identical to the in-process job record.
pub type DigestionJobPayload = DigestionJob;

impl DigestionJob {
    /// Create a fresh job queued now
    pub fn new(
        capture_id: impl Into<String>,
        user_id: impl Into<String>,
        content_type: ContentType,
        priority: Priority,
    ) -> Self {
        Self {
            capture_id: capture_id.into(),
            user_id: user_id.into(),
            content_type,
            priority,
            queued_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}
