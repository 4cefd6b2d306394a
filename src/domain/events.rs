//! Events emitted by the digestion pipeline.
//!
//! Domain events (`digestion.completed` / `digestion.failed`) go out through
//! the event bus. Progress notifications are emitted to observers and never
//! persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::progress::JobStatus;
use super::response::Confidence;

pub const TOPIC_COMPLETED: &str = "digestion.completed";
pub const TOPIC_FAILED: &str = "digestion.failed";

/// Domain event published once a job reaches a terminal outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DigestionEvent {
    #[serde(rename = "digestion.completed")]
    Completed {
        #[serde(rename = "captureId")]
        capture_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "ideaCount")]
        idea_count: usize,
        #[serde(rename = "todoCount")]
        todo_count: usize,
        confidence: Confidence,
        #[serde(rename = "wasChunked")]
        was_chunked: bool,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "digestion.failed")]
    Failed {
        #[serde(rename = "captureId")]
        capture_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        /// Error category, never raw provider text
        category: String,
        message: String,
        #[serde(rename = "retryCount")]
        retry_count: u32,
        timestamp: DateTime<Utc>,
    },
}

impl DigestionEvent {
    /// Event bus topic for this event
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Completed { .. } => TOPIC_COMPLETED,
            Self::Failed { .. } => TOPIC_FAILED,
        }
    }

    pub fn capture_id(&self) -> &str {
        match self {
            Self::Completed { capture_id, .. } | Self::Failed { capture_id, .. } => capture_id,
        }
    }
}

/// Periodic progress report with an ETA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub capture_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub percentage: u8,
    pub elapsed_ms: u64,
    /// Estimated milliseconds remaining, when one can be derived
    pub eta_ms: Option<u64>,
}

/// Raised once per job when digestion runs past the warning threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutWarning {
    pub capture_id: String,
    pub user_id: String,
    pub elapsed_ms: u64,
    pub message: String,
}

/// Anything the notification orchestrator emits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressNotification {
    Progress(ProgressUpdate),
    StillProcessing {
        #[serde(rename = "captureId")]
        capture_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "elapsedMs")]
        elapsed_ms: u64,
    },
    TimeoutWarning(TimeoutWarning),
}

impl ProgressNotification {
    pub fn capture_id(&self) -> &str {
        match self {
            Self::Progress(update) => &update.capture_id,
            Self::StillProcessing { capture_id, .. } => capture_id,
            Self::TimeoutWarning(warning) => &warning.capture_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_topics() {
        let failed = DigestionEvent::Failed {
            capture_id: "cap-1".to_string(),
            user_id: "user-1".to_string(),
            category: "timed_out".to_string(),
            message: "Digestion took too long".to_string(),
            retry_count: 0,
            timestamp: Utc::now(),
        };
        assert_eq!(failed.topic(), "digestion.failed");
        assert_eq!(failed.capture_id(), "cap-1");

        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["type"], "digestion.failed");
        assert_eq!(value["captureId"], "cap-1");
    }

    #[test]
    fn test_completed_event_serialization() {
        let event = DigestionEvent::Completed {
            capture_id: "cap-2".to_string(),
            user_id: "user-1".to_string(),
            idea_count: 3,
            todo_count: 1,
            confidence: Confidence::Medium,
            was_chunked: true,
            duration_ms: 1200,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: DigestionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.topic(), TOPIC_COMPLETED);
    }
}
