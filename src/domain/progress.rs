//! Lifecycle record for an in-flight digestion.
//!
//! A progress entry is created when a worker starts a job and is mutated
//! only by that worker. Terminal entries linger for a retention window so
//! late status queries still see the outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a tracked job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Worker is digesting the capture
    Digesting,

    /// Result committed
    Completed,

    /// Gave up (error text is category-level)
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Digesting)
    }
}

/// Tracked state of one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub capture_id: String,

    pub user_id: String,

    pub status: JobStatus,

    /// 0-100
    pub percentage: u8,

    pub started_at: DateTime<Utc>,

    pub last_updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgress {
    /// Start tracking at 0%
    pub fn start(capture_id: impl Into<String>, user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            capture_id: capture_id.into(),
            user_id: user_id.into(),
            status: JobStatus::Digesting,
            percentage: 0,
            started_at: now,
            last_updated_at: now,
            completed_at: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Record a new percentage (clamped to 100)
    pub fn apply_update(&mut self, percentage: u8, now: DateTime<Utc>) {
        self.percentage = percentage.min(100);
        self.last_updated_at = now;
    }

    /// Mark completed at 100%
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.percentage = 100;
        self.finish(now);
    }

    /// Mark failed, keeping the last reported percentage
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.finish(now);
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.last_updated_at = now;
        self.completed_at = Some(now);
        self.duration_ms = Some(self.elapsed_ms(now));
    }

    /// Milliseconds since start, never negative
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Digesting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_start_state() {
        let now = Utc::now();
        let progress = JobProgress::start("cap-1", "user-1", now);

        assert_eq!(progress.status, JobStatus::Digesting);
        assert_eq!(progress.percentage, 0);
        assert_eq!(progress.started_at, now);
        assert!(progress.completed_at.is_none());
    }

    #[test]
    fn test_complete_sets_hundred_and_duration() {
        let start = Utc::now();
        let mut progress = JobProgress::start("cap-1", "user-1", start);
        progress.apply_update(40, start + Duration::milliseconds(500));
        progress.complete(start + Duration::milliseconds(1500));

        assert_eq!(progress.status, JobStatus::Completed);
        assert_eq!(progress.percentage, 100);
        assert_eq!(progress.duration_ms, Some(1500));
    }

    #[test]
    fn test_duration_never_negative() {
        let start = Utc::now();
        let mut progress = JobProgress::start("cap-1", "user-1", start);
        progress.complete(start - Duration::seconds(5));
        assert_eq!(progress.duration_ms, Some(0));
    }

    #[test]
    fn test_fail_keeps_percentage() {
        let start = Utc::now();
        let mut progress = JobProgress::start("cap-1", "user-1", start);
        progress.apply_update(60, start);
        progress.fail("provider unavailable", start + Duration::seconds(2));

        assert_eq!(progress.status, JobStatus::Failed);
        assert_eq!(progress.percentage, 60);
        assert_eq!(progress.error.as_deref(), Some("provider unavailable"));
        assert!(progress.status.is_terminal());
    }

    #[test]
    fn test_percentage_clamped() {
        let now = Utc::now();
        let mut progress = JobProgress::start("cap-1", "user-1", now);
        progress.apply_update(250, now);
        assert_eq!(progress.percentage, 100);
    }

    #[test]
    fn test_serialized_record_shape() {
        let progress = JobProgress::start("cap-1", "user-1", Utc::now());
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["captureId"], "cap-1");
        assert_eq!(value["status"], "digesting");
        assert_eq!(value["percentage"], 0);
        assert!(value.get("completedAt").is_none());
    }
}
