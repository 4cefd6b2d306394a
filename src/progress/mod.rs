//! Job progress tracking and user-facing notifications.
//!
//! One [`ProgressStore`] interface with two interchangeable backends:
//! - `local`: process-local map, terminal entries removed by a sweeper
//! - `redis`: shared store, retention enforced by key expiry
//!
//! The `notifier` turns stored progress into rate-limited notifications.

pub mod local;
pub mod notifier;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::JobProgress;

pub use self::local::InMemoryProgressStore;
pub use self::notifier::{NotifierConfig, ProgressNotifier};
pub use self::redis::RedisProgressStore;

/// Active entries expire after this long without an update (shared backend)
pub const DEFAULT_ACTIVE_TTL: Duration = Duration::from_secs(600);

/// Terminal entries are kept this long
pub const DEFAULT_TERMINAL_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Progress backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<::redis::RedisError> for ProgressError {
    fn from(err: ::redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Retention windows shared by both backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub active_ttl: Duration,
    pub terminal: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            active_ttl: DEFAULT_ACTIVE_TTL,
            terminal: DEFAULT_TERMINAL_RETENTION,
        }
    }
}

/// Lifecycle tracking for in-flight and recently finished jobs.
///
/// The owning worker is the only writer for a given capture, so
/// implementations use last-write-wins without locking across calls.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Begin (or restart) tracking: digesting at 0%
    async fn start_tracking(
        &self,
        capture_id: &str,
        user_id: &str,
    ) -> Result<JobProgress, ProgressError>;

    /// Set the percentage. Unknown jobs are ignored with a warning.
    async fn update_progress(&self, capture_id: &str, percentage: u8)
        -> Result<(), ProgressError>;

    /// Mark completed at 100%. Already-terminal entries are left as they are.
    async fn complete_tracking(&self, capture_id: &str)
        -> Result<Option<JobProgress>, ProgressError>;

    /// Mark failed with a user-safe message. Already-terminal entries are
    /// left as they are.
    async fn fail_tracking(
        &self,
        capture_id: &str,
        error: &str,
    ) -> Result<Option<JobProgress>, ProgressError>;

    async fn get_progress(&self, capture_id: &str) -> Result<Option<JobProgress>, ProgressError>;

    /// Only `digesting` entries for the user
    async fn get_user_active_jobs(&self, user_id: &str) -> Result<Vec<JobProgress>, ProgressError>;

    /// Backend name for logs and status output
    fn backend(&self) -> &'static str;
}
