//! Process-local progress store.
//!
//! Entries live in memory and are lost on restart. Terminal entries are
//! removed by [`InMemoryProgressStore::sweep_at`] once their retention
//! window has passed, and a background sweeper calls it periodically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ProgressError, ProgressStore, Retention};
use crate::domain::{JobProgress, JobStatus};

#[derive(Default)]
pub struct InMemoryProgressStore {
    entries: RwLock<HashMap<String, JobProgress>>,
    retention: Retention,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Retention) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop terminal entries past retention and active entries idle past
    /// the active TTL. Returns how many were removed.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let terminal = chrono::Duration::from_std(self.retention.terminal)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let active = chrono::Duration::from_std(self.retention.active_ttl)
            .unwrap_or_else(|_| chrono::Duration::zero());

        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, progress| match progress.status {
            JobStatus::Digesting => now - progress.last_updated_at < active,
            JobStatus::Completed | JobStatus::Failed => {
                let finished = progress.completed_at.unwrap_or(progress.last_updated_at);
                now - finished < terminal
            }
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Swept progress entries");
        }
        removed
    }

    /// Sweep every `interval` until `cancel` fires
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_at(Utc::now()).await;
                    }
                }
            }
        })
    }

    async fn finish(
        &self,
        capture_id: &str,
        apply: impl FnOnce(&mut JobProgress, DateTime<Utc>),
    ) -> Option<JobProgress> {
        let mut entries = self.entries.write().await;
        let Some(progress) = entries.get_mut(capture_id) else {
            warn!(capture_id, "Finish for untracked job ignored");
            return None;
        };
        if !progress.status.is_terminal() {
            apply(progress, Utc::now());
        }
        Some(progress.clone())
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn start_tracking(
        &self,
        capture_id: &str,
        user_id: &str,
    ) -> Result<JobProgress, ProgressError> {
        let progress = JobProgress::start(capture_id, user_id, Utc::now());
        self.entries
            .write()
            .await
            .insert(capture_id.to_string(), progress.clone());
        Ok(progress)
    }

    async fn update_progress(&self, capture_id: &str, percentage: u8) -> Result<(), ProgressError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(capture_id) {
            Some(progress) if progress.is_active() => progress.apply_update(percentage, Utc::now()),
            Some(_) => debug!(capture_id, "Update after terminal state ignored"),
            None => warn!(capture_id, percentage, "Progress update for unknown job ignored"),
        }
        Ok(())
    }

    async fn complete_tracking(
        &self,
        capture_id: &str,
    ) -> Result<Option<JobProgress>, ProgressError> {
        Ok(self
            .finish(capture_id, |progress, now| progress.complete(now))
            .await)
    }

    async fn fail_tracking(
        &self,
        capture_id: &str,
        error: &str,
    ) -> Result<Option<JobProgress>, ProgressError> {
        Ok(self
            .finish(capture_id, |progress, now| progress.fail(error, now))
            .await)
    }

    async fn get_progress(&self, capture_id: &str) -> Result<Option<JobProgress>, ProgressError> {
        Ok(self.entries.read().await.get(capture_id).cloned())
    }

    async fn get_user_active_jobs(&self, user_id: &str) -> Result<Vec<JobProgress>, ProgressError> {
        let entries = self.entries.read().await;
        let mut active: Vec<JobProgress> = entries
            .values()
            .filter(|p| p.user_id == user_id && p.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|p| p.started_at);
        Ok(active)
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_then_get() {
        let store = InMemoryProgressStore::new();
        store.start_tracking("cap-1", "user-1").await.unwrap();

        let progress = store.get_progress("cap-1").await.unwrap().unwrap();
        assert_eq!(progress.status, JobStatus::Digesting);
        assert_eq!(progress.percentage, 0);
    }

    #[tokio::test]
    async fn test_update_unknown_is_noop() {
        let store = InMemoryProgressStore::new();
        store.update_progress("missing", 50).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_complete_sets_full_percentage() {
        let store = InMemoryProgressStore::new();
        store.start_tracking("cap-1", "user-1").await.unwrap();
        store.update_progress("cap-1", 40).await.unwrap();

        let done = store.complete_tracking("cap-1").await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.percentage, 100);
        assert!(done.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_terminal_state_is_sticky() {
        let store = InMemoryProgressStore::new();
        store.start_tracking("cap-1", "user-1").await.unwrap();
        store.fail_tracking("cap-1", "Processing was cancelled.").await.unwrap();

        let after = store.complete_tracking("cap-1").await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Failed);

        store.update_progress("cap-1", 80).await.unwrap();
        let after = store.get_progress("cap-1").await.unwrap().unwrap();
        assert_eq!(after.percentage, 0);
    }

    #[tokio::test]
    async fn test_active_jobs_filter() {
        let store = InMemoryProgressStore::new();
        store.start_tracking("cap-1", "user-1").await.unwrap();
        store.start_tracking("cap-2", "user-1").await.unwrap();
        store.start_tracking("cap-3", "user-2").await.unwrap();
        store.complete_tracking("cap-2").await.unwrap();

        let active = store.get_user_active_jobs("user-1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].capture_id, "cap-1");
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_terminal() {
        let store = InMemoryProgressStore::new();
        store.start_tracking("cap-1", "user-1").await.unwrap();
        store.start_tracking("cap-2", "user-1").await.unwrap();
        store.complete_tracking("cap-1").await.unwrap();

        let now = Utc::now();
        assert_eq!(store.sweep_at(now).await, 0);

        let later = now + chrono::Duration::seconds(301);
        assert_eq!(store.sweep_at(later).await, 1);
        assert!(store.get_progress("cap-1").await.unwrap().is_none());
        assert!(store.get_progress("cap-2").await.unwrap().is_some());
    }
}
