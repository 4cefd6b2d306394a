//! Shared progress store backed by Redis.
//!
//! Each capture is one JSON value under `{prefix}progress:{captureId}`,
//! written with `SET EX`: the active TTL while digesting and the shorter
//! terminal retention once finished. A per-user set indexes the captures
//! that were active; reading it prunes members that expired or finished.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{ProgressError, ProgressStore, Retention};
use crate::domain::JobProgress;

pub const DEFAULT_KEY_PREFIX: &str = "digestion:";

#[derive(Clone)]
pub struct RedisProgressStore {
    conn: ConnectionManager,
    prefix: String,
    retention: Retention,
}

impl RedisProgressStore {
    /// Connect to `redis_url`
    pub async fn connect(redis_url: &str, retention: Retention) -> Result<Self, ProgressError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(
            active_ttl_secs = retention.active_ttl.as_secs(),
            terminal_secs = retention.terminal.as_secs(),
            "Redis progress store connected"
        );
        Ok(Self::new(conn, retention))
    }

    pub fn new(conn: ConnectionManager, retention: Retention) -> Self {
        Self {
            conn,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            retention,
        }
    }

    /// Namespace keys, e.g. per test run
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn progress_key(&self, capture_id: &str) -> String {
        format!("{}progress:{}", self.prefix, capture_id)
    }

    pub fn user_key(&self, user_id: &str) -> String {
        format!("{}user:{}:active", self.prefix, user_id)
    }

    async fn load(&self, capture_id: &str) -> Result<Option<JobProgress>, ProgressError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.progress_key(capture_id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, progress: &JobProgress, ttl_secs: u64) -> Result<(), ProgressError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(progress)?;
        conn.set_ex::<_, _, ()>(self.progress_key(&progress.capture_id), json, ttl_secs.max(1))
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        capture_id: &str,
        apply: impl FnOnce(&mut JobProgress) + Send,
    ) -> Result<Option<JobProgress>, ProgressError> {
        let Some(mut progress) = self.load(capture_id).await? else {
            warn!(capture_id, "Finish for untracked job ignored");
            return Ok(None);
        };
        if progress.status.is_terminal() {
            return Ok(Some(progress));
        }

        apply(&mut progress);
        self.store(&progress, self.retention.terminal.as_secs()).await?;

        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(self.user_key(&progress.user_id), capture_id)
            .await?;
        Ok(Some(progress))
    }
}

#[async_trait]
impl ProgressStore for RedisProgressStore {
    async fn start_tracking(
        &self,
        capture_id: &str,
        user_id: &str,
    ) -> Result<JobProgress, ProgressError> {
        let progress = JobProgress::start(capture_id, user_id, Utc::now());
        let ttl = self.retention.active_ttl.as_secs();
        self.store(&progress, ttl).await?;

        let user_key = self.user_key(user_id);
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(&user_key, capture_id).await?;
        conn.expire::<_, ()>(&user_key, ttl as i64).await?;
        Ok(progress)
    }

    async fn update_progress(&self, capture_id: &str, percentage: u8) -> Result<(), ProgressError> {
        let Some(mut progress) = self.load(capture_id).await? else {
            warn!(capture_id, percentage, "Progress update for unknown job ignored");
            return Ok(());
        };
        if !progress.is_active() {
            debug!(capture_id, "Update after terminal state ignored");
            return Ok(());
        }
        progress.apply_update(percentage, Utc::now());
        self.store(&progress, self.retention.active_ttl.as_secs()).await
    }

    async fn complete_tracking(
        &self,
        capture_id: &str,
    ) -> Result<Option<JobProgress>, ProgressError> {
        self.finish(capture_id, |progress| progress.complete(Utc::now()))
            .await
    }

    async fn fail_tracking(
        &self,
        capture_id: &str,
        error: &str,
    ) -> Result<Option<JobProgress>, ProgressError> {
        let error = error.to_string();
        self.finish(capture_id, move |progress| progress.fail(error, Utc::now()))
            .await
    }

    async fn get_progress(&self, capture_id: &str) -> Result<Option<JobProgress>, ProgressError> {
        self.load(capture_id).await
    }

    async fn get_user_active_jobs(&self, user_id: &str) -> Result<Vec<JobProgress>, ProgressError> {
        let user_key = self.user_key(user_id);
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(&user_key).await?;

        let mut active = Vec::with_capacity(members.len());
        for capture_id in members {
            match self.load(&capture_id).await? {
                Some(progress) if progress.is_active() => active.push(progress),
                _ => {
                    debug!(capture_id = %capture_id, user_id, "Pruning stale active-job index entry");
                    conn.srem::<_, _, ()>(&user_key, &capture_id).await?;
                }
            }
        }
        active.sort_by_key(|p| p.started_at);
        Ok(active)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
