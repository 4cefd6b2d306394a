//! Priority job queue with bounded dispatch, retry backoff and dead-lettering.
//!
//! Jobs move through `queued -> in-flight -> acked | retry-scheduled |
//! dead-lettered`. `dequeue` hands out nothing while the in-flight count is
//! at the prefetch limit; that is the only backpressure. High-priority jobs
//! always dispatch before normal ones, FIFO within a tier.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::journal::{Journal, JournalEntry, ReplayedState};
use super::QueueError;
use crate::domain::{DigestionJob, Priority};
use crate::metrics;

/// Delay before retry n+1, indexed by the job's retry count
pub const BACKOFF_MS: [u64; 3] = [5000, 15000, 45000];

pub const MAX_RETRIES: u32 = 3;

pub const DEFAULT_PREFETCH: usize = 3;

pub const DEFAULT_OVERLOAD_THRESHOLD: usize = 100;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Jobs that may be in flight at once
    pub prefetch: usize,

    /// Depth above which producers are told to back off
    pub overload_threshold: usize,

    pub backoff: Vec<Duration>,

    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            overload_threshold: DEFAULT_OVERLOAD_THRESHOLD,
            backoff: BACKOFF_MS.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            max_retries: MAX_RETRIES,
        }
    }
}

impl QueueConfig {
    /// Backoff for a job that has been retried `retry_count` times.
    /// `None` once retries are exhausted.
    pub fn backoff_delay(&self, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.max_retries {
            return None;
        }
        let last = self.backoff.last().copied()?;
        Some(
            self.backoff
                .get(retry_count as usize)
                .copied()
                .unwrap_or(last),
        )
    }
}

/// A job that will not be retried
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job: DigestionJob,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueResult {
    /// Waiting jobs after the insert
    pub depth: usize,

    /// Whether depth is above the overload threshold
    pub overloaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Requeued after `delay`, now on attempt `retry_count`
    RetryScheduled { retry_count: u32, delay: Duration },
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub depth: usize,
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
    pub prefetch: usize,
    pub overloaded: bool,
}

#[derive(Default)]
struct QueueState {
    high: VecDeque<DigestionJob>,
    normal: VecDeque<DigestionJob>,
    /// Backed-off jobs with the time they become ready
    delayed: Vec<(DateTime<Utc>, DigestionJob)>,
    in_flight: HashMap<String, DigestionJob>,
    dead_letters: Vec<DeadLetter>,
}

impl QueueState {
    fn tier(&mut self, priority: Priority) -> &mut VecDeque<DigestionJob> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
        }
    }

    fn ready_len(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    fn depth(&self) -> usize {
        self.ready_len() + self.delayed.len()
    }

    fn contains(&self, capture_id: &str) -> bool {
        self.in_flight.contains_key(capture_id)
            || self.high.iter().any(|j| j.capture_id == capture_id)
            || self.normal.iter().any(|j| j.capture_id == capture_id)
            || self.delayed.iter().any(|(_, j)| j.capture_id == capture_id)
    }

    /// Move delayed jobs whose time has come to the back of their tier
    fn promote_due(&mut self, now: DateTime<Utc>) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(at, _)| *at);
        let due = self.delayed.partition_point(|(at, _)| *at <= now);
        let ready: Vec<_> = self.delayed.drain(..due).collect();
        for (_, job) in ready {
            let priority = job.priority;
            self.tier(priority).push_back(job);
        }
    }
}

/// The job queue. Journaled when opened from a path, purely in memory
/// otherwise.
pub struct JobQueue {
    state: Mutex<QueueState>,
    journal: Option<Journal>,
    config: QueueConfig,
    notify: Notify,
    depth: AtomicUsize,
    in_flight: AtomicUsize,
    overloaded: AtomicBool,
}

impl JobQueue {
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::build(QueueState::default(), None, config)
    }

    /// Open a journaled queue, replaying existing state.
    ///
    /// Jobs that were in flight when the journal ended are redelivered at
    /// the head of their tier. The journal is compacted to live state.
    pub async fn open(path: impl AsRef<Path>, config: QueueConfig) -> Result<Self, QueueError> {
        let journal = Journal::new(path.as_ref());
        let replayed = journal.replay().await?;

        let mut state = QueueState::default();
        let mut compacted = Vec::new();
        let mut redelivered = 0usize;

        for item in replayed
            .live
            .iter()
            .filter(|item| item.state == ReplayedState::InFlight)
        {
            state.tier(item.job.priority).push_back(item.job.clone());
            compacted.push(JournalEntry::enqueued(&item.job)?);
            redelivered += 1;
        }
        for item in replayed
            .live
            .iter()
            .filter(|item| item.state != ReplayedState::InFlight)
        {
            compacted.push(JournalEntry::enqueued(&item.job)?);
            match item.state {
                ReplayedState::Delayed(at) => {
                    compacted.push(JournalEntry::retry_scheduled(
                        &item.job.capture_id,
                        item.job.retry_count,
                        at,
                    )?);
                    state.delayed.push((at, item.job.clone()));
                }
                _ => state.tier(item.job.priority).push_back(item.job.clone()),
            }
        }
        for dead in &replayed.dead_letters {
            compacted.push(JournalEntry::enqueued(&dead.job)?);
            let mut entry = JournalEntry::dead_lettered(&dead.job.capture_id, &dead.reason)?;
            entry.timestamp = dead.dead_lettered_at;
            compacted.push(entry);
        }
        state.dead_letters = replayed.dead_letters;

        journal.rewrite(&compacted).await?;

        info!(
            path = %journal.path().display(),
            depth = state.depth(),
            redelivered,
            dead_letters = state.dead_letters.len(),
            "Opened job queue"
        );

        Ok(Self::build(state, Some(journal), config))
    }

    fn build(state: QueueState, journal: Option<Journal>, config: QueueConfig) -> Self {
        let depth = state.depth();
        let overloaded = depth > config.overload_threshold;
        Self {
            state: Mutex::new(state),
            journal,
            config,
            notify: Notify::new(),
            depth: AtomicUsize::new(depth),
            in_flight: AtomicUsize::new(0),
            overloaded: AtomicBool::new(overloaded),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn record(&self, entry: JournalEntry) -> Result<(), QueueError> {
        if let Some(journal) = &self.journal {
            journal.append(&entry).await?;
        }
        Ok(())
    }

    /// Refresh counters after a state change
    fn publish_counts(&self, state: &QueueState) {
        let depth = state.depth();
        let in_flight = state.in_flight.len();
        self.depth.store(depth, Ordering::SeqCst);
        self.in_flight.store(in_flight, Ordering::SeqCst);
        metrics::set_queue_depth(depth);
        metrics::set_in_flight(in_flight);

        let overloaded = depth > self.config.overload_threshold;
        let was = self.overloaded.swap(overloaded, Ordering::SeqCst);
        if overloaded && !was {
            warn!(depth, threshold = self.config.overload_threshold, "Queue overloaded");
        } else if !overloaded && was {
            info!(depth, "Queue no longer overloaded");
        }
    }

    /// Add a job behind all queued jobs of equal or higher priority
    pub async fn enqueue(&self, job: DigestionJob) -> Result<EnqueueResult, QueueError> {
        let mut state = self.state.lock().await;
        if state.contains(&job.capture_id) {
            return Err(QueueError::AlreadyQueued(job.capture_id));
        }

        self.record(JournalEntry::enqueued(&job)?).await?;

        debug!(capture_id = %job.capture_id, priority = job.priority.as_str(), "Enqueued job");
        let priority = job.priority;
        state.tier(priority).push_back(job);
        self.publish_counts(&state);
        drop(state);

        self.notify.notify_one();
        Ok(EnqueueResult {
            depth: self.depth(),
            overloaded: self.is_overloaded(),
        })
    }

    pub async fn dequeue(&self) -> Result<Option<DigestionJob>, QueueError> {
        self.dequeue_at(Utc::now()).await
    }

    /// Next job as of `now`, or `None` when nothing is ready or the
    /// prefetch limit is reached
    pub async fn dequeue_at(&self, now: DateTime<Utc>) -> Result<Option<DigestionJob>, QueueError> {
        let mut state = self.state.lock().await;
        if state.in_flight.len() >= self.config.prefetch {
            return Ok(None);
        }

        let before = state.ready_len();
        state.promote_due(now);
        let promoted = state.ready_len() != before;

        let next = match (state.high.front(), state.normal.front()) {
            (Some(job), _) | (None, Some(job)) => job.capture_id.clone(),
            (None, None) => {
                if promoted {
                    self.publish_counts(&state);
                }
                return Ok(None);
            }
        };

        self.record(JournalEntry::dispatched(&next)).await?;

        let job = match state.high.pop_front() {
            Some(job) => job,
            None => match state.normal.pop_front() {
                Some(job) => job,
                None => return Ok(None),
            },
        };
        state.in_flight.insert(job.capture_id.clone(), job.clone());
        self.publish_counts(&state);

        debug!(capture_id = %job.capture_id, retry_count = job.retry_count, "Dispatched job");
        Ok(Some(job))
    }

    /// Mark an in-flight job done and free its slot
    pub async fn ack(&self, capture_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if !state.in_flight.contains_key(capture_id) {
            return Err(QueueError::NotInFlight(capture_id.to_string()));
        }

        self.record(JournalEntry::acked(capture_id)).await?;
        state.in_flight.remove(capture_id);
        self.publish_counts(&state);
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    pub async fn nack(&self, capture_id: &str) -> Result<NackOutcome, QueueError> {
        self.nack_at(capture_id, Utc::now()).await
    }

    /// Schedule a retry from the backoff table, or dead-letter the job once
    /// its retries are used up
    pub async fn nack_at(
        &self,
        capture_id: &str,
        now: DateTime<Utc>,
    ) -> Result<NackOutcome, QueueError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.in_flight.get(capture_id).cloned() else {
            return Err(QueueError::NotInFlight(capture_id.to_string()));
        };

        let Some(delay) = self.config.backoff_delay(job.retry_count) else {
            drop(state);
            self.reject(capture_id, "retries exhausted").await?;
            return Ok(NackOutcome::DeadLettered);
        };

        let retry_count = job.retry_count + 1;
        let available_at = now
            + chrono::Duration::from_std(delay).map_err(|e| QueueError::Schedule(e.to_string()))?;
        self.record(JournalEntry::retry_scheduled(capture_id, retry_count, available_at)?)
            .await?;

        state.in_flight.remove(capture_id);
        let mut job = job;
        job.retry_count = retry_count;
        state.delayed.push((available_at, job));
        self.publish_counts(&state);
        drop(state);

        metrics::record_retry();
        info!(capture_id, retry_count, delay_ms = delay.as_millis() as u64, "Scheduled retry");
        self.notify.notify_one();
        Ok(NackOutcome::RetryScheduled { retry_count, delay })
    }

    /// Dead-letter an in-flight job without retrying
    pub async fn reject(&self, capture_id: &str, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if !state.in_flight.contains_key(capture_id) {
            return Err(QueueError::NotInFlight(capture_id.to_string()));
        }

        self.record(JournalEntry::dead_lettered(capture_id, reason)?)
            .await?;

        if let Some(job) = state.in_flight.remove(capture_id) {
            warn!(capture_id, retry_count = job.retry_count, reason, "Dead-lettered job");
            state.dead_letters.push(DeadLetter {
                job,
                reason: reason.to_string(),
                dead_lettered_at: Utc::now(),
            });
        }
        self.publish_counts(&state);
        drop(state);

        metrics::record_dead_letter();
        self.notify.notify_one();
        Ok(())
    }

    /// Withdraw a job that has not been dispatched. Returns whether one was
    /// found.
    pub async fn remove(&self, capture_id: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let queued = state.high.iter().any(|j| j.capture_id == capture_id)
            || state.normal.iter().any(|j| j.capture_id == capture_id)
            || state.delayed.iter().any(|(_, j)| j.capture_id == capture_id);
        if !queued {
            return Ok(false);
        }

        self.record(JournalEntry::removed(capture_id)).await?;
        state.high.retain(|j| j.capture_id != capture_id);
        state.normal.retain(|j| j.capture_id != capture_id);
        state.delayed.retain(|(_, j)| j.capture_id != capture_id);
        self.publish_counts(&state);

        debug!(capture_id, "Removed queued job");
        Ok(true)
    }

    /// Waiting jobs, ready and delayed
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::SeqCst)
    }

    /// Zero-based dispatch position of a waiting job. Delayed jobs rank
    /// after every ready job, by due time.
    pub async fn position(&self, capture_id: &str) -> Option<usize> {
        let state = self.state.lock().await;
        let mut delayed: Vec<&(DateTime<Utc>, DigestionJob)> = state.delayed.iter().collect();
        delayed.sort_by_key(|(at, _)| *at);

        state
            .high
            .iter()
            .chain(state.normal.iter())
            .chain(delayed.into_iter().map(|(_, job)| job))
            .position(|job| job.capture_id == capture_id)
    }

    pub async fn is_in_flight(&self, capture_id: &str) -> bool {
        self.state.lock().await.in_flight.contains_key(capture_id)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Earliest time a delayed job becomes ready
    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state.delayed.iter().map(|(at, _)| *at).min()
    }

    /// Resolves when a job is enqueued or a slot frees up
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            depth: state.depth(),
            ready: state.ready_len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight.len(),
            dead_letters: state.dead_letters.len(),
            prefetch: self.config.prefetch,
            overloaded: state.depth() > self.config.overload_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ContentType;

    fn job(id: &str, priority: Priority) -> DigestionJob {
        DigestionJob::new(id, "user-1", ContentType::Text, priority)
    }

    #[test]
    fn test_backoff_table() {
        let config = QueueConfig::default();
        assert_eq!(config.backoff_delay(0), Some(Duration::from_millis(5000)));
        assert_eq!(config.backoff_delay(1), Some(Duration::from_millis(15000)));
        assert_eq!(config.backoff_delay(2), Some(Duration::from_millis(45000)));
        assert_eq!(config.backoff_delay(3), None);
    }

    #[tokio::test]
    async fn test_fifo_within_tier() {
        let queue = JobQueue::in_memory(QueueConfig::default());
        queue.enqueue(job("a", Priority::Normal)).await.unwrap();
        queue.enqueue(job("b", Priority::Normal)).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().unwrap().capture_id, "a");
        assert_eq!(queue.dequeue().await.unwrap().unwrap().capture_id, "b");
    }

    #[tokio::test]
    async fn test_duplicate_capture_rejected() {
        let queue = JobQueue::in_memory(QueueConfig::default());
        queue.enqueue(job("a", Priority::Normal)).await.unwrap();
        let err = queue.enqueue(job("a", Priority::High)).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyQueued(id) if id == "a"));
    }

    #[tokio::test]
    async fn test_ack_unknown_job() {
        let queue = JobQueue::in_memory(QueueConfig::default());
        assert!(matches!(
            queue.ack("missing").await,
            Err(QueueError::NotInFlight(_))
        ));
    }

    #[tokio::test]
    async fn test_overload_signal() {
        let config = QueueConfig {
            overload_threshold: 2,
            ..QueueConfig::default()
        };
        let queue = JobQueue::in_memory(config);
        assert!(!queue.enqueue(job("a", Priority::Normal)).await.unwrap().overloaded);
        assert!(!queue.enqueue(job("b", Priority::Normal)).await.unwrap().overloaded);
        let result = queue.enqueue(job("c", Priority::Normal)).await.unwrap();
        assert!(result.overloaded);
        assert_eq!(result.depth, 3);
    }

    #[tokio::test]
    async fn test_remove_queued() {
        let queue = JobQueue::in_memory(QueueConfig::default());
        queue.enqueue(job("a", Priority::Normal)).await.unwrap();
        queue.enqueue(job("b", Priority::Normal)).await.unwrap();

        assert!(queue.remove("a").await.unwrap());
        assert!(!queue.remove("a").await.unwrap());
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().capture_id, "b");
        // In-flight jobs are not withdrawn
        assert!(!queue.remove("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_position() {
        let queue = JobQueue::in_memory(QueueConfig::default());
        queue.enqueue(job("a", Priority::Normal)).await.unwrap();
        queue.enqueue(job("b", Priority::High)).await.unwrap();

        assert_eq!(queue.position("b").await, Some(0));
        assert_eq!(queue.position("a").await, Some(1));
        assert_eq!(queue.position("zzz").await, None);
    }
}
