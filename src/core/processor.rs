//! Per-job execution.
//!
//! Runs one dispatched job end to end: start tracking, extract content,
//! digest (chunked when needed), commit the result, finish tracking,
//! publish the domain event and settle the job with the queue. Failures
//! are routed by category: retryable ones go back through the backoff
//! table, terminal ones are dead-lettered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{ContentExtractor, DigestRecord, EventBus, PersistenceGateway};
use crate::digest::{ChunkObserver, ContentChunker, DigestError};
use crate::domain::{DigestionEvent, DigestionJob};
use crate::metrics;
use crate::progress::{ProgressNotifier, ProgressStore};
use crate::queue::{JobQueue, NackOutcome};

/// Percentage reported once every chunk is digested, before the commit
const DIGESTED_PERCENTAGE: usize = 90;

/// How a processed job was settled with the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    RetryScheduled { retry_count: u32 },
    DeadLettered { category: &'static str },
    Cancelled,
}

/// External collaborators a processor talks to
#[derive(Clone)]
pub struct Collaborators {
    pub extractor: Arc<dyn ContentExtractor>,
    pub persistence: Arc<dyn PersistenceGateway>,
    pub events: Arc<dyn EventBus>,
    pub progress: Arc<dyn ProgressStore>,
    pub notifier: Arc<ProgressNotifier>,
}

pub struct JobProcessor {
    queue: Arc<JobQueue>,
    chunker: ContentChunker,
    deps: Collaborators,
    cancellations: Mutex<HashMap<String, CancellationToken>>,
}

/// Reports chunk completion to the progress store
struct ProgressReporter<'a> {
    store: &'a dyn ProgressStore,
    capture_id: &'a str,
}

#[async_trait]
impl ChunkObserver for ProgressReporter<'_> {
    async fn chunk_completed(&self, completed: usize, total: usize) {
        let percentage = (completed * DIGESTED_PERCENTAGE / total.max(1)) as u8;
        if let Err(e) = self.store.update_progress(self.capture_id, percentage).await {
            warn!(capture_id = self.capture_id, error = %e, "Progress update failed");
        }
    }
}

/// Hash of digested content (first 16 hex chars of SHA-256)
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

impl JobProcessor {
    pub fn new(queue: Arc<JobQueue>, chunker: ContentChunker, deps: Collaborators) -> Self {
        Self {
            queue,
            chunker,
            deps,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    fn lock_cancellations(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.cancellations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Signal a running job to stop at its next chunk boundary.
    /// Returns whether the job was running here.
    pub fn cancel(&self, capture_id: &str) -> bool {
        match self.lock_cancellations().get(capture_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, capture_id: &str) -> bool {
        self.lock_cancellations().contains_key(capture_id)
    }

    /// Process one dispatched job and settle it with the queue
    #[instrument(skip(self, job), fields(capture_id = %job.capture_id, retry_count = job.retry_count))]
    pub async fn process(&self, job: DigestionJob) -> JobOutcome {
        let started = Instant::now();
        let cancel = CancellationToken::new();
        self.lock_cancellations()
            .insert(job.capture_id.clone(), cancel.clone());

        let watch_stop = CancellationToken::new();
        let result = match self.run(&job, &cancel, &watch_stop).await {
            // Once cancelled, no failure may send the job back for a retry
            Err(err) if cancel.is_cancelled() => {
                debug!(error = %err, "Failure after cancel treated as cancellation");
                Err(DigestError::Cancelled)
            }
            other => other,
        };

        self.lock_cancellations().remove(&job.capture_id);

        let outcome = match result {
            Ok(record) => self.on_success(&job, record, started).await,
            Err(err) => self.on_failure(&job, err).await,
        };

        watch_stop.cancel();
        self.deps.notifier.clear(&job.capture_id);
        outcome
    }

    async fn run(
        &self,
        job: &DigestionJob,
        cancel: &CancellationToken,
        watch_stop: &CancellationToken,
    ) -> Result<DigestRecord, DigestError> {
        info!(content_type = job.content_type.as_str(), "Processing job");

        self.deps
            .progress
            .start_tracking(&job.capture_id, &job.user_id)
            .await?;
        self.deps.notifier.spawn_watch(
            Arc::clone(&self.deps.progress),
            job.capture_id.clone(),
            watch_stop.clone(),
        );

        let extracted = self.deps.extractor.extract(&job.capture_id).await?;
        debug!(chars = extracted.content.len(), "Extracted content");

        let reporter = ProgressReporter {
            store: self.deps.progress.as_ref(),
            capture_id: &job.capture_id,
        };
        let result = self
            .chunker
            .digest(&extracted.content, cancel, Some(&reporter as &dyn ChunkObserver))
            .await?;

        // A cancel that raced the last provider call still wins
        if cancel.is_cancelled() {
            return Err(DigestError::Cancelled);
        }

        let record = DigestRecord::new(job, result, content_hash(&extracted.content));
        self.deps.persistence.commit(&record).await?;
        Ok(record)
    }

    async fn on_success(&self, job: &DigestionJob, record: DigestRecord, started: Instant) -> JobOutcome {
        let elapsed = started.elapsed();

        match self.deps.progress.complete_tracking(&job.capture_id).await {
            Ok(Some(progress)) => {
                self.deps.notifier.observe(&progress, Utc::now());
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not mark progress completed"),
        }

        let event = DigestionEvent::Completed {
            capture_id: job.capture_id.clone(),
            user_id: job.user_id.clone(),
            idea_count: record.ideas.len(),
            todo_count: record.todos.len(),
            confidence: record.confidence,
            was_chunked: record.was_chunked,
            duration_ms: elapsed.as_millis() as u64,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.deps.events.publish(event).await {
            warn!(error = %e, "Failed to publish completion event");
        }

        if let Err(e) = self.queue.ack(&job.capture_id).await {
            error!(error = %e, "Failed to ack job");
        }

        metrics::record_processed(elapsed);
        info!(
            duration_ms = elapsed.as_millis() as u64,
            ideas = record.ideas.len(),
            todos = record.todos.len(),
            was_chunked = record.was_chunked,
            "Job completed"
        );
        JobOutcome::Completed
    }

    async fn on_failure(&self, job: &DigestionJob, err: DigestError) -> JobOutcome {
        let category = err.category();
        metrics::record_failed(category);

        if err == DigestError::Cancelled {
            info!("Job cancelled");
            if let Err(e) = self.queue.ack(&job.capture_id).await {
                error!(error = %e, "Failed to settle cancelled job");
            }
            self.finish_failed(job, &err).await;
            return JobOutcome::Cancelled;
        }

        if err.is_retryable() {
            warn!(category, error = %err, "Job failed, retrying");
            match self.queue.nack(&job.capture_id).await {
                Ok(NackOutcome::RetryScheduled { retry_count, .. }) => {
                    return JobOutcome::RetryScheduled { retry_count };
                }
                Ok(NackOutcome::DeadLettered) => {}
                Err(e) => error!(error = %e, "Failed to nack job"),
            }
        } else {
            warn!(category, error = %err, "Job failed permanently");
            if let Err(e) = self.queue.reject(&job.capture_id, category).await {
                error!(error = %e, "Failed to dead-letter job");
            }
        }

        self.finish_failed(job, &err).await;
        JobOutcome::DeadLettered { category }
    }

    /// Fail the progress entry and publish the failure event
    async fn finish_failed(&self, job: &DigestionJob, err: &DigestError) {
        match self
            .deps
            .progress
            .fail_tracking(&job.capture_id, err.user_message())
            .await
        {
            Ok(Some(progress)) => {
                self.deps.notifier.observe(&progress, Utc::now());
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not mark progress failed"),
        }

        let event = DigestionEvent::Failed {
            capture_id: job.capture_id.clone(),
            user_id: job.user_id.clone(),
            category: err.category().to_string(),
            message: err.user_message().to_string(),
            retry_count: job.retry_count,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.deps.events.publish(event).await {
            warn!(error = %e, "Failed to publish failure event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("world"));
        assert_eq!(content_hash("hello").len(), 16);
    }
}
