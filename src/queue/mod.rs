//! Durable job queue and the worker that drains it.
//!
//! - `scheduler`: priority queue with prefetch, backoff and dead-lettering
//! - `journal`: append-only JSONL persistence for the queue
//! - `worker`: polling loop that hands jobs to the processor

pub mod journal;
pub mod scheduler;
pub mod worker;

use thiserror::Error;

pub use journal::{Journal, JournalEntry, JournalEventType};
pub use scheduler::{
    DeadLetter, EnqueueResult, JobQueue, NackOutcome, QueueConfig, QueueStats, BACKOFF_MS,
    MAX_RETRIES,
};
pub use worker::{DigestionWorker, WorkerConfig, WorkerHandle};

/// Errors that can occur with the job queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Capture already queued: {0}")]
    AlreadyQueued(String),

    #[error("Job not in flight: {0}")]
    NotInFlight(String),

    #[error("Cannot schedule retry: {0}")]
    Schedule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
