//! digestion - Asynchronous content digestion pipeline
//!
//! Turns raw captures (typed text or voice transcripts) into a short
//! summary, a handful of ideas and extracted todos by calling a
//! language-model provider.
//!
//! # Architecture
//!
//! Jobs flow through a durable priority queue to workers:
//! - The queue persists every transition to a JSONL journal and replays it
//!   on start; failed jobs back off and are dead-lettered after three retries
//! - A worker runs up to `prefetch` jobs at once
//! - Long content is split into overlapping chunks, digested one chunk at a
//!   time and merged
//! - Progress is tracked in a pluggable store and turned into ETA,
//!   still-processing and timeout notifications
//!
//! # Modules
//!
//! - `domain`: Data structures (DigestionJob, DigestionResponse, JobProgress)
//! - `digest`: Provider calls, chunking and merging
//! - `queue`: Scheduler, journal and worker
//! - `progress`: Progress stores and the notification orchestrator
//! - `adapters`: Provider, content source, persistence and event bus
//! - `core`: Job processor and the service facade
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Queue a capture
//! digestion submit notes.txt --user alice
//!
//! # Process everything queued, then exit
//! digestion work --drain
//!
//! # Check a capture
//! digestion status <capture-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod digest;
pub mod domain;
pub mod metrics;
pub mod progress;
pub mod queue;

// Re-export main types at crate root for convenience
pub use core::{CancelOutcome, DigestionService, JobOutcome, ServiceError, Submission};
pub use digest::DigestError;
pub use domain::{
    ChunkingResult, ContentType, DigestionEvent, DigestionJob, DigestionResponse, JobProgress,
    JobStatus, Priority, ProgressNotification,
};
pub use progress::ProgressStore;
pub use queue::{JobQueue, QueueConfig};
