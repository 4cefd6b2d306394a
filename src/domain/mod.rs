//! Domain types for the digestion pipeline.
//!
//! This module contains the core data structures:
//! - Job: Queued digestion requests (and their wire payload)
//! - Response: Structured summaries and schema validation
//! - Progress: Lifecycle records for in-flight jobs
//! - Events: Domain events and progress notifications

pub mod events;
pub mod job;
pub mod progress;
pub mod response;

// Re-export commonly used types
pub use events::{DigestionEvent, ProgressNotification, ProgressUpdate, TimeoutWarning};
pub use job::{
    is_valid_capture_id, ContentType, DigestionJob, DigestionJobPayload, Priority,
    MAX_CAPTURE_ID_LEN,
};
pub use progress::{JobProgress, JobStatus};
pub use response::{
    ChunkingResult, Confidence, DigestionResponse, Todo, TodoPriority, ValidationError,
};
