//! Core orchestration logic.
//!
//! This module contains:
//! - Processor: runs one job end to end and settles it with the queue
//! - Service: composition root and caller-facing operations

pub mod processor;
pub mod service;

// Re-export commonly used types
pub use processor::{content_hash, Collaborators, JobOutcome, JobProcessor};
pub use service::{
    CancelOutcome, DigestionService, DigestionServiceBuilder, ServiceError, Submission,
};
