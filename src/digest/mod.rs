//! Turning raw text into a validated digest.
//!
//! - `tokens`: token counting with a character-based fallback
//! - `client`: primary JSON call with a plain-text fallback
//! - `chunker`: splitting long content and sequential chunk digestion
//! - `merge`: combining chunk responses
//! - `error`: job-level error categories

pub mod chunker;
pub mod client;
pub mod error;
pub mod merge;
pub mod tokens;

pub use chunker::{chunk_count, ChunkObserver, ChunkingConfig, ContentChunker};
pub use client::{ClientConfig, DigestOutcome, DigestionClient};
pub use error::DigestError;
pub use tokens::{default_counter, estimate_tokens, HeuristicCounter, TiktokenCounter, TokenCounter};
