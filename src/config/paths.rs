//! Canonical paths for the digestion pipeline.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use digestion::config::paths;
//!
//! let journal = paths::queue_journal()?;
//! let results = paths::results_dir()?;
//! ```
//!
//! ## Layout
//!
//! | Location | Purpose |
//! |----------|---------|
//! | `<home>/queue.jsonl` | Job queue journal |
//! | `<home>/results/` | One JSON digest record per capture |
//! | `<home>/content/` | Inbound capture text (`<captureId>.txt`) |

use std::path::PathBuf;

use anyhow::Result;

/// Queue journal file name
pub const QUEUE_JOURNAL_FILE: &str = "queue.jsonl";

/// Get the digestion home directory (~/.digestion)
pub fn digestion_home() -> Result<PathBuf> {
    crate::config::digestion_home()
}

/// Get the queue journal path (~/.digestion/queue.jsonl)
pub fn queue_journal() -> Result<PathBuf> {
    Ok(digestion_home()?.join(QUEUE_JOURNAL_FILE))
}

/// Get the results directory (~/.digestion/results/ unless configured)
pub fn results_dir() -> Result<PathBuf> {
    Ok(crate::config::config()?.results_dir.clone())
}

/// Get the inbound content directory (~/.digestion/content/ unless configured)
pub fn content_dir() -> Result<PathBuf> {
    Ok(crate::config::config()?.content_dir.clone())
}
