//! Append-only JSONL journal behind the job queue.
//!
//! Every state transition is appended as one JSON line and queue state is
//! derived by replaying the file on open.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use super::scheduler::DeadLetter;
use super::QueueError;
use crate::domain::DigestionJob;

/// One line of the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,

    pub capture_id: String,

    pub event_type: JournalEventType,

    /// Payload, depends on the event type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventType {
    /// Job accepted; data is the job
    Enqueued,

    /// Handed to a worker
    Dispatched,

    /// Finished successfully
    Acked,

    /// Requeued after a delay; data is a [`RetryData`]
    RetryScheduled,

    /// Moved to the dead-letter list; data is a [`DeadLetterData`]
    DeadLettered,

    /// Withdrawn before dispatch
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryData {
    pub retry_count: u32,
    pub available_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterData {
    pub reason: String,
}

impl JournalEntry {
    fn new(capture_id: &str, event_type: JournalEventType, data: Option<serde_json::Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            capture_id: capture_id.to_string(),
            event_type,
            data,
        }
    }

    pub fn enqueued(job: &DigestionJob) -> Result<Self, QueueError> {
        Ok(Self::new(
            &job.capture_id,
            JournalEventType::Enqueued,
            Some(serde_json::to_value(job)?),
        ))
    }

    pub fn dispatched(capture_id: &str) -> Self {
        Self::new(capture_id, JournalEventType::Dispatched, None)
    }

    pub fn acked(capture_id: &str) -> Self {
        Self::new(capture_id, JournalEventType::Acked, None)
    }

    pub fn removed(capture_id: &str) -> Self {
        Self::new(capture_id, JournalEventType::Removed, None)
    }

    pub fn retry_scheduled(
        capture_id: &str,
        retry_count: u32,
        available_at: DateTime<Utc>,
    ) -> Result<Self, QueueError> {
        let data = RetryData {
            retry_count,
            available_at,
        };
        Ok(Self::new(
            capture_id,
            JournalEventType::RetryScheduled,
            Some(serde_json::to_value(data)?),
        ))
    }

    pub fn dead_lettered(capture_id: &str, reason: &str) -> Result<Self, QueueError> {
        let data = DeadLetterData {
            reason: reason.to_string(),
        };
        Ok(Self::new(
            capture_id,
            JournalEventType::DeadLettered,
            Some(serde_json::to_value(data)?),
        ))
    }
}

/// Where a live job stood when the journal ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayedState {
    Ready,
    /// Dispatched but never acknowledged
    InFlight,
    Delayed(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct ReplayedJob {
    pub job: DigestionJob,
    pub state: ReplayedState,
    seq: u64,
}

/// Queue state rebuilt from the journal
#[derive(Debug, Default)]
pub struct ReplayedQueue {
    /// Unfinished jobs in the order they were (re)queued
    pub live: Vec<ReplayedJob>,
    pub dead_letters: Vec<DeadLetter>,
}

pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry
    pub async fn append(&self, entry: &JournalEntry) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let json = serde_json::to_string(entry)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    /// Replay all entries to rebuild queue state
    pub async fn replay(&self) -> Result<ReplayedQueue, QueueError> {
        let mut live: HashMap<String, ReplayedJob> = HashMap::new();
        let mut dead_letters = Vec::new();
        let mut seq = 0u64;

        if !self.path.exists() {
            return Ok(ReplayedQueue::default());
        }

        let file = File::open(&self.path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            // A torn final write must not keep the queue from opening
            let entry: JournalEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(line = line_no, error = %e, path = %self.path.display(), "Skipping unreadable journal line");
                    continue;
                }
            };

            seq += 1;
            Self::apply_entry(&mut live, &mut dead_letters, entry, seq);
        }

        let mut live: Vec<ReplayedJob> = live.into_values().collect();
        live.sort_by_key(|job| job.seq);

        Ok(ReplayedQueue { live, dead_letters })
    }

    fn apply_entry(
        live: &mut HashMap<String, ReplayedJob>,
        dead_letters: &mut Vec<DeadLetter>,
        entry: JournalEntry,
        seq: u64,
    ) {
        match entry.event_type {
            JournalEventType::Enqueued => {
                let job = entry
                    .data
                    .and_then(|data| serde_json::from_value::<DigestionJob>(data).ok());
                if let Some(job) = job {
                    live.insert(
                        entry.capture_id,
                        ReplayedJob {
                            job,
                            state: ReplayedState::Ready,
                            seq,
                        },
                    );
                }
            }
            JournalEventType::Dispatched => {
                if let Some(item) = live.get_mut(&entry.capture_id) {
                    item.state = ReplayedState::InFlight;
                }
            }
            JournalEventType::Acked | JournalEventType::Removed => {
                live.remove(&entry.capture_id);
            }
            JournalEventType::RetryScheduled => {
                let data = entry
                    .data
                    .and_then(|data| serde_json::from_value::<RetryData>(data).ok());
                if let (Some(item), Some(data)) = (live.get_mut(&entry.capture_id), data) {
                    item.job.retry_count = data.retry_count;
                    item.state = ReplayedState::Delayed(data.available_at);
                    item.seq = seq;
                }
            }
            JournalEventType::DeadLettered => {
                if let Some(item) = live.remove(&entry.capture_id) {
                    let reason = entry
                        .data
                        .and_then(|data| serde_json::from_value::<DeadLetterData>(data).ok())
                        .map(|data| data.reason)
                        .unwrap_or_default();
                    dead_letters.push(DeadLetter {
                        job: item.job,
                        reason,
                        dead_lettered_at: entry.timestamp,
                    });
                }
            }
        }
    }

    /// Replace the journal with `entries`, written to a sibling and renamed
    pub async fn rewrite(&self, entries: &[JournalEntry]) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut body = String::new();
        for entry in entries {
            body.push_str(&serde_json::to_string(entry)?);
            body.push('\n');
        }

        let tmp_path = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp_path, body.as_bytes()).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}
