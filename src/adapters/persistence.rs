//! Persistence gateway for finished digests.
//!
//! A commit either stores the whole record or nothing: file-backed records
//! are written to a temporary sibling and renamed into place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

use crate::domain::{
    is_valid_capture_id, ChunkingResult, Confidence, ContentType, DigestionJob, Todo,
};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid capture id: {0:?}")]
    InvalidId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The persisted result of one digestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestRecord {
    pub capture_id: String,
    pub user_id: String,
    pub content_type: ContentType,
    pub summary: String,
    pub ideas: Vec<String>,
    pub todos: Vec<Todo>,
    pub confidence: Confidence,
    pub was_chunked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    /// Hash of the digested content
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl DigestRecord {
    pub fn new(job: &DigestionJob, result: ChunkingResult, content_hash: String) -> Self {
        let ChunkingResult {
            response,
            was_chunked,
            chunk_count,
        } = result;
        Self {
            capture_id: job.capture_id.clone(),
            user_id: job.user_id.clone(),
            content_type: job.content_type,
            summary: response.summary,
            ideas: response.ideas,
            todos: response.todos,
            confidence: response.confidence,
            was_chunked,
            chunk_count,
            content_hash,
            created_at: Utc::now(),
        }
    }
}

/// Atomic store for digest records, keyed by capture id
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store the record. On error nothing is left behind.
    async fn commit(&self, record: &DigestRecord) -> Result<(), PersistenceError>;

    async fn load(&self, capture_id: &str) -> Result<Option<DigestRecord>, PersistenceError>;
}

/// One JSON file per capture under a results directory
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, capture_id: &str) -> PathBuf {
        self.dir.join(format!("{capture_id}.json"))
    }

    fn checked_path(&self, capture_id: &str) -> Result<PathBuf, PersistenceError> {
        if !is_valid_capture_id(capture_id) {
            return Err(PersistenceError::InvalidId(capture_id.to_string()));
        }
        Ok(self.record_path(capture_id))
    }
}

#[async_trait]
impl PersistenceGateway for FilePersistence {
    async fn commit(&self, record: &DigestRecord) -> Result<(), PersistenceError> {
        let final_path = self.checked_path(&record.capture_id)?;
        fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_string_pretty(record)?;
        let tmp_path = self.dir.join(format!(".{}.json.tmp", record.capture_id));

        if let Err(e) = fs::write(&tmp_path, json.as_bytes()).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn load(&self, capture_id: &str) -> Result<Option<DigestRecord>, PersistenceError> {
        let path = self.checked_path(capture_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }
}

/// Records kept in memory; can be switched into a failing mode
#[derive(Default)]
pub struct MemoryPersistence {
    records: RwLock<HashMap<String, DigestRecord>>,
    failing: AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent commits fail without storing anything
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryPersistence {
    async fn commit(&self, record: &DigestRecord) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("storage offline".to_string()));
        }
        self.records
            .write()
            .await
            .insert(record.capture_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, capture_id: &str) -> Result<Option<DigestRecord>, PersistenceError> {
        Ok(self.records.read().await.get(capture_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DigestionResponse, Priority};
    use tempfile::TempDir;

    fn record() -> DigestRecord {
        let job = DigestionJob::new("cap-1", "user-1", ContentType::Text, Priority::Normal);
        let response = DigestionResponse {
            summary: "Notes about the quarterly plan.".to_string(),
            ideas: vec!["Hire two engineers".to_string()],
            todos: vec![Todo::new("Draft job post")],
            confidence: Confidence::High,
        };
        DigestRecord::new(&job, ChunkingResult::single(response), "abc123".to_string())
    }

    #[tokio::test]
    async fn test_file_commit_and_load() {
        let temp = TempDir::new().unwrap();
        let gateway = FilePersistence::new(temp.path().join("results"));

        gateway.commit(&record()).await.unwrap();
        let loaded = gateway.load("cap-1").await.unwrap().unwrap();
        assert_eq!(loaded.summary, "Notes about the quarterly plan.");
        assert!(!loaded.was_chunked);

        // No temp files left behind
        let mut entries = std::fs::read_dir(gateway.dir()).unwrap();
        assert_eq!(entries.next().unwrap().unwrap().file_name(), "cap-1.json");
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_file_gateway_refuses_path_like_ids() {
        let temp = TempDir::new().unwrap();
        let gateway = FilePersistence::new(temp.path().join("results"));

        let mut escaping = record();
        escaping.capture_id = "../evil".to_string();
        assert!(matches!(
            gateway.commit(&escaping).await,
            Err(PersistenceError::InvalidId(_))
        ));
        assert!(!temp.path().join("evil.json").exists());
        assert!(matches!(
            gateway.load("../evil").await,
            Err(PersistenceError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_failure_stores_nothing() {
        let gateway = MemoryPersistence::new();
        gateway.set_failing(true);

        assert!(gateway.commit(&record()).await.is_err());
        assert!(gateway.is_empty().await);

        gateway.set_failing(false);
        gateway.commit(&record()).await.unwrap();
        assert_eq!(gateway.len().await, 1);
    }
}
