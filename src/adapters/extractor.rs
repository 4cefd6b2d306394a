//! Sources of raw capture content.
//!
//! Capture and transcription happen upstream; by the time a job runs, the
//! text is expected to be retrievable by capture id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

use crate::domain::{is_valid_capture_id, ContentType};

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("No content found for capture {0}")]
    NotFound(String),

    #[error("Capture {0} has empty content")]
    Empty(String),

    #[error("Invalid capture id: {0:?}")]
    InvalidId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw content ready for digestion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedContent {
    pub content: String,
    pub content_type: ContentType,
}

/// Resolves a capture id to its raw content
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, capture_id: &str) -> Result<ExtractedContent, ExtractionError>;
}

fn non_empty(capture_id: &str, extracted: ExtractedContent) -> Result<ExtractedContent, ExtractionError> {
    if extracted.content.trim().is_empty() {
        return Err(ExtractionError::Empty(capture_id.to_string()));
    }
    Ok(extracted)
}

/// Content held in memory (tests, embedding)
#[derive(Default)]
pub struct MemoryContentSource {
    items: RwLock<HashMap<String, ExtractedContent>>,
}

impl MemoryContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, capture_id: impl Into<String>, content: impl Into<String>, content_type: ContentType) {
        self.items.write().await.insert(
            capture_id.into(),
            ExtractedContent {
                content: content.into(),
                content_type,
            },
        );
    }
}

#[async_trait]
impl ContentExtractor for MemoryContentSource {
    async fn extract(&self, capture_id: &str) -> Result<ExtractedContent, ExtractionError> {
        let extracted = self
            .items
            .read()
            .await
            .get(capture_id)
            .cloned()
            .ok_or_else(|| ExtractionError::NotFound(capture_id.to_string()))?;
        non_empty(capture_id, extracted)
    }
}

/// Content stored as `<dir>/<capture_id>.txt`, transcripts as `<capture_id>.transcript.txt`
pub struct DirectoryContentSource {
    dir: PathBuf,
}

impl DirectoryContentSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a capture's content is stored under
    pub fn content_path(&self, capture_id: &str, content_type: ContentType) -> PathBuf {
        match content_type {
            ContentType::Text => self.dir.join(format!("{capture_id}.txt")),
            ContentType::AudioTranscribed => self.dir.join(format!("{capture_id}.transcript.txt")),
        }
    }

    /// Store content for a capture
    pub async fn store(&self, capture_id: &str, content: &str, content_type: ContentType) -> Result<PathBuf, ExtractionError> {
        if !is_valid_capture_id(capture_id) {
            return Err(ExtractionError::InvalidId(capture_id.to_string()));
        }
        fs::create_dir_all(&self.dir).await?;
        let path = self.content_path(capture_id, content_type);
        fs::write(&path, content).await?;
        Ok(path)
    }
}

#[async_trait]
impl ContentExtractor for DirectoryContentSource {
    async fn extract(&self, capture_id: &str) -> Result<ExtractedContent, ExtractionError> {
        if !is_valid_capture_id(capture_id) {
            return Err(ExtractionError::InvalidId(capture_id.to_string()));
        }
        for content_type in [ContentType::Text, ContentType::AudioTranscribed] {
            let path = self.content_path(capture_id, content_type);
            if path.exists() {
                let content = fs::read_to_string(&path).await?;
                return non_empty(
                    capture_id,
                    ExtractedContent {
                        content,
                        content_type,
                    },
                );
            }
        }
        Err(ExtractionError::NotFound(capture_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_source_rejects_blank() {
        let source = MemoryContentSource::new();
        source.insert("cap-1", "   \n", ContentType::Text).await;

        assert!(matches!(source.extract("cap-1").await, Err(ExtractionError::Empty(_))));
        assert!(matches!(source.extract("cap-2").await, Err(ExtractionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_directory_source_round_trip() {
        let temp = TempDir::new().unwrap();
        let source = DirectoryContentSource::new(temp.path().join("content"));

        source
            .store("cap-9", "Remember to water the plants.", ContentType::AudioTranscribed)
            .await
            .unwrap();

        let extracted = source.extract("cap-9").await.unwrap();
        assert_eq!(extracted.content_type, ContentType::AudioTranscribed);
        assert_eq!(extracted.content, "Remember to water the plants.");
    }

    #[tokio::test]
    async fn test_directory_source_refuses_path_like_ids() {
        let temp = TempDir::new().unwrap();
        let source = DirectoryContentSource::new(temp.path().join("content"));

        assert!(matches!(
            source.store("../outside", "text", ContentType::Text).await,
            Err(ExtractionError::InvalidId(_))
        ));
        assert!(!temp.path().join("outside.txt").exists());
        assert!(matches!(
            source.extract("../outside").await,
            Err(ExtractionError::InvalidId(_))
        ));
    }
}
