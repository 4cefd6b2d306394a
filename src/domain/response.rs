//! Structured digestion output and its schema.
//!
//! Responses are produced fresh per call (or per chunk) and are only handed
//! to persistence after merging and validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SUMMARY_MIN_CHARS: usize = 10;
pub const SUMMARY_MAX_CHARS: usize = 500;
pub const MAX_IDEAS: usize = 10;
pub const IDEA_MIN_CHARS: usize = 5;
pub const IDEA_MAX_CHARS: usize = 200;
pub const MAX_TODOS: usize = 10;
pub const TODO_MIN_CHARS: usize = 3;
pub const TODO_MAX_CHARS: usize = 200;
pub const DEADLINE_MAX_CHARS: usize = 50;

/// Schema violations found in a response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("summary must be {min}-{max} non-blank characters, got {actual}")]
    Summary { min: usize, max: usize, actual: usize },

    #[error("expected 1-{max} ideas, got {actual}")]
    IdeaCount { max: usize, actual: usize },

    #[error("idea {index} must be {min}-{max} non-blank characters, got {actual}")]
    Idea {
        index: usize,
        min: usize,
        max: usize,
        actual: usize,
    },

    #[error("expected at most {max} todos, got {actual}")]
    TodoCount { max: usize, actual: usize },

    #[error("todo {index} description must be {min}-{max} characters, got {actual}")]
    TodoDescription {
        index: usize,
        min: usize,
        max: usize,
        actual: usize,
    },

    #[error("todo {index} deadline exceeds {max} characters")]
    TodoDeadline { index: usize, max: usize },

    #[error("response is not valid JSON: {0}")]
    Malformed(String),
}

/// How sure the model is about its output. Ordered low < medium < high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Default for Confidence {
    fn default() -> Self {
        Self::High
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoPriority {
    Low,
    Medium,
    High,
}

impl Default for TodoPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// An actionable item extracted from the content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub description: String,

    #[serde(default)]
    pub deadline: Option<String>,

    #[serde(default)]
    pub priority: TodoPriority,
}

impl Todo {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            deadline: None,
            priority: TodoPriority::default(),
        }
    }
}

/// Output of one digestion call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestionResponse {
    pub summary: String,

    pub ideas: Vec<String>,

    #[serde(default)]
    pub todos: Vec<Todo>,

    #[serde(default)]
    pub confidence: Confidence,
}

impl DigestionResponse {
    /// Parse a provider reply, tolerating a surrounding markdown code fence
    pub fn from_model_output(raw: &str) -> Result<Self, ValidationError> {
        let body = strip_code_fence(raw);
        serde_json::from_str(body).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Trim text fields and drop empty deadlines
    pub fn normalized(mut self) -> Self {
        self.summary = self.summary.trim().to_string();
        self.ideas = self
            .ideas
            .into_iter()
            .map(|idea| idea.trim().to_string())
            .collect();
        for todo in &mut self.todos {
            todo.description = todo.description.trim().to_string();
            todo.deadline = todo
                .deadline
                .take()
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty());
        }
        self
    }

    /// Check the response against the schema bounds
    pub fn validate(&self) -> Result<(), ValidationError> {
        let summary_len = self.summary.chars().count();
        if self.summary.trim().is_empty()
            || !(SUMMARY_MIN_CHARS..=SUMMARY_MAX_CHARS).contains(&summary_len)
        {
            return Err(ValidationError::Summary {
                min: SUMMARY_MIN_CHARS,
                max: SUMMARY_MAX_CHARS,
                actual: summary_len,
            });
        }

        if self.ideas.is_empty() || self.ideas.len() > MAX_IDEAS {
            return Err(ValidationError::IdeaCount {
                max: MAX_IDEAS,
                actual: self.ideas.len(),
            });
        }

        for (index, idea) in self.ideas.iter().enumerate() {
            let len = idea.chars().count();
            if idea.trim().is_empty() || !(IDEA_MIN_CHARS..=IDEA_MAX_CHARS).contains(&len) {
                return Err(ValidationError::Idea {
                    index,
                    min: IDEA_MIN_CHARS,
                    max: IDEA_MAX_CHARS,
                    actual: len,
                });
            }
        }

        if self.todos.len() > MAX_TODOS {
            return Err(ValidationError::TodoCount {
                max: MAX_TODOS,
                actual: self.todos.len(),
            });
        }

        for (index, todo) in self.todos.iter().enumerate() {
            let len = todo.description.chars().count();
            if !(TODO_MIN_CHARS..=TODO_MAX_CHARS).contains(&len) {
                return Err(ValidationError::TodoDescription {
                    index,
                    min: TODO_MIN_CHARS,
                    max: TODO_MAX_CHARS,
                    actual: len,
                });
            }
            if let Some(ref deadline) = todo.deadline {
                if deadline.chars().count() > DEADLINE_MAX_CHARS {
                    return Err(ValidationError::TodoDeadline {
                        index,
                        max: DEADLINE_MAX_CHARS,
                    });
                }
            }
        }

        Ok(())
    }
}

/// A digestion response plus how it was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingResult {
    #[serde(flatten)]
    pub response: DigestionResponse,

    pub was_chunked: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
}

impl ChunkingResult {
    pub fn single(response: DigestionResponse) -> Self {
        Self {
            response,
            was_chunked: false,
            chunk_count: None,
        }
    }

    pub fn chunked(response: DigestionResponse, chunk_count: usize) -> Self {
        Self {
            response,
            was_chunked: true,
            chunk_count: Some(chunk_count),
        }
    }
}

/// Truncate to at most `max` characters on a char boundary
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].trim_end().to_string(),
        None => text.to_string(),
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the opening fence line
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}
