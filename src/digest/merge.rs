//! Merging per-chunk responses into one digest.

use std::collections::HashSet;

use super::client::FALLBACK_SUMMARY_SUFFIX;
use crate::domain::response::{
    truncate_chars, MAX_IDEAS, MAX_TODOS, SUMMARY_MAX_CHARS, SUMMARY_MIN_CHARS,
};
use crate::domain::{Confidence, DigestionResponse, Todo};

/// Chunk summaries contributing a sentence to the merged summary
pub const MAX_MERGED_SUMMARY_SENTENCES: usize = 3;

/// Ideas at or above this Jaccard similarity are duplicates
pub const IDEA_SIMILARITY_THRESHOLD: f64 = 0.8;

/// More chunks than this caps confidence at medium
pub const CONFIDENCE_DOWNGRADE_CHUNKS: usize = 3;

/// Text up to and including the first sentence terminator
pub fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    let mut chars = text.char_indices().peekable();
    while let Some((idx, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
            if at_boundary {
                return &text[..idx + c.len_utf8()];
            }
        }
    }
    text
}

/// Lowercase, trimmed, single-spaced
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn word_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity of the normalized word sets
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let left = word_set(a);
    let right = word_set(b);
    if left.is_empty() && right.is_empty() {
        return if normalize_text(a) == normalize_text(b) { 1.0 } else { 0.0 };
    }
    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    intersection as f64 / union as f64
}

/// Keep the first of each group of near-duplicate ideas, in order
pub fn dedupe_ideas<I>(ideas: I, cap: usize) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut kept: Vec<String> = Vec::new();
    for idea in ideas {
        if kept.len() == cap {
            break;
        }
        let duplicate = kept
            .iter()
            .any(|existing| jaccard_similarity(existing, &idea) >= IDEA_SIMILARITY_THRESHOLD);
        if !duplicate {
            kept.push(idea);
        }
    }
    kept
}

/// Drop todos whose normalized description was already seen
pub fn dedupe_todos<I>(todos: I, cap: usize) -> Vec<Todo>
where
    I: IntoIterator<Item = Todo>,
{
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    for todo in todos {
        if kept.len() == cap {
            break;
        }
        if seen.insert(normalize_text(&todo.description)) {
            kept.push(todo);
        }
    }
    kept
}

/// Any low wins; large chunk counts cap at medium; otherwise the weakest
pub fn merge_confidence(confidences: &[Confidence], chunk_count: usize) -> Confidence {
    if confidences.contains(&Confidence::Low) {
        return Confidence::Low;
    }
    let weakest = confidences.iter().copied().min().unwrap_or_default();
    if chunk_count > CONFIDENCE_DOWNGRADE_CHUNKS {
        weakest.min(Confidence::Medium)
    } else {
        weakest
    }
}

/// First sentence of each of the first chunk summaries.
///
/// When those sentences are too short to form a valid summary, the first
/// full chunk summary is used instead, padded if it is short as well.
pub fn merge_summaries<'a, I>(summaries: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let summaries: Vec<&str> = summaries
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let sentences: Vec<&str> = summaries
        .iter()
        .map(|s| first_sentence(s))
        .take(MAX_MERGED_SUMMARY_SENTENCES)
        .collect();
    let merged = truncate_chars(&sentences.join(" "), SUMMARY_MAX_CHARS);
    if merged.chars().count() >= SUMMARY_MIN_CHARS {
        return merged;
    }

    let full = truncate_chars(summaries.first().copied().unwrap_or_default(), SUMMARY_MAX_CHARS);
    if full.chars().count() >= SUMMARY_MIN_CHARS {
        return full;
    }
    if full.is_empty() {
        FALLBACK_SUMMARY_SUFFIX.to_string()
    } else {
        format!("{full} {FALLBACK_SUMMARY_SUFFIX}")
    }
}

/// Combine per-chunk responses in chunk order
pub fn merge_responses(responses: &[DigestionResponse]) -> DigestionResponse {
    let summary = merge_summaries(responses.iter().map(|r| r.summary.as_str()));
    let ideas = dedupe_ideas(
        responses.iter().flat_map(|r| r.ideas.iter().cloned()),
        MAX_IDEAS,
    );
    let todos = dedupe_todos(
        responses.iter().flat_map(|r| r.todos.iter().cloned()),
        MAX_TODOS,
    );
    let confidences: Vec<Confidence> = responses.iter().map(|r| r.confidence).collect();

    DigestionResponse {
        summary,
        ideas,
        todos,
        confidence: merge_confidence(&confidences, responses.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(summary: &str, ideas: &[&str], confidence: Confidence) -> DigestionResponse {
        DigestionResponse {
            summary: summary.to_string(),
            ideas: ideas.iter().map(|s| s.to_string()).collect(),
            todos: vec![],
            confidence,
        }
    }

    #[test]
    fn test_first_sentence() {
        assert_eq!(first_sentence("One. Two."), "One.");
        assert_eq!(first_sentence("Version 2.5 shipped! Then more."), "Version 2.5 shipped!");
        assert_eq!(first_sentence("No terminator here"), "No terminator here");
        assert_eq!(first_sentence("   "), "");
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(jaccard_similarity("Idea 2", "idea 2"), 1.0);
        assert_eq!(jaccard_similarity("  Idea   2 ", "IDEA 2"), 1.0);
        assert!(jaccard_similarity("Idea 1", "Idea 2") < IDEA_SIMILARITY_THRESHOLD);
        assert_eq!(jaccard_similarity("", ""), 1.0);
        assert_eq!(jaccard_similarity("!!", "??"), 0.0);
    }

    #[test]
    fn test_dedupe_ideas_keeps_first_and_order() {
        let ideas = ["Idea 1", "Idea 2", "idea 2", "Idea 3"]
            .into_iter()
            .map(String::from);
        assert_eq!(dedupe_ideas(ideas, 10), vec!["Idea 1", "Idea 2", "Idea 3"]);
    }

    #[test]
    fn test_dedupe_ideas_caps() {
        let ideas = (0..20).map(|i| format!("Distinct idea number {i}"));
        assert_eq!(dedupe_ideas(ideas, MAX_IDEAS).len(), MAX_IDEAS);
    }

    #[test]
    fn test_dedupe_todos_first_wins() {
        let mut urgent = Todo::new("Email Dana");
        urgent.deadline = Some("Friday".to_string());
        let todos = vec![urgent, Todo::new("email  dana"), Todo::new("Book room")];

        let merged = dedupe_todos(todos, MAX_TODOS);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].deadline.as_deref(), Some("Friday"));
    }

    #[test]
    fn test_merge_confidence_rules() {
        use Confidence::*;
        assert_eq!(merge_confidence(&[High, Low], 2), Low);
        assert_eq!(merge_confidence(&[High, High, High, High], 4), Medium);
        assert_eq!(merge_confidence(&[High, High], 2), High);
        assert_eq!(merge_confidence(&[High, Medium], 2), Medium);
    }

    #[test]
    fn test_merge_summaries_limits_sentences() {
        let merged = merge_summaries(["A one. x", "B two. y", "C three. z", "D four."]);
        assert_eq!(merged, "A one. B two. C three.");

        let long = "w".repeat(400);
        let merged = merge_summaries([long.as_str(), long.as_str()]);
        assert_eq!(merged.chars().count(), SUMMARY_MAX_CHARS);
    }

    #[test]
    fn test_merge_summaries_short_sentences_use_full_summary() {
        let merged = merge_summaries([
            "Ok. The first half covers planning in detail.",
            "Yes. The second half covers the budget review.",
        ]);
        assert_eq!(merged, "Ok. The first half covers planning in detail.");

        let padded = merge_summaries(["Ok.", "Yes."]);
        assert_eq!(padded, format!("Ok. {FALLBACK_SUMMARY_SUFFIX}"));
        assert!(padded.chars().count() >= SUMMARY_MIN_CHARS);
    }

    #[test]
    fn test_merge_responses_with_terse_chunks_validates() {
        let merged = merge_responses(&[
            response("Ok. The first half covers planning in detail.", &["Plan the offsite"], Confidence::High),
            response("Yes. The second half covers the budget review.", &["Review the budget"], Confidence::High),
        ]);
        assert!(merged.validate().is_ok());
    }

    #[test]
    fn test_merge_responses() {
        let merged = merge_responses(&[
            response("Summary chunk 1", &["Idea 1", "Idea 2"], Confidence::High),
            response("Summary chunk 2", &["Idea 2", "Idea 3"], Confidence::High),
        ]);
        assert_eq!(merged.summary, "Summary chunk 1 Summary chunk 2");
        assert_eq!(merged.ideas, vec!["Idea 1", "Idea 2", "Idea 3"]);
        assert_eq!(merged.confidence, Confidence::High);
        assert!(merged.validate().is_ok());
    }
}
