//! Inline citation handling for category summaries.
//!
//! Category summaries cite their source memory items with tokens of the
//! form `[ref:ID]` or `[ref:ID1,ID2]`. These utilities extract, strip, and
//! renumber those tokens; the memorize pipeline uses [`extract_references`]
//! to decide which items get a persisted `ref_id`, and the retrieve pipeline
//! uses it to narrow the item pool to cited items.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::{Captures, Regex};

#[allow(clippy::expect_used)]
static REFERENCE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[ref:([A-Za-z0-9_,\-]+)\]").expect("reference pattern"));

#[allow(clippy::expect_used)]
static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([.,;:!?])").expect("punctuation pattern"));

/// Extract all item ids referenced in a text, in order of first occurrence.
///
/// Comma-separated lists inside a single citation are flattened; duplicates
/// are dropped.
///
/// ```
/// use engram_core::references::extract_references;
///
/// let refs = extract_references("Loves coffee [ref:abc123]. Also tea [ref:def456,abc123].");
/// assert_eq!(refs, vec!["abc123", "def456"]);
/// ```
pub fn extract_references(text: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut seen = HashSet::new();
    for caps in REFERENCE_PATTERN.captures_iter(text) {
        for id in caps[1].split(',') {
            let id = id.trim();
            if !id.is_empty() && seen.insert(id.to_string()) {
                ids.push(id.to_string());
            }
        }
    }
    ids
}

/// Remove all `[ref:...]` citations from text for clean display.
///
/// Cleans up the space left before punctuation and collapses runs of
/// whitespace afterwards.
pub fn strip_references(text: &str) -> String {
    let without = REFERENCE_PATTERN.replace_all(text, "");
    let tidied = SPACE_BEFORE_PUNCT.replace_all(&without, "$1");
    tidied.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Convert `[ref:ID]` citations to numbered `[n]` citations with an
/// appended reference list.
///
/// Numbering follows order of first occurrence. Text without citations is
/// returned unchanged.
pub fn format_references_as_citations(text: &str) -> String {
    let refs = extract_references(text);
    if refs.is_empty() {
        return text.to_string();
    }

    let numbered: Vec<(String, usize)> = refs
        .iter()
        .enumerate()
        .map(|(idx, id)| (id.clone(), idx + 1))
        .collect();

    let replaced = REFERENCE_PATTERN.replace_all(text, |caps: &Captures<'_>| {
        let nums: Vec<String> = caps[1]
            .split(',')
            .filter_map(|id| {
                let id = id.trim();
                numbered
                    .iter()
                    .find(|(known, _)| known == id)
                    .map(|(_, n)| n.to_string())
            })
            .collect();
        if nums.is_empty() {
            String::new()
        } else {
            format!("[{}]", nums.join(","))
        }
    });

    let ref_list = numbered
        .iter()
        .map(|(id, n)| format!("[{n}] {id}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{replaced}\n\nReferences:\n{ref_list}")
}

/// Build the "available items" listing shown to the summary-update prompt.
///
/// Long summaries are truncated to keep the prompt bounded.
pub fn build_item_reference_map(items: &[(String, String)]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut lines = vec!["Available memory items for reference:".to_string()];
    for (id, summary) in items {
        let display = if summary.chars().count() > 100 {
            let truncated: String = summary.chars().take(100).collect();
            format!("{truncated}...")
        } else {
            summary.clone()
        };
        lines.push(format!("- [ref:{id}] {display}"));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_handles_comma_separated_ids() {
        let refs = extract_references("Fact [ref:abc,def]. Another [ref:ghi].");
        assert_eq!(refs, vec!["abc", "def", "ghi"]);
    }

    #[test]
    fn extract_deduplicates_in_first_occurrence_order() {
        let refs = extract_references("[ref:b] [ref:a] [ref:b,a,c]");
        assert_eq!(refs, vec!["b", "a", "c"]);
    }

    #[test]
    fn extract_returns_empty_for_plain_text() {
        assert!(extract_references("No citations here.").is_empty());
        assert!(extract_references("").is_empty());
    }

    #[test]
    fn strip_removes_citations_and_normalizes_punctuation() {
        assert_eq!(
            strip_references("User loves coffee [ref:abc123]."),
            "User loves coffee."
        );
        assert_eq!(
            strip_references("A [ref:x] , B [ref:y] !"),
            "A, B!"
        );
    }

    #[test]
    fn strip_then_extract_is_empty() {
        let text = "Coffee [ref:abc]. Tea [ref:def,ghi].";
        assert!(extract_references(&strip_references(text)).is_empty());
    }

    #[test]
    fn renumber_appends_reference_list() {
        let out = format_references_as_citations("User loves coffee [ref:abc].");
        assert_eq!(out, "User loves coffee [1].\n\nReferences:\n[1] abc");
    }

    #[test]
    fn renumber_preserves_stripped_text() {
        let text = "Coffee [ref:abc]. Tea [ref:def].";
        let renumbered = format_references_as_citations(text);
        let body = renumbered
            .split("\n\nReferences:")
            .next()
            .unwrap_or_default();
        // Numbered tokens strip the same way ref tokens do not; compare via
        // whitespace-normalized prefix text.
        assert!(body.starts_with("Coffee [1]."));
        assert!(body.contains("Tea [2]."));
    }

    #[test]
    fn renumber_leaves_plain_text_alone() {
        assert_eq!(
            format_references_as_citations("No citations."),
            "No citations."
        );
    }

    #[test]
    fn reference_map_truncates_long_summaries() {
        let long = "x".repeat(150);
        let map = build_item_reference_map(&[("abc".to_string(), long)]);
        assert!(map.contains("- [ref:abc] "));
        assert!(map.contains("..."));
        assert!(map.starts_with("Available memory items for reference:"));
    }

    #[test]
    fn reference_map_empty_for_no_items() {
        assert_eq!(build_item_reference_map(&[]), "");
    }
}
