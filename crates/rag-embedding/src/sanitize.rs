//! Input sanitization shared by single and batched embedding calls
//! (spec §4.2): strip mentions, URLs, control bytes, collapse whitespace.
//!
//! Grounded on `original_source/src/processors/embedding_generator.py`'s
//! cleaning pass, ported to `regex`.

use regex::Regex;
use std::sync::OnceLock;

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<@!?#?&?\d+>|@[A-Za-z0-9_]+").unwrap())
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://\S+|www\.\S+").unwrap())
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

pub const MAX_QUERY_CHARS: usize = 2_000;
pub const MAX_CHUNK_CHARS: usize = 10_000;

/// Strip user/channel/role mentions, URLs, and null bytes, then collapse
/// whitespace. Does not truncate — callers pick the length cap for their
/// call shape (query vs. chunk).
pub fn sanitize(text: &str) -> String {
    let without_nulls: String = text.chars().filter(|c| *c != '\0').collect();
    let without_mentions = mention_re().replace_all(&without_nulls, " ");
    let without_urls = url_re().replace_all(&without_mentions, " ");
    whitespace_re().replace_all(&without_urls, " ").trim().to_string()
}

/// Truncate to `max_chars`, logging when truncation actually happens so
/// callers can see it in the trace without re-deriving the length check.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    tracing::warn!(
        original_len = text.chars().count(),
        max_chars,
        "truncating text before embedding"
    );
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_mentions_and_urls() {
        let out = sanitize("hey @alexei check https://example.com/x please");
        assert!(!out.contains("@alexei"));
        assert!(!out.contains("https://"));
    }

    #[test]
    fn collapses_whitespace_and_drops_nulls() {
        let out = sanitize("a\0b   c\n\nd");
        assert_eq!(out, "ab c d");
    }

    #[test]
    fn truncate_respects_char_boundary_not_byte_length() {
        let s = "é".repeat(10);
        let out = truncate(&s, 5);
        assert_eq!(out.chars().count(), 5);
    }
}
