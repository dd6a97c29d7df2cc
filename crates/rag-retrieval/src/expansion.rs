//! Query expansion (spec §4.6 step 1). Grounded directly on
//! `original_source/query_expander.py`'s `EXPANSIONS` table and `expand()`:
//! tokenize, look up each token in the synonym table, append up to
//! `max_expansions` new terms to the original query. The original query is
//! always preserved as a prefix.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

fn expansions() -> &'static [(&'static str, &'static [&'static str])] {
    &[
        ("what", &["which", "how"]),
        ("who", &["which person", "what person"]),
        ("when", &["what time", "what date"]),
        ("where", &["what location", "what place"]),
        ("how", &["what method", "what way"]),
        ("why", &["what reason", "what cause"]),
        ("explain", &["describe", "detail", "clarify"]),
        ("describe", &["explain", "detail"]),
        ("define", &["explain", "describe"]),
        ("list", &["enumerate", "name"]),
        ("show", &["display", "present"]),
        ("find", &["locate", "search", "discover"]),
        ("get", &["obtain", "retrieve", "fetch"]),
        ("use", &["utilize", "employ"]),
        ("create", &["make", "generate", "build"]),
        ("document", &["file", "paper", "text"]),
        ("information", &["data", "details", "facts"]),
        ("content", &["text", "information", "data"]),
    ]
}

fn non_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s]").unwrap())
}

fn tokenize(text: &str) -> Vec<String> {
    non_word_re()
        .replace_all(text, " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Expand `query` with up to `max_expansions` related terms, appended
/// after the original text. Returns `query` unchanged if nothing expands.
pub fn expand(query: &str, max_expansions: usize) -> String {
    let query = query.replace('\0', "");
    let query = query.trim();
    if query.is_empty() {
        return String::new();
    }

    let words = tokenize(&query.to_lowercase());
    let word_set: HashSet<&str> = words.iter().map(String::as_str).collect();

    let mut new_terms: Vec<&str> = Vec::new();
    for word in &words {
        if let Some((_, syns)) = expansions().iter().find(|(k, _)| *k == word) {
            for syn in syns.iter().take(max_expansions) {
                if !word_set.contains(syn) && !new_terms.contains(syn) {
                    new_terms.push(syn);
                }
            }
        }
    }

    if new_terms.is_empty() {
        return query.to_string();
    }
    new_terms.truncate(max_expansions);
    format!("{} {}", query, new_terms.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_term() {
        let out = expand("what is the capital of France", 3);
        assert!(out.starts_with("what is the capital of France"));
        assert!(out.contains("which") || out.contains("how"));
    }

    #[test]
    fn unrecognized_query_returns_unchanged() {
        let out = expand("xyzzy plugh", 3);
        assert_eq!(out, "xyzzy plugh");
    }

    #[test]
    fn empty_query_returns_empty() {
        assert_eq!(expand("   ", 3), "");
    }

    #[test]
    fn respects_max_expansions_bound() {
        let out = expand("what who when where explain describe", 2);
        let original_words = 6;
        let out_words = out.split_whitespace().count();
        assert!(out_words <= original_words + 2);
    }
}
