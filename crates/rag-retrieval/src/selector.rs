//! Document Selector. Grounded on
//! `original_source/src/search/smart_document_selector.py`:
//! `should_search_documents` (casual/state-query/state-set/action regex
//! ladder) and `select_relevant_documents` (filename/topic + recency +
//! history + topic scoring, re-scored by embedding similarity for the top
//! candidates). The casual-pattern ladder is simplified to one
//! representative regex per category rather than the original's dozen
//! near-duplicate phrasings — the intent (short-circuit before document
//! search) is unchanged.

use std::collections::HashSet;
use std::sync::OnceLock;

use rag_core::types::{DocId, Document};
use regex::Regex;

fn casual_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?ix)^
            (hi|hello|hey|heyya|heya|thanks|thank\s+you|bye|goodbye|
             how\s+are\s+you|what'?s\s+up|sup|
             nice|cool|awesome|great|sweet|rad|
             yeah|yep|nope|sure|ok|okay|alright|fine|good|lol|haha)
            [\s!.,]*$",
        )
        .unwrap()
    })
}

fn state_query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)how (much|many) (gold|coins|items?) (do|does) (i|you|he|she|they|\w+) (have|own)|what (is|are) (my|your|his|her|their) (gold|coins|inventory|items?)")
            .unwrap()
    })
}

fn state_set_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(keep track|remember|set|i have|i own|i'm|i am).*(having|with|of).*\d+.*(gold|coins?|pieces?)")
            .unwrap()
    })
}

fn action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(give|take|set|add|remove|transfer)\b").unwrap())
}

fn document_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(document|doc|file|pdf|text|article|paper)\b").unwrap())
}

fn informational_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(what|who|when|where|why|how|which|tell me|explain|describe|summarize|list|show|find|search|get)\b").unwrap()
    })
}

/// Search-or-not ladder (spec §4.8). `has_explicit_doc_filter` overrides
/// every rule below it — an upstream document filter always means "yes."
pub fn should_search_documents(query: &str, has_explicit_doc_filter: bool) -> bool {
    if has_explicit_doc_filter {
        return true;
    }

    let query_lower = query.to_lowercase();
    let trimmed = query_lower.trim();

    if casual_re().is_match(trimmed) {
        return false;
    }

    let mentions_document = document_word_re().is_match(&query_lower);
    if mentions_document {
        return true;
    }

    if state_query_re().is_match(&query_lower) || state_set_re().is_match(&query_lower) {
        return false;
    }

    if action_re().is_match(trimmed) {
        return false;
    }

    if informational_re().is_match(trimmed) {
        return true;
    }

    // Default: better to have context than not.
    true
}

const COMMON_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "about", "can", "you",
    "search", "discussion", "question",
];

fn topic_words(query_lower: &str) -> Vec<String> {
    query_lower
        .split_whitespace()
        .filter(|w| w.len() > 2 && !COMMON_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// One scored candidate document, prior to the embedding re-score pass.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub relevance_score: f32,
}

/// Score every known document by filename/topic overlap and upload
/// recency (spec §4.8 "which documents"). Caller handles the embedding
/// re-score pass for the top `2*max_docs` and the user-history/topic-graph
/// boosts (`rag-orchestrator`, which alone has the graph client and
/// query embedding in scope).
pub fn score_documents(query: &str, all_docs: &[Document], now: chrono::DateTime<chrono::Utc>) -> Vec<ScoredDocument> {
    let query_lower = query.to_lowercase();
    let topics = topic_words(&query_lower);
    let topic_set: HashSet<&str> = topics.iter().map(String::as_str).collect();

    all_docs
        .iter()
        .map(|doc| {
            let filename = doc.file_name.to_lowercase();
            let mut score = 0.0f32;

            for word in &topic_set {
                if filename.contains(word) {
                    score += 0.5;
                }
            }

            let age = now.signed_duration_since(doc.uploaded_at);
            if age.num_seconds() < 86_400 {
                score += 0.4;
            } else if age.num_seconds() < 604_800 {
                score += 0.2;
            }

            ScoredDocument { document: doc.clone(), relevance_score: score }
        })
        .collect()
}

/// Extract document references explicitly named in the query (e.g. "in
/// the onboarding document", "file 'notes.pdf'") — when present, these
/// take priority over scored selection (spec §4.8, and
/// `_extract_document_references`/`_get_specific_documents` in the
/// original).
pub fn extract_document_references(query: &str) -> Vec<String> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)(\w+)\s+discussion").unwrap(),
            Regex::new(r"(?i)(\w+)\s+document").unwrap(),
            Regex::new(r"(?i)about\s+(\w+)").unwrap(),
            Regex::new(r#"(?i)document\s+["']([^"']+)["']"#).unwrap(),
            Regex::new(r#"(?i)file\s+["']([^"']+)["']"#).unwrap(),
        ]
    });

    let mut refs = Vec::new();
    for re in patterns {
        for caps in re.captures_iter(query) {
            if let Some(m) = caps.get(1) {
                let s = m.as_str().trim();
                if s.len() > 2 && !refs.contains(&s.to_string()) {
                    refs.push(s.to_string());
                }
            }
        }
    }
    refs
}

pub fn find_documents_by_reference(refs: &[String], all_docs: &[Document]) -> Vec<Document> {
    let mut found = Vec::new();
    for r in refs {
        let r_lower = r.to_lowercase();
        for doc in all_docs {
            let filename = doc.file_name.to_lowercase();
            if filename.contains(&r_lower) || r_lower.contains(&filename) {
                found.push(doc.clone());
                break;
            }
        }
    }
    found
}

pub type DocumentId = DocId;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn casual_greeting_skips_search() {
        assert!(!should_search_documents("thanks so much!", false));
    }

    #[test]
    fn state_query_skips_search() {
        assert!(!should_search_documents("how much gold do I have?", false));
    }

    #[test]
    fn action_command_skips_search() {
        assert!(!should_search_documents("give 10 gold to bob", false));
    }

    #[test]
    fn explicit_doc_filter_overrides_everything() {
        assert!(should_search_documents("thanks", true));
    }

    #[test]
    fn document_mention_forces_search_even_if_looks_like_state_query() {
        assert!(should_search_documents("how much gold is mentioned in the document?", false));
    }

    #[test]
    fn informational_question_searches() {
        assert!(should_search_documents("what is the capital of France?", false));
    }

    #[test]
    fn recent_upload_scores_higher_than_old() {
        let now = Utc::now();
        let docs = vec![
            Document {
                doc_id: "a".into(),
                file_name: "report.pdf".into(),
                file_type: "pdf".into(),
                uploaded_by: "u".into(),
                uploaded_at: now - chrono::Duration::hours(1),
                chunk_count: 3,
            },
            Document {
                doc_id: "b".into(),
                file_name: "report.pdf".into(),
                file_type: "pdf".into(),
                uploaded_by: "u".into(),
                uploaded_at: now - chrono::Duration::days(30),
                chunk_count: 3,
            },
        ];
        let scored = score_documents("tell me about the report", &docs, now);
        assert!(scored[0].relevance_score > scored[1].relevance_score);
    }
}
