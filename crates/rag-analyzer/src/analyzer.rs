//! Query Analyzer. Grounded on
//! `original_source/src/agents/gopher_agent.py`: `_quick_pattern_check`
//! (rule layer for URLs, image-generation verbs, greetings, uploads),
//! `classify_intent` (completion call with a short JSON-only prompt),
//! `_parse_json_response` (fenced-or-bare JSON extraction), and
//! `_fallback_classify` (keyword-based classification on parse/call
//! failure). The two-tier structure is unchanged; `complexity`,
//! `question_type`, and `key_concepts` are additional fields beyond the
//! original's shape, filled in by a small rule-based enrichment pass
//! after either tier produces its core classification.

use std::sync::OnceLock;
use std::time::Duration;

use rag_cache::TtlCache;
use rag_completion::{CompletionClient, Message, Role};
use regex::Regex;
use tracing::{debug, warn};

use crate::types::{AnalysisResult, AnalyzerContext, Complexity, Intent, QuestionType, RawClassification, Routing};

const CACHE_TTL_SECS: u64 = 30 * 60;
const CACHE_MAX_SIZE: usize = 2_000;

pub struct QueryAnalyzer {
    completion: CompletionClient,
    cache: TtlCache<String, AnalysisResult>,
}

impl QueryAnalyzer {
    pub fn new(completion: CompletionClient) -> Self {
        Self {
            completion,
            cache: TtlCache::new("analysis_cache", Duration::from_secs(CACHE_TTL_SECS), CACHE_MAX_SIZE),
        }
    }

    /// Classify `message` given `ctx`. Cache is bypassed whenever prior-turn
    /// context is present, since routing then depends on context the cache
    /// key doesn't capture (spec §4.5).
    pub async fn classify(&self, message: &str, ctx: &AnalyzerContext) -> AnalysisResult {
        if let Some(quick) = quick_pattern_check(message, ctx) {
            debug!(message = %truncated(message), "analyzer rule-layer match");
            return quick;
        }

        if ctx.has_prior_turn() {
            return self.classify_uncached(message, ctx).await;
        }

        let key = cache_key(message, ctx);
        let message = message.to_string();
        let ctx = ctx.clone();
        self.cache
            .get_or_compute(key, || async move { self.classify_uncached(&message, &ctx).await })
            .await
    }

    async fn classify_uncached(&self, message: &str, ctx: &AnalyzerContext) -> AnalysisResult {
        let prompt = build_prompt(message, ctx);
        let messages = vec![
            Message { role: Role::System, content: "Fast intent classifier. JSON only.".to_string() },
            Message { role: Role::User, content: prompt },
        ];

        match self.completion.complete(&messages, 0.1, 150).await {
            Ok(response) => match parse_json_response(&response) {
                Some(raw) => enrich(raw_to_result(raw), message),
                None => {
                    warn!(response = %truncated(&response), "analyzer: unparseable completion response, falling back");
                    fallback_classify(message, ctx)
                }
            },
            Err(e) => {
                warn!(error = %e, "analyzer: completion call failed, falling back");
                fallback_classify(message, ctx)
            }
        }
    }
}

fn cache_key(message: &str, ctx: &AnalyzerContext) -> String {
    format!(
        "{}|{}|{}",
        message.to_lowercase().trim(),
        ctx.has_attachments,
        ctx.is_mentioned
    )
}

fn truncated(s: &str) -> String {
    s.chars().take(200).collect()
}

const IMAGE_GEN_KEYWORDS: &[&str] = &[
    "generate an image", "generate image", "generate a image",
    "create an image", "create image", "create a image",
    "make an image", "make image", "make a image",
    "draw an image", "draw image", "draw a image",
    "generate a picture", "generate picture",
    "create a picture", "create picture",
    "make a picture", "make picture",
    "draw a picture", "draw picture",
    "generate artwork", "create artwork", "make artwork",
    "generate art", "create art", "make art",
];

const GREETINGS: &[&str] = &["hi", "hello", "hey", "greetings", "good morning", "good afternoon", "good evening"];

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[a-zA-Z0-9-]+\.[a-zA-Z]{2,}\b").unwrap())
}

/// Rule layer: URLs, image-generation verbs, attachments, and greetings
/// all classify immediately without a model call (spec §4.5 "a fast rule
/// layer catches URLs, image-generation verbs, greetings, obvious uploads,
/// returning immediately").
fn quick_pattern_check(message: &str, ctx: &AnalyzerContext) -> Option<AnalysisResult> {
    let lower = message.to_lowercase();
    let trimmed = lower.trim();

    let has_url = message.contains("http://")
        || message.contains("https://")
        || lower.contains("www.")
        || lower.contains("youtube.com")
        || lower.contains("youtu.be")
        || domain_re().is_match(message);
    if has_url {
        return Some(AnalysisResult {
            intent: Intent::Question,
            should_respond: true,
            confidence: 0.95,
            routing: Routing::Tools,
            needs_rag: false,
            needs_tools: true,
            needs_memory: false,
            needs_relations: false,
            is_casual: false,
            complexity: Complexity::Simple,
            question_type: QuestionType::General,
            document_references: Vec::new(),
            key_concepts: Vec::new(),
        });
    }

    if IMAGE_GEN_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Some(AnalysisResult {
            intent: Intent::Command,
            should_respond: true,
            confidence: 0.95,
            routing: Routing::Tools,
            needs_rag: false,
            needs_tools: true,
            needs_memory: false,
            needs_relations: false,
            is_casual: false,
            complexity: Complexity::Simple,
            question_type: QuestionType::General,
            document_references: Vec::new(),
            key_concepts: Vec::new(),
        });
    }

    if ctx.has_attachments {
        return Some(AnalysisResult {
            intent: Intent::Upload,
            should_respond: true,
            confidence: 0.95,
            routing: Routing::Upload,
            needs_rag: false,
            needs_tools: false,
            needs_memory: false,
            needs_relations: false,
            is_casual: false,
            complexity: Complexity::Simple,
            question_type: QuestionType::General,
            document_references: Vec::new(),
            key_concepts: Vec::new(),
        });
    }

    if GREETINGS.contains(&trimmed) || GREETINGS.iter().any(|g| trimmed.starts_with(&format!("{g} "))) {
        return Some(AnalysisResult {
            intent: Intent::Casual,
            should_respond: true,
            confidence: 0.9,
            routing: Routing::Chat,
            needs_rag: false,
            needs_tools: false,
            needs_memory: false,
            needs_relations: false,
            is_casual: true,
            complexity: Complexity::Simple,
            question_type: QuestionType::General,
            document_references: Vec::new(),
            key_concepts: Vec::new(),
        });
    }

    None
}

fn build_prompt(message: &str, ctx: &AnalyzerContext) -> String {
    let truncated: String = message.chars().take(300).collect();
    let mut context_note = String::new();
    if ctx.has_attachments {
        context_note.push_str("\nHas attachments.");
    }
    if ctx.is_mentioned {
        context_note.push_str("\nMentioned.");
    }
    if let Some(prev_q) = &ctx.previous_question {
        context_note.push_str(&format!("\nPrevious question: {}", truncate_str(prev_q, 150)));
    }

    format!(
        "Classify intent. JSON only.\n\n\"{truncated}\"{context_note}\n\n\
         {{\"intent\":\"question|command|casual|action|upload|ignore\",\"should_respond\":true|false,\
         \"confidence\":0.0-1.0,\"routing\":\"rag|chat|tools|memory|action\",\"needs_rag\":true|false,\
         \"needs_tools\":true|false,\"needs_memory\":true|false,\"needs_relations\":true|false,\
         \"is_casual\":true|false,\"document_references\":[]}}"
    )
}

fn truncate_str(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap())
}

fn bare_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").unwrap())
}

/// Accepts fenced ```json blocks or a bare `{...}` object (spec §4.5:
/// "robustly parsed (accepting fenced or bare JSON)").
fn parse_json_response(response: &str) -> Option<RawClassification> {
    let json_str = if let Some(caps) = fenced_json_re().captures(response) {
        caps.get(1)?.as_str().to_string()
    } else if let Some(m) = bare_json_re().find(response) {
        m.as_str().to_string()
    } else {
        response.to_string()
    };
    serde_json::from_str(&json_str).ok()
}

fn raw_to_result(raw: RawClassification) -> AnalysisResult {
    AnalysisResult {
        intent: parse_intent(&raw.intent),
        should_respond: raw.should_respond,
        confidence: raw.confidence.clamp(0.0, 1.0),
        routing: parse_routing(&raw.routing),
        needs_rag: raw.needs_rag,
        needs_tools: raw.needs_tools,
        needs_memory: raw.needs_memory,
        needs_relations: raw.needs_relations,
        is_casual: raw.is_casual,
        complexity: Complexity::Moderate,
        question_type: QuestionType::General,
        document_references: raw.document_references,
        key_concepts: Vec::new(),
    }
}

fn parse_intent(s: &str) -> Intent {
    match s {
        "question" => Intent::Question,
        "command" => Intent::Command,
        "casual" => Intent::Casual,
        "action" => Intent::Action,
        "upload" => Intent::Upload,
        _ => Intent::Ignore,
    }
}

fn parse_routing(s: &str) -> Routing {
    match s {
        "rag" => Routing::Rag,
        "chat" => Routing::Chat,
        "tools" => Routing::Tools,
        "memory" => Routing::Memory,
        "action" => Routing::Action,
        "upload" => Routing::Upload,
        _ => Routing::Rag,
    }
}

/// Pattern-based classification used when the completion call fails or
/// returns unparseable JSON (`_fallback_classify`). Confidence is
/// deliberately lower than either tier above — 0.6, matching the
/// original's fixed fallback confidence.
fn fallback_classify(message: &str, ctx: &AnalyzerContext) -> AnalysisResult {
    let lower = message.to_lowercase();
    let trimmed = lower.trim();
    let has_question_mark = message.contains('?');
    let is_greeting = ["hi", "hello", "hey", "greetings"].iter().any(|w| trimmed.contains(w));
    let is_command = trimmed.starts_with('/') || ["do this", "please", "can you"].iter().any(|w| trimmed.contains(w));
    let has_action_words = ["give", "transfer", "set", "take"].iter().any(|w| trimmed.contains(w));

    let (intent, routing, should_respond) = if ctx.has_attachments {
        (Intent::Upload, Routing::Upload, true)
    } else if is_greeting && !has_question_mark {
        (Intent::Casual, Routing::Chat, false)
    } else if is_command {
        (Intent::Command, Routing::Tools, true)
    } else if has_action_words {
        (Intent::Action, Routing::Action, true)
    } else if !has_question_mark && message.chars().count() < 20 {
        (Intent::Casual, Routing::Chat, false)
    } else {
        (Intent::Question, Routing::Rag, true)
    };

    let result = AnalysisResult {
        intent,
        should_respond,
        confidence: 0.6,
        routing,
        needs_rag: matches!(routing, Routing::Rag),
        needs_tools: matches!(routing, Routing::Tools),
        needs_memory: false,
        needs_relations: false,
        is_casual: matches!(intent, Intent::Casual),
        complexity: Complexity::Moderate,
        question_type: QuestionType::General,
        document_references: Vec::new(),
        key_concepts: Vec::new(),
    };
    enrich(result, message)
}

/// Fills `complexity`, `question_type`, and `key_concepts` — fields spec
/// §4.5 adds beyond the original's shape. Rule-based, applied after either
/// tier produces the core classification.
fn enrich(mut result: AnalysisResult, message: &str) -> AnalysisResult {
    let lower = message.to_lowercase();

    result.question_type = if lower.contains("how many") || lower.contains("how much") {
        QuestionType::Quantitative
    } else if lower.contains("compare") || lower.contains(" vs ") || lower.contains("versus") {
        QuestionType::Comparative
    } else if lower.contains("how do") || lower.contains("how to") || lower.contains("steps") {
        QuestionType::Procedural
    } else if lower.contains("why") || lower.contains("analyze") || lower.contains("explain") {
        QuestionType::Analytical
    } else if lower.contains("what is") || lower.contains("who is") || lower.contains("when") {
        QuestionType::Factual
    } else {
        QuestionType::General
    };

    let word_count = message.split_whitespace().count();
    let clause_markers = [" and ", " but ", " because ", " then ", " also "];
    let has_multiple_clauses = clause_markers.iter().any(|m| lower.contains(m));
    result.complexity = if word_count > 40 || (has_multiple_clauses && word_count > 15) {
        Complexity::Complex
    } else if word_count > 12 || has_multiple_clauses {
        Complexity::Moderate
    } else {
        Complexity::Simple
    };

    result.key_concepts = extract_key_concepts(message);
    result
}

/// Crude noun-phrase-ish extraction: capitalized multi-word runs and
/// quoted spans, deduplicated. Not NLP-grade, but enough to populate the
/// field the spec asks for without a second model round trip.
fn extract_key_concepts(message: &str) -> Vec<String> {
    let mut concepts = Vec::new();
    for word in message.split_whitespace() {
        let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        if cleaned.len() > 3 && cleaned.chars().next().is_some_and(|c| c.is_uppercase()) {
            if !concepts.contains(&cleaned) {
                concepts.push(cleaned);
            }
        }
    }
    concepts.truncate(5);
    concepts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_always_routes_to_tools() {
        let ctx = AnalyzerContext::default();
        let r = quick_pattern_check("check out https://example.com/thing", &ctx).unwrap();
        assert_eq!(r.routing, Routing::Tools);
        assert!(r.needs_tools);
        assert!(!r.needs_rag);
    }

    #[test]
    fn image_generation_routes_to_tools() {
        let ctx = AnalyzerContext::default();
        let r = quick_pattern_check("please generate an image of a cat", &ctx).unwrap();
        assert_eq!(r.routing, Routing::Tools);
    }

    #[test]
    fn bare_greeting_is_casual_chat() {
        let ctx = AnalyzerContext::default();
        let r = quick_pattern_check("hello", &ctx).unwrap();
        assert_eq!(r.intent, Intent::Casual);
        assert_eq!(r.routing, Routing::Chat);
    }

    #[test]
    fn attachments_force_upload_even_with_text() {
        let ctx = AnalyzerContext { has_attachments: true, ..Default::default() };
        let r = quick_pattern_check("here's the file", &ctx).unwrap();
        assert_eq!(r.intent, Intent::Upload);
    }

    #[test]
    fn plain_question_falls_through_rule_layer() {
        let ctx = AnalyzerContext::default();
        assert!(quick_pattern_check("what is the capital of France?", &ctx).is_none());
    }

    #[test]
    fn fenced_json_is_extracted() {
        let resp = "here you go:\n```json\n{\"intent\":\"question\",\"should_respond\":true,\"confidence\":0.8,\"routing\":\"rag\",\"needs_rag\":true,\"needs_tools\":false,\"needs_memory\":false,\"is_casual\":false}\n```";
        let parsed = parse_json_response(resp).unwrap();
        assert_eq!(parsed.intent, "question");
    }

    #[test]
    fn bare_json_is_extracted() {
        let resp = "{\"intent\":\"casual\",\"should_respond\":false,\"confidence\":0.9,\"routing\":\"chat\",\"needs_rag\":false,\"needs_tools\":false,\"needs_memory\":false,\"is_casual\":true}";
        let parsed = parse_json_response(resp).unwrap();
        assert_eq!(parsed.intent, "casual");
    }

    #[test]
    fn unparseable_response_returns_none() {
        assert!(parse_json_response("not json at all").is_none());
    }

    #[test]
    fn fallback_classify_action_words_route_to_action() {
        let ctx = AnalyzerContext::default();
        let r = fallback_classify("give 10 gold to bob", &ctx);
        assert_eq!(r.intent, Intent::Action);
        assert_eq!(r.routing, Routing::Action);
    }

    #[test]
    fn fallback_classify_short_statement_is_casual() {
        let ctx = AnalyzerContext::default();
        let r = fallback_classify("nice one", &ctx);
        assert!(!r.should_respond);
        assert_eq!(r.intent, Intent::Casual);
    }

    #[test]
    fn prior_turn_context_is_detected() {
        let ctx = AnalyzerContext { previous_question: Some("x".into()), ..Default::default() };
        assert!(ctx.has_prior_turn());
        assert!(!AnalyzerContext::default().has_prior_turn());
    }

    #[test]
    fn quantitative_question_type_enriched() {
        let r = enrich(AnalysisResult::default_rag_question(), "how many gold coins do I have?");
        assert_eq!(r.question_type, QuestionType::Quantitative);
    }
}
