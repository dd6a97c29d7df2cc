//! Action Parser. Classifies an utterance as an inventory/currency
//! action (or not) and extracts its arguments. Grounded on the
//! confidence-gated action pipeline in `enhanced_rag_pipeline.py` lines
//! ~250-329 (confidence threshold 0.6, action-type allowlist, the
//! info-question safety net) and its mention post-processing (lines
//! ~260-304, ~1358-1376: Discord mention extraction, `source_user_id`
//! defaulting to the asking user for give/transfer/send). The model-call
//! shape (prompt, fenced-then-bare JSON parse, rule-based fallback) follows
//! `rag-analyzer/src/analyzer.rs`'s established pattern rather than the
//! python original, since no concrete prompt text survives in the
//! retrieved source for this specific call.

use rag_completion::CompletionClient;
use rag_core::types::{Message, Role};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{debug, warn};

pub const CONFIDENCE_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Give,
    Take,
    Transfer,
    Set,
    Add,
    Remove,
    Send,
    Query,
    Unknown,
}

impl ActionKind {
    fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "give" => Self::Give,
            "take" => Self::Take,
            "transfer" => Self::Transfer,
            "set" => Self::Set,
            "add" => Self::Add,
            "remove" => Self::Remove,
            "send" => Self::Send,
            "query" => Self::Query,
            _ => Self::Unknown,
        }
    }

    /// `action ∈ {give, take, transfer, set, add, remove, send}` — the
    /// allowlist a parsed action must fall in before it can be executed.
    fn is_executable_kind(&self) -> bool {
        matches!(self, Self::Give | Self::Take | Self::Transfer | Self::Set | Self::Add | Self::Remove | Self::Send)
    }

    fn wants_default_source(&self) -> bool {
        matches!(self, Self::Give | Self::Transfer | Self::Send)
    }
}

#[derive(Debug, Clone)]
pub struct ParsedAction {
    pub action: ActionKind,
    pub item_name: Option<String>,
    pub quantity: f64,
    pub source_user_id: Option<String>,
    pub dest_user_id: Option<String>,
    pub item_type: String,
    pub properties: HashMap<String, serde_json::Value>,
    pub confidence: f32,
    pub original_text: String,
}

/// `confidence ≥ 0.6 AND action ∈ {give,take,transfer,set,add,remove,send}`
/// — the only gate under which the orchestrator executes a parsed action.
pub fn should_execute(action: &ParsedAction) -> bool {
    action.confidence >= CONFIDENCE_THRESHOLD && action.action.is_executable_kind()
}

fn info_question_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(what|how many|how much|who|when|where|why)\b|\bwhat\s+(model|is|are)\b|how many.*(did|does|do)\b").unwrap()
    })
}

/// Information-question safety net (`_handle_action`'s `is_info_question`
/// check, lines ~1404-1410): the orchestrator must not run action parsing
/// at all when this fires, and `give`/`transfer` handling refuses even a
/// high-confidence parse that slipped through.
pub fn is_information_question(text: &str) -> bool {
    info_question_re().is_match(text.trim())
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<@!?(\d+)>").unwrap())
}

/// Extract a numeric user id from a Discord mention token
/// (`<@123>`/`<@!123>`), a bare `@name` is left unresolved (the caller has
/// no text-to-id table) — same split as `_handle_action`'s dest_user_id
/// validation.
fn extract_mention_id(raw: &str) -> Option<String> {
    mention_re().captures(raw).map(|c| c[1].to_string())
}

/// Every `<@id>` mention appearing in `text`, in order.
pub fn extract_all_mentions(text: &str) -> Vec<String> {
    mention_re().captures_iter(text).map(|c| c[1].to_string()).collect()
}

#[derive(Deserialize)]
struct RawAction {
    action: String,
    #[serde(default)]
    item_name: Option<String>,
    #[serde(default)]
    quantity: Option<f64>,
    #[serde(default)]
    source_user_id: Option<String>,
    #[serde(default)]
    dest_user_id: Option<String>,
    #[serde(default = "default_item_type")]
    item_type: String,
    #[serde(default)]
    confidence: f32,
}

fn default_item_type() -> String {
    "misc".to_string()
}

pub struct ActionParser {
    completion: CompletionClient,
}

impl ActionParser {
    pub fn new(completion: CompletionClient) -> Self {
        Self { completion }
    }

    /// `parse_action(text, asking_user_id, channel_id, mentioned_user_id?)`.
    /// Runs the model classification, falls back to a small rule-based
    /// extractor on any failure, then applies the same mention/source
    /// post-processing the orchestrator relies on regardless of which path
    /// produced the raw fields.
    pub async fn parse_action(
        &self,
        text: &str,
        asking_user_id: &str,
        mentioned_user_id: Option<&str>,
    ) -> ParsedAction {
        let raw = match self.classify(text).await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "action model classification failed, using rule fallback");
                rule_based_classify(text)
            }
        };

        let mut action = ParsedAction {
            action: ActionKind::from_str(&raw.action),
            item_name: raw.item_name,
            quantity: raw.quantity.unwrap_or(1.0).max(0.0),
            source_user_id: raw.source_user_id,
            dest_user_id: raw.dest_user_id,
            item_type: raw.item_type,
            properties: HashMap::new(),
            confidence: raw.confidence,
            original_text: text.to_string(),
        };

        if action.quantity == 0.0 {
            action.quantity = 1.0;
        }

        resolve_dest_user(&mut action, text, mentioned_user_id);

        if action.source_user_id.is_none() && action.action.wants_default_source() {
            action.source_user_id = Some(asking_user_id.to_string());
        }

        action
    }

    async fn classify(&self, text: &str) -> Result<RawAction, rag_completion::CompletionError> {
        let prompt = format!(
            "Classify this message as an inventory/currency action if it is one.\n\
             Message: \"{text}\"\n\
             Respond with ONLY a JSON object: {{\"action\": \"give|take|transfer|set|add|remove|send|query|unknown\", \
             \"item_name\": \"...\" or null, \"quantity\": number or null, \"source_user_id\": \"...\" or null, \
             \"dest_user_id\": \"...\" or null, \"item_type\": \"currency|misc|weapon|consumable\", \
             \"confidence\": number between 0 and 1}}"
        );
        let messages = vec![Message { role: Role::User, content: prompt }];
        let response = self.completion.complete(&messages, 0.0, 200).await?;
        parse_json_response(&response)
            .ok_or_else(|| rag_completion::CompletionError::Parse(format!("unparseable action classification: {response}")))
    }
}

fn parse_json_response(text: &str) -> Option<RawAction> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Pure rule-based fallback when the model is unavailable or unparseable.
/// Deliberately conservative: confidence never exceeds 0.5, so a parse
/// that only survives on this path never clears `CONFIDENCE_THRESHOLD` on
/// its own — matching the source's stance that low-confidence actions
/// should fall through to RAG rather than mutate state.
fn rule_based_classify(text: &str) -> RawAction {
    let lower = text.to_lowercase();
    let verb = ["give", "gave", "take", "took", "transfer", "set", "add", "remove", "send", "sent"]
        .iter()
        .find(|v| lower.split_whitespace().any(|w| w == **v));

    let action = match verb {
        Some(&"give") | Some(&"gave") => "give",
        Some(&"take") | Some(&"took") => "take",
        Some(&"transfer") => "transfer",
        Some(&"set") => "set",
        Some(&"add") => "add",
        Some(&"remove") => "remove",
        Some(&"send") | Some(&"sent") => "send",
        _ => "unknown",
    };

    let quantity = lower
        .split_whitespace()
        .find_map(|w| w.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse::<f64>().ok());

    RawAction {
        action: action.to_string(),
        item_name: None,
        quantity,
        source_user_id: None,
        dest_user_id: extract_all_mentions(text).into_iter().next(),
        item_type: default_item_type(),
        confidence: if action == "unknown" { 0.0 } else { 0.4 },
    }
}

/// Mirrors `_handle_action`'s dest_user_id resolution ladder: an explicit
/// `<@id>` mention in the raw field wins; a `@name` string is unresolvable
/// text, so it falls back to an upstream `mentioned_user_id` or the first
/// mention literally present in the message.
fn resolve_dest_user(action: &mut ParsedAction, text: &str, mentioned_user_id: Option<&str>) {
    if let Some(raw) = &action.dest_user_id {
        if let Some(id) = extract_mention_id(raw) {
            action.dest_user_id = Some(id);
            return;
        }
        if raw.starts_with('@') || raw.starts_with("<@") {
            action.dest_user_id = mentioned_user_id
                .map(String::from)
                .or_else(|| extract_all_mentions(text).into_iter().next());
            return;
        }
        if raw.chars().all(|c| c.is_ascii_digit()) && !raw.is_empty() {
            return;
        }
        warn!(raw = %raw, "could not resolve dest_user_id, leaving unresolved");
        action.dest_user_id = mentioned_user_id
            .map(String::from)
            .or_else(|| extract_all_mentions(text).into_iter().next());
        return;
    }
    action.dest_user_id = mentioned_user_id.map(String::from).or_else(|| extract_all_mentions(text).into_iter().next());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(kind: ActionKind, confidence: f32) -> ParsedAction {
        ParsedAction {
            action: kind,
            item_name: Some("gold".to_string()),
            quantity: 1.0,
            source_user_id: None,
            dest_user_id: None,
            item_type: "currency".to_string(),
            properties: HashMap::new(),
            confidence,
            original_text: String::new(),
        }
    }

    #[test]
    fn should_execute_requires_threshold_and_allowlist() {
        assert!(should_execute(&action(ActionKind::Give, 0.6)));
        assert!(!should_execute(&action(ActionKind::Give, 0.59)));
        assert!(!should_execute(&action(ActionKind::Query, 0.9)));
        assert!(!should_execute(&action(ActionKind::Unknown, 0.9)));
    }

    #[test]
    fn information_questions_are_detected() {
        assert!(is_information_question("how many gold coins does @alexei have?"));
        assert!(is_information_question("what is my balance"));
        assert!(is_information_question("who has the sword"));
        assert!(!is_information_question("give 3 gold to bob"));
    }

    #[test]
    fn mention_ids_extract_from_discord_format() {
        assert_eq!(extract_mention_id("<@123456>"), Some("123456".to_string()));
        assert_eq!(extract_mention_id("<@!123456>"), Some("123456".to_string()));
        assert_eq!(extract_mention_id("@alexei"), None);
        assert_eq!(extract_all_mentions("give to <@1> and <@2>"), vec!["1", "2"]);
    }

    #[test]
    fn resolve_dest_user_prefers_explicit_mention_format() {
        let mut a = action(ActionKind::Give, 0.9);
        a.dest_user_id = Some("<@42>".to_string());
        resolve_dest_user(&mut a, "give gold to <@42>", Some("99"));
        assert_eq!(a.dest_user_id, Some("42".to_string()));
    }

    #[test]
    fn resolve_dest_user_falls_back_to_mentioned_user_id_for_username_text() {
        let mut a = action(ActionKind::Give, 0.9);
        a.dest_user_id = Some("@alexei".to_string());
        resolve_dest_user(&mut a, "give gold to @alexei", Some("77"));
        assert_eq!(a.dest_user_id, Some("77".to_string()));
    }

    #[test]
    fn rule_based_fallback_never_reaches_execution_threshold_alone() {
        let raw = rule_based_classify("give 3 gold to bob");
        assert!(raw.confidence < CONFIDENCE_THRESHOLD);
    }

    #[test]
    fn source_user_defaults_to_asker_for_give_transfer_send() {
        let mut a = action(ActionKind::Give, 0.9);
        a.source_user_id = None;
        if a.source_user_id.is_none() && a.action.wants_default_source() {
            a.source_user_id = Some("asker".to_string());
        }
        assert_eq!(a.source_user_id, Some("asker".to_string()));
    }
}
