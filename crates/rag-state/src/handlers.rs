//! State-Query / State-Set Handlers. Regex ladders ported almost
//! verbatim from `enhanced_rag_pipeline.py`'s `_handle_state_query`
//! (lines ~1636-1898) and `_handle_state_set` (lines ~1900-1958) — pattern
//! literals, self-reference priority, and the gold/inventory/generic-item
//! branch order are all taken directly from that source.
//!
//! Both handlers are short-circuits: `Some(answer)` means the orchestrator
//! returns immediately; `None` means fall through to normal retrieval.

use crate::items::ItemTracker;
use crate::ledger::{StateLedger, WriteContext};
use rag_core::error::Result;
use rag_core::types::StateValue;
use regex::Regex;
use std::sync::OnceLock;

fn state_query_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"how (much|many) (gold|coins|items?|.*) (do|does) (i|you|he|she|they|@\w+) (have|own)",
            r"how (much|many) (do|does) (i|you|he|she|they|@\w+) (have|own)",
            r"how (much|many)\s+(do|does)\s+(have|own)",
            r"what (is|are) (my|your|his|her|their|@\w+'s) (gold|coins|inventory|items?|.*)",
            r"(i|you|he|she|they|@\w+) (have|has|owns) (how much|how many)",
            r"what (is|are) (my|your|his|her|their|@\w+'s) (balance|level|.*)",
            r"how (much|many) (gold|coins|items?).*did.*(have|own)",
            r"how (much|many).*did.*(have|own)",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn self_query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(do i|have i|my|i have|i own|my (balance|inventory|coins|gold|dildos?|items?))\b").unwrap())
}

fn item_extract_primary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"how (?:many|much)\s+([^?]+?)\s+(?:does|do|has|have|owns)").unwrap())
}

fn item_extract_fallback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"how (?:many|much)\s+([^?]+?)\?").unwrap())
}

fn mention_strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<@!?\d+>").unwrap())
}

fn filler_strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(does|do|has|have|owns|the|a|an)\b").unwrap())
}

fn state_keywords() -> &'static [&'static str] {
    &["how many", "how much", "what", "have", "own", "inventory", "balance", "coins", "gold"]
}

fn has_state_keywords(question_lower: &str) -> bool {
    state_keywords().iter().any(|k| question_lower.contains(k))
}

fn is_state_query(question_lower: &str, has_mention: bool) -> bool {
    let pattern_match = state_query_patterns().iter().any(|p| p.is_match(question_lower));
    let loose_match = has_mention
        && has_state_keywords(question_lower)
        && (question_lower.contains("how many") || question_lower.contains("how much"));
    pattern_match || loose_match
}

/// Strip trailing pluralizing 's' unless the word ends "ss" — the same
/// `normalize_for_match` helper used on both sides of an item-name
/// comparison in the source.
fn normalize_for_match(name: &str) -> String {
    let lower = name.to_lowercase();
    if lower.ends_with('s') && !lower.ends_with("ss") {
        lower[..lower.len() - 1].to_string()
    } else {
        lower
    }
}

fn pluralize_for_display(name: &str, quantity: f64) -> String {
    let lower = name.to_lowercase();
    if quantity == 1.0 {
        if lower.ends_with('s') && !lower.ends_with("ss") {
            return lower[..lower.len() - 1].to_string();
        }
        lower
    } else if !lower.ends_with('s') {
        format!("{lower}s")
    } else {
        lower
    }
}

fn extract_item_name(question_lower: &str) -> Option<String> {
    let captured = item_extract_primary_re()
        .captures(question_lower)
        .or_else(|| item_extract_fallback_re().captures(question_lower))?;
    let raw = captured.get(1)?.as_str();
    let stripped = mention_strip_re().replace_all(raw, "");
    let cleaned = filler_strip_re().replace_all(&stripped, "").trim().to_string();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.len() > 1 {
        Some(cleaned)
    } else {
        None
    }
}

/// `_handle_state_query`. Resolves the target user (self-reference beats
/// an upstream mention, which beats a mention literally in the text, which
/// beats defaulting to the asking user), extracts what's being asked
/// about, and formats a pluralization-correct answer. Returns `None` when
/// the utterance isn't a state query at all.
pub async fn handle_state_query(
    question: &str,
    user_id: Option<&str>,
    mentioned_user_id: Option<&str>,
    ledger: &StateLedger,
    items: &ItemTracker,
) -> Result<Option<String>> {
    let question_lower = question.to_lowercase();
    let has_mention = mentioned_user_id.is_some();

    if !is_state_query(&question_lower, has_mention) {
        return Ok(None);
    }

    let text_mention = crate::action_parser::extract_all_mentions(question).into_iter().next();

    let target_user_id = if self_query_re().is_match(&question_lower) {
        user_id.map(String::from)
    } else if let Some(m) = mentioned_user_id {
        Some(m.to_string())
    } else if let Some(m) = text_mention {
        Some(m)
    } else {
        user_id.map(String::from)
    };

    let Some(target_user_id) = target_user_id else {
        return Ok(Some("I need to know who you're asking about. Please mention a user or ask about yourself.".to_string()));
    };

    let has_gold_mention = question_lower.contains("gold") || question_lower.contains("coins") || question_lower.contains("coin");
    let has_inventory_mention = question_lower.contains("inventory")
        || (question_lower.contains("items") && !question_lower.split_whitespace().any(|w| w == "item"));

    let item_name = extract_item_name(&question_lower);

    if let Some(item_name) = &item_name {
        if !has_gold_mention {
            let tracked = items.get_user_items(&target_user_id)?;
            let inventory = match ledger.get(&target_user_id, "inventory", StateValue::Inventory(Default::default()))? {
                StateValue::Inventory(m) => m,
                StateValue::Number(_) => Default::default(),
            };

            let wanted = normalize_for_match(item_name);
            let mut found: Option<(String, f64)> = None;

            for item in &tracked {
                let candidate = normalize_for_match(&item.canonical_name);
                if wanted == candidate
                    || wanted.contains(&candidate)
                    || candidate.contains(&wanted)
                    || wanted.replace(' ', "") == candidate.replace(' ', "")
                {
                    found = Some((item.canonical_name.clone(), item.quantity));
                    break;
                }
            }
            if found.is_none() {
                for (inv_item, qty) in &inventory {
                    let candidate = normalize_for_match(inv_item);
                    if wanted == candidate
                        || wanted.contains(&candidate)
                        || candidate.contains(&wanted)
                        || wanted.replace(' ', "") == candidate.replace(' ', "")
                    {
                        found = Some((inv_item.clone(), *qty));
                        break;
                    }
                }
            }

            return Ok(Some(match found {
                Some((name, qty)) if qty > 0.0 => {
                    format!("<@{target_user_id}> has {} {}.", qty as i64, pluralize_for_display(&name, qty))
                }
                _ => format!("<@{target_user_id}> has 0 {}.", pluralize_for_display(item_name, 2.0)),
            }));
        }
    }

    if has_gold_mention {
        let gold = match ledger.get(&target_user_id, "gold", StateValue::Number(0.0))? {
            StateValue::Number(n) => n,
            StateValue::Inventory(_) => 0.0,
        };
        return Ok(Some(format!("<@{target_user_id}> has {} gold pieces.", gold as i64)));
    }

    if has_inventory_mention {
        let tracked = items.get_user_items(&target_user_id)?;
        let mut all_items: std::collections::HashMap<String, f64> = match ledger.get(&target_user_id, "inventory", StateValue::Inventory(Default::default()))? {
            StateValue::Inventory(m) => m,
            StateValue::Number(_) => Default::default(),
        };
        for item in tracked {
            let slot = all_items.entry(item.canonical_name).or_insert(0.0);
            *slot = slot.max(item.quantity);
        }
        return Ok(Some(if all_items.is_empty() {
            format!("<@{target_user_id}>'s inventory is empty.")
        } else {
            let listed = all_items.iter().map(|(k, v)| format!("{} {}", *v as i64, k)).collect::<Vec<_>>().join(", ");
            format!("<@{target_user_id}>'s inventory: {listed}.")
        }));
    }

    if item_name.is_none() && has_mention && (question_lower.contains("how many") || question_lower.contains("how much")) {
        let gold = match ledger.get(&target_user_id, "gold", StateValue::Number(0.0))? {
            StateValue::Number(n) => n,
            StateValue::Inventory(_) => 0.0,
        };
        return Ok(Some(format!("<@{target_user_id}> has {} gold pieces.", gold as i64)));
    }

    let all_states = ledger.get_all(&target_user_id)?;
    if !all_states.is_empty() {
        let summary: Vec<String> = all_states
            .iter()
            .filter_map(|(key, value)| match value {
                StateValue::Number(n) => Some(format!("{key}: {n}")),
                StateValue::Inventory(m) if !m.is_empty() => Some(format!("{key}: {} items", m.len())),
                StateValue::Inventory(_) => None,
            })
            .collect();
        if !summary.is_empty() {
            return Ok(Some(format!("<@{target_user_id}>'s state: {}.", summary.join(", "))));
        }
    }

    Ok(None)
}

fn state_set_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?:keep track|remember|set|i have|i own|i'm|i am).*(?:having|with|of).*(\d+).*(?:gold|coins?|pieces?)",
            r"(?:keep track|remember|set).*(?:me|i|my).*(?:having|with|of).*(\d+).*(?:gold|coins?|pieces?)",
            r"(?:i have|i own|i'm|i am).*(\d+).*(?:gold|coins?|pieces?)",
            r"(?:set|update|change).*(?:my|me|i).*(?:gold|coins?).*to.*(\d+)",
            r"(?:set|update|change).*(\d+).*(?:gold|coins?).*(?:for|to)",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn gold_amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+).*(?:gold|coins?|pieces?)").unwrap())
}

/// `_handle_state_set`. Recognizes "I have N gold"-shaped commands and
/// writes the amount directly (no read-modify-write — a set, not an
/// increment). Returns `None` when the utterance isn't a state-set.
pub async fn handle_state_set(
    question: &str,
    user_id: Option<&str>,
    mentioned_user_id: Option<&str>,
    ledger: &StateLedger,
) -> Result<Option<String>> {
    let question_lower = question.to_lowercase();
    if !state_set_patterns().iter().any(|p| p.is_match(&question_lower)) {
        return Ok(None);
    }

    let Some(target_user_id) = mentioned_user_id.or(user_id) else {
        return Ok(Some("I need to know who you're setting state for. Please mention a user or set it for yourself.".to_string()));
    };

    let Some(captures) = gold_amount_re().captures(&question_lower) else {
        return Ok(None);
    };
    let Ok(gold_amount) = captures[1].parse::<f64>() else {
        return Ok(None);
    };

    let ctx = WriteContext::new(user_id.unwrap_or("unknown"), None, "state_set command");
    ledger.set(target_user_id, "gold", StateValue::Number(gold_amount), &ctx)?;

    Ok(Some(format!("I've updated your gold balance. You now have {} gold coins.", gold_amount as i64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::items::ItemTracker;
    use rag_completion::CompletionClient;
    use rusqlite::Connection;

    fn test_ledger() -> StateLedger {
        StateLedger::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn test_items() -> ItemTracker {
        ItemTracker::new(Connection::open_in_memory().unwrap(), CompletionClient::new("http://unused.invalid", "k", "m")).unwrap()
    }

    #[tokio::test]
    async fn gold_query_reads_ledger() {
        let ledger = test_ledger();
        let items = test_items();
        ledger.set("b", "gold", StateValue::Number(42.0), &WriteContext::new("t", None, "setup")).unwrap();
        let answer = handle_state_query("how much gold does <@b> have?", Some("a"), Some("b"), &ledger, &items)
            .await
            .unwrap();
        assert_eq!(answer, Some("<@b> has 42 gold pieces.".to_string()));
    }

    #[tokio::test]
    async fn specific_item_query_checks_tracked_items() {
        let ledger = test_ledger();
        let items = test_items();
        items.track_item("b", "unicorn dildo", "misc", 2.0).unwrap();
        let answer = handle_state_query("how many unicorn dildos does <@b> have?", Some("a"), Some("b"), &ledger, &items)
            .await
            .unwrap();
        assert_eq!(answer, Some("<@b> has 2 unicorn dildos.".to_string()));
    }

    #[tokio::test]
    async fn self_reference_beats_mentioned_user_id() {
        let ledger = test_ledger();
        let items = test_items();
        ledger.set("a", "gold", StateValue::Number(5.0), &WriteContext::new("t", None, "setup")).unwrap();
        let answer = handle_state_query("how much gold do i have", Some("a"), Some("b"), &ledger, &items).await.unwrap();
        assert_eq!(answer, Some("<@a> has 5 gold pieces.".to_string()));
    }

    #[tokio::test]
    async fn non_state_query_returns_none() {
        let ledger = test_ledger();
        let items = test_items();
        let answer = handle_state_query("what's the capital of France", None, None, &ledger, &items).await.unwrap();
        assert_eq!(answer, None);
    }

    #[tokio::test]
    async fn state_set_writes_gold_and_confirms() {
        let ledger = test_ledger();
        let answer = handle_state_set("keep track of me having 1940 gold coins", Some("a"), None, &ledger).await.unwrap();
        assert_eq!(answer, Some("I've updated your gold balance. You now have 1940 gold coins.".to_string()));
        assert_eq!(ledger.get("a", "gold", StateValue::Number(0.0)).unwrap(), StateValue::Number(1940.0));
    }

    #[tokio::test]
    async fn non_set_command_returns_none() {
        let ledger = test_ledger();
        let answer = handle_state_set("hello there", Some("a"), None, &ledger).await.unwrap();
        assert_eq!(answer, None);
    }
}
