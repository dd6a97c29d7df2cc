//! Item Tracker. Normalizes free-text item names ("gold coins", "gp",
//! "unicorn dildos") to a canonical singular form and a coarse type, then
//! tracks `(owner_id, canonical_name) -> {quantity, properties}`.
//!
//! Grounded on the `LLMItemTracker` calls threaded through
//! `enhanced_rag_pipeline.py` (`understand_item`, `track_item`,
//! `get_user_items`, `transfer_item`) and its `_normalize_currency_key`
//! rule table (lines ~53-64) for the fast, model-free currency path.
//!
//! Redesign note: the original keeps item_tracker's own table *and* a
//! parallel copy inside the generic state ledger's `inventory` map,
//! writing both on every transfer. That dual bookkeeping is consolidated
//! here — currency keys live only in the ledger (`rag-state::ledger`),
//! everything else lives only in `tracked_items`. Both original read
//! paths (`get_user_items`, ledger inventory fallback) still work; there's
//! just one writer per item class instead of two.

use rag_cache::TtlCache;
use rag_completion::{CompletionClient, CompletionError};
use rag_core::error::{CoreError, Result};
use rag_core::types::{Message, Role, TrackedItem};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tracked_items (
            owner_id        TEXT NOT NULL,
            canonical_name  TEXT NOT NULL,
            quantity        REAL NOT NULL DEFAULT 0,
            item_type       TEXT NOT NULL DEFAULT 'misc',
            properties      TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (owner_id, canonical_name)
        );",
    )
}

/// The result of normalizing one item string: a canonical singular name
/// plus a coarse type used for currency-vs-everything-else routing.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedItem {
    pub canonical_name: String,
    pub item_type: String,
}

#[derive(Deserialize)]
struct RawClassification {
    normalized_name: String,
    #[serde(default = "default_item_type")]
    item_type: String,
}

fn default_item_type() -> String {
    "misc".to_string()
}

/// Exact port of `_normalize_currency_key`: "gold coins"/"gp"/"coins" ->
/// "gold", "silver pieces"/"sp" -> "silver". Anything else falls through
/// to the model/rule classifier in `ItemTracker::understand_item`.
pub fn normalize_currency_key(item_name: &str) -> Option<&'static str> {
    match item_name.to_lowercase().trim() {
        "gold" | "coins" | "coin" | "gold coins" | "gold pieces" | "gold coin" | "gp" => Some("gold"),
        "silver" | "silver pieces" | "silver coins" | "sp" => Some("silver"),
        _ => None,
    }
}

/// Strip a trailing pluralizing 's' (but not from words ending "ss"),
/// mirroring `normalize_for_match` in `_handle_state_query`.
pub fn singularize(name: &str) -> String {
    let lower = name.to_lowercase();
    if lower.ends_with('s') && !lower.ends_with("ss") {
        lower[..lower.len() - 1].to_string()
    } else {
        lower
    }
}

pub struct ItemTracker {
    db: Mutex<Connection>,
    completion: CompletionClient,
    cache: TtlCache<String, NormalizedItem>,
}

impl ItemTracker {
    pub fn new(conn: Connection, completion: CompletionClient) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            completion,
            cache: TtlCache::new("item_normalization_cache", Duration::from_secs(3600), 5000),
        })
    }

    /// `understand_item(item_name) -> {normalized_name, item_type}`.
    /// Currency short-circuits the model call entirely; everything else is
    /// classified once per distinct (lowercased, trimmed) input and cached.
    pub async fn understand_item(&self, item_name: &str) -> Result<NormalizedItem> {
        if let Some(key) = normalize_currency_key(item_name) {
            return Ok(NormalizedItem { canonical_name: key.to_string(), item_type: "currency".to_string() });
        }
        let cache_key = item_name.to_lowercase().trim().to_string();
        if cache_key.is_empty() {
            return Err(CoreError::InvalidInput("empty item name".to_string()));
        }
        let client = &self.completion;
        let fallback_name = singularize(&cache_key);
        let compute_key = cache_key.clone();
        let result = self
            .cache
            .get_or_compute(cache_key, || async move {
                match classify_item(client, &compute_key).await {
                    Ok(item) => item,
                    Err(e) => {
                        warn!(error = %e, item = %compute_key, "item classification failed, using rule fallback");
                        NormalizedItem { canonical_name: fallback_name, item_type: "misc".to_string() }
                    }
                }
            })
            .await;
        Ok(result)
    }

    /// `track_item(canonical_name, owner_id, quantity, properties)`. Adds
    /// to any existing quantity for the same `(owner_id, canonical_name)`.
    pub fn track_item(&self, owner_id: &str, canonical_name: &str, item_type: &str, quantity: f64) -> Result<f64> {
        let conn = self.db.lock().unwrap();
        let existing: Option<f64> = conn
            .query_row(
                "SELECT quantity FROM tracked_items WHERE owner_id = ?1 AND canonical_name = ?2",
                params![owner_id, canonical_name],
                |r| r.get(0),
            )
            .optional()?;
        let new_qty = existing.unwrap_or(0.0) + quantity;
        conn.execute(
            "INSERT INTO tracked_items (owner_id, canonical_name, quantity, item_type, properties)
             VALUES (?1, ?2, ?3, ?4, '{}')
             ON CONFLICT(owner_id, canonical_name) DO UPDATE SET quantity = excluded.quantity, item_type = excluded.item_type",
            params![owner_id, canonical_name, new_qty, item_type],
        )?;
        Ok(new_qty)
    }

    /// `get_user_items(owner_id)`.
    pub fn get_user_items(&self, owner_id: &str) -> Result<Vec<TrackedItem>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT owner_id, canonical_name, quantity, item_type, properties
             FROM tracked_items WHERE owner_id = ?1 AND quantity > 0",
        )?;
        let rows = stmt.query_map(params![owner_id], |r| {
            let properties_json: String = r.get(4)?;
            Ok(TrackedItem {
                owner_id: r.get(0)?,
                canonical_name: r.get(1)?,
                quantity: r.get(2)?,
                item_type: r.get(3)?,
                properties: serde_json::from_str(&properties_json).unwrap_or_default(),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// `transfer_item(item_name, from, to, qty)`. Normalizes the item name
    /// first (so both sides agree on the canonical key even if the caller
    /// used a plural or typo'd variant), then validates and moves
    /// quantity. Returns the canonical name actually moved.
    pub async fn transfer_item(&self, item_name: &str, from: &str, to: &str, qty: f64) -> Result<NormalizedItem> {
        let normalized = self.understand_item(item_name).await?;
        let conn = self.db.lock().unwrap();
        let have: f64 = conn
            .query_row(
                "SELECT quantity FROM tracked_items WHERE owner_id = ?1 AND canonical_name = ?2",
                params![from, normalized.canonical_name],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or(0.0);
        if have < qty {
            return Err(CoreError::Inconsistency(format!(
                "{from} has {have} {}, needs {qty}",
                normalized.canonical_name
            )));
        }
        conn.execute(
            "UPDATE tracked_items SET quantity = quantity - ?1 WHERE owner_id = ?2 AND canonical_name = ?3",
            params![qty, from, normalized.canonical_name],
        )?;
        drop(conn);
        if let Err(e) = self.track_item(to, &normalized.canonical_name, &normalized.item_type, qty) {
            // roll back the source decrement so total quantity stays invariant on failure
            let conn = self.db.lock().unwrap();
            conn.execute(
                "UPDATE tracked_items SET quantity = quantity + ?1 WHERE owner_id = ?2 AND canonical_name = ?3",
                params![qty, from, normalized.canonical_name],
            )
            .ok();
            return Err(e);
        }
        Ok(normalized)
    }
}

async fn classify_item(client: &CompletionClient, item_name: &str) -> std::result::Result<NormalizedItem, CompletionError> {
    let prompt = format!(
        "Normalize this game item name to a canonical singular form and classify its type.\n\
         Item: \"{item_name}\"\n\
         Respond with ONLY a JSON object: {{\"normalized_name\": \"...\", \"item_type\": \"currency|misc|weapon|consumable|armor\"}}"
    );
    let messages = vec![Message { role: Role::User, content: prompt }];
    let text = client.complete(&messages, 0.0, 100).await?;
    parse_classification(&text).ok_or_else(|| CompletionError::Parse(format!("unparseable item classification: {text}")))
}

fn parse_classification(text: &str) -> Option<NormalizedItem> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let raw: RawClassification = serde_json::from_str(&text[start..=end]).ok()?;
    debug!(raw = %raw.normalized_name, "parsed item classification");
    Some(NormalizedItem { canonical_name: raw.normalized_name.to_lowercase(), item_type: raw.item_type })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_variants_normalize_to_gold() {
        for variant in ["gold", "coins", "coin", "gold coins", "gold pieces", "gold coin", "gp", "GP", " GoLd Coins "] {
            assert_eq!(normalize_currency_key(variant), Some("gold"), "variant: {variant}");
        }
    }

    #[test]
    fn currency_variants_normalize_to_silver() {
        for variant in ["silver", "silver pieces", "silver coins", "sp"] {
            assert_eq!(normalize_currency_key(variant), Some("silver"));
        }
    }

    #[test]
    fn non_currency_items_are_not_normalized_by_the_rule_table() {
        assert_eq!(normalize_currency_key("unicorn dildo"), None);
        assert_eq!(normalize_currency_key("sword"), None);
    }

    #[test]
    fn singularize_strips_trailing_s_but_not_ss() {
        assert_eq!(singularize("dildos"), "dildo");
        assert_eq!(singularize("compass"), "compass");
        assert_eq!(singularize("sword"), "sword");
    }

    #[test]
    fn parse_classification_handles_fenced_and_bare_json() {
        let fenced = "```json\n{\"normalized_name\": \"sword\", \"item_type\": \"weapon\"}\n```";
        let bare = "{\"normalized_name\": \"torch\", \"item_type\": \"misc\"}";
        assert_eq!(
            parse_classification(fenced),
            Some(NormalizedItem { canonical_name: "sword".to_string(), item_type: "weapon".to_string() })
        );
        assert_eq!(
            parse_classification(bare),
            Some(NormalizedItem { canonical_name: "torch".to_string(), item_type: "misc".to_string() })
        );
    }

    #[test]
    fn track_item_and_get_user_items_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        let tracker = ItemTracker::new(conn, CompletionClient::new("http://unused.invalid", "key", "model")).unwrap();
        tracker.track_item("u1", "sword", "weapon", 2.0).unwrap();
        let items = tracker.get_user_items("u1").unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 2.0);
    }

    #[tokio::test]
    async fn transfer_item_rejects_insufficient_quantity() {
        let conn = Connection::open_in_memory().unwrap();
        let tracker = ItemTracker::new(conn, CompletionClient::new("http://unused.invalid", "key", "model")).unwrap();
        let err = tracker.transfer_item("gold", "a", "b", 5.0).await.unwrap_err();
        assert!(matches!(err, CoreError::Inconsistency(_)));
    }
}
