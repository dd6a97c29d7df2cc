//! State Ledger. A `(user_id, key) -> value` map with an audit trail on
//! every write, grounded on the `UserStateManager` calls threaded through
//! `enhanced_rag_pipeline.py`'s `_handle_action`/`_handle_state_query`/
//! `_handle_state_set` (`get_user_state`, `set_user_state`,
//! `increment_user_state`, `add_to_inventory`, `transfer_state`,
//! `transfer_item`, `get_user_all_states`). Lock ordering uses the
//! canonical `(user_id, key)` order for transfers so two concurrent
//! transfers can never deadlock by acquiring the same pair of keys in
//! opposite order; the sqlite idiom itself (`init_db` + `execute_batch`,
//! row-mapping colocated with queries, RFC3339 timestamps) follows
//! `rag-store/src/sqlite.rs`.

use chrono::Utc;
use dashmap::DashMap;
use rag_core::error::{CoreError, Result};
use rag_core::types::{AuditRecord, StateValue};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS state_entries (
            user_id     TEXT NOT NULL,
            key         TEXT NOT NULL,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (user_id, key)
        );
        CREATE TABLE IF NOT EXISTS state_audit (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            key         TEXT NOT NULL,
            actor       TEXT NOT NULL,
            channel     TEXT,
            reason      TEXT NOT NULL,
            timestamp   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_state_audit_user_key ON state_audit (user_id, key);
        CREATE TABLE IF NOT EXISTS persona_mentions (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id      TEXT NOT NULL,
            channel_id   TEXT NOT NULL,
            persona_id   TEXT NOT NULL,
            mentioned_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_persona_mentions_user_channel ON persona_mentions (user_id, channel_id);",
    )
}

/// Write provenance: who did it, in what channel, and why. Defaults to
/// `"unspecified"` reason when the caller has none worth recording.
#[derive(Debug, Clone)]
pub struct WriteContext {
    pub actor: String,
    pub channel: Option<String>,
    pub reason: String,
}

impl WriteContext {
    pub fn new(actor: impl Into<String>, channel: Option<String>, reason: impl Into<String>) -> Self {
        Self { actor: actor.into(), channel, reason: reason.into() }
    }
}

/// `(user_id, key) -> value` ledger with per-key write serialization.
///
/// The sqlite `Mutex<Connection>` alone would serialize every write
/// globally, but a transfer needs two *logical* keys locked together in
/// a fixed order without blocking unrelated keys for the duration — so a
/// separate per-key lock table sits above the connection guard, locked in
/// `(user_id, key)` lexicographic order.
pub struct StateLedger {
    db: Mutex<Connection>,
    key_locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl StateLedger {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self { db: Mutex::new(conn), key_locks: DashMap::new() })
    }

    fn lock_for(&self, user_id: &str, key: &str) -> Arc<Mutex<()>> {
        self.key_locks
            .entry((user_id.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// `get(user, key, default)`. Reads are lock-free against the key table
    /// — a write in flight either hasn't committed yet (reader sees the old
    /// value) or already has (reader sees the new one); no torn reads.
    pub fn get(&self, user_id: &str, key: &str, default: StateValue) -> Result<StateValue> {
        Ok(self.read_value(user_id, key)?.unwrap_or(default))
    }

    fn read_value(&self, user_id: &str, key: &str) -> Result<Option<StateValue>> {
        let conn = self.db.lock().unwrap();
        let row: Option<String> = conn
            .query_row(
                "SELECT value FROM state_entries WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
                |r| r.get(0),
            )
            .optional()?;
        drop(conn);
        row.map(|json| serde_json::from_str(&json).map_err(CoreError::from)).transpose()
    }

    fn write_value(&self, user_id: &str, key: &str, value: &StateValue, ctx: &WriteContext) -> Result<()> {
        let conn = self.db.lock().unwrap();
        let now = Utc::now();
        let json = serde_json::to_string(value)?;
        conn.execute(
            "INSERT INTO state_entries (user_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![user_id, key, json, now.to_rfc3339()],
        )?;
        conn.execute(
            "INSERT INTO state_audit (user_id, key, actor, channel, reason, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![user_id, key, ctx.actor, ctx.channel, ctx.reason, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// `set(user, key, value, metadata)`.
    pub fn set(&self, user_id: &str, key: &str, value: StateValue, ctx: &WriteContext) -> Result<()> {
        let _guard = self.lock_for(user_id, key).lock().unwrap();
        self.write_value(user_id, key, &value, ctx)
    }

    /// `increment(user, key, amount, metadata)`. Non-numeric existing
    /// values are an inconsistency, not a silent coercion.
    pub fn increment(&self, user_id: &str, key: &str, amount: f64, ctx: &WriteContext) -> Result<f64> {
        let _guard = self.lock_for(user_id, key).lock().unwrap();
        let current = match self.read_value(user_id, key)? {
            Some(StateValue::Number(n)) => n,
            Some(StateValue::Inventory(_)) => {
                return Err(CoreError::Inconsistency(format!("{key} is an inventory map, not a number")))
            }
            None => 0.0,
        };
        let new_value = current + amount;
        self.write_value(user_id, key, &StateValue::Number(new_value), ctx)?;
        Ok(new_value)
    }

    /// `add_to_inventory(user, item, qty, metadata)`. Item name is already
    /// normalized by the caller (`rag-state::items`).
    pub fn add_to_inventory(&self, user_id: &str, item: &str, qty: f64, ctx: &WriteContext) -> Result<f64> {
        let key = "inventory";
        let _guard = self.lock_for(user_id, key).lock().unwrap();
        let mut map = match self.read_value(user_id, key)? {
            Some(StateValue::Inventory(m)) => m,
            Some(StateValue::Number(_)) => {
                return Err(CoreError::Inconsistency("inventory is a number, not a map".to_string()))
            }
            None => HashMap::new(),
        };
        let new_qty = map.get(item).copied().unwrap_or(0.0) + qty;
        map.insert(item.to_string(), new_qty);
        self.write_value(user_id, key, &StateValue::Inventory(map), ctx)?;
        Ok(new_qty)
    }

    /// `transfer(from, to, key, amount, metadata)`. Two-phase: validate
    /// source balance, decrement source, increment destination; a failure
    /// applying the destination write rolls the source decrement back, so
    /// the combined total across both parties is invariant for any
    /// successful (or cleanly failed) transfer.
    pub fn transfer(&self, from: &str, to: &str, key: &str, amount: f64, ctx: &WriteContext) -> Result<(f64, f64)> {
        if amount < 0.0 {
            return Err(CoreError::InvalidInput("transfer amount must be non-negative".to_string()));
        }
        let (first, second) = canonical_order(from, to);
        let _g1 = self.lock_for(&first, key).lock().unwrap();
        let _g2 = if first != second { Some(self.lock_for(&second, key).lock().unwrap()) } else { None };

        let source_balance = match self.read_value(from, key)? {
            Some(StateValue::Number(n)) => n,
            Some(StateValue::Inventory(_)) => {
                return Err(CoreError::Inconsistency(format!("{key} is an inventory map, not a number")))
            }
            None => 0.0,
        };
        if source_balance < amount {
            return Err(CoreError::Inconsistency(format!(
                "insufficient balance: {from} has {source_balance} {key}, needs {amount}"
            )));
        }
        let new_source = source_balance - amount;
        self.write_value(from, key, &StateValue::Number(new_source), ctx)?;

        let dest_balance = match self.read_value(to, key)? {
            Some(StateValue::Number(n)) => n,
            Some(StateValue::Inventory(_)) => {
                // roll back the source decrement, the destination key is the wrong shape
                self.write_value(from, key, &StateValue::Number(source_balance), ctx)?;
                return Err(CoreError::Inconsistency(format!("{key} is an inventory map for {to}")));
            }
            None => 0.0,
        };
        let new_dest = dest_balance + amount;
        if let Err(e) = self.write_value(to, key, &StateValue::Number(new_dest), ctx) {
            // roll back the source decrement so a+b stays invariant on failure
            self.write_value(from, key, &StateValue::Number(source_balance), ctx).ok();
            return Err(e);
        }
        Ok((new_source, new_dest))
    }

    /// `transfer_item(from, to, item, qty, metadata)`. Same two-phase
    /// discipline as `transfer`, over the `inventory` map instead of a
    /// flat numeric key.
    pub fn transfer_item(&self, from: &str, to: &str, item: &str, qty: f64, ctx: &WriteContext) -> Result<(f64, f64)> {
        if qty < 0.0 {
            return Err(CoreError::InvalidInput("transfer quantity must be non-negative".to_string()));
        }
        let key = "inventory";
        let (first, second) = canonical_order(from, to);
        let _g1 = self.lock_for(&first, key).lock().unwrap();
        let _g2 = if first != second { Some(self.lock_for(&second, key).lock().unwrap()) } else { None };

        let mut source_inv = match self.read_value(from, key)? {
            Some(StateValue::Inventory(m)) => m,
            Some(StateValue::Number(_)) => {
                return Err(CoreError::Inconsistency("inventory is a number, not a map".to_string()))
            }
            None => HashMap::new(),
        };
        let have = source_inv.get(item).copied().unwrap_or(0.0);
        if have < qty {
            return Err(CoreError::Inconsistency(format!("{from} has {have} {item}, needs {qty}")));
        }
        let new_source_qty = have - qty;
        source_inv.insert(item.to_string(), new_source_qty);
        self.write_value(from, key, &StateValue::Inventory(source_inv.clone()), ctx)?;

        let dest_new_qty = match self.add_to_inventory(to, item, qty, ctx) {
            Ok(q) => q,
            Err(e) => {
                // roll back: restore source's pre-transfer quantity
                source_inv.insert(item.to_string(), have);
                self.write_value(from, key, &StateValue::Inventory(source_inv), ctx).ok();
                return Err(e);
            }
        };
        Ok((new_source_qty, dest_new_qty))
    }

    /// `get_all(user)`. Every key this user has ever written, most
    /// recently updated first.
    pub fn get_all(&self, user_id: &str) -> Result<HashMap<String, StateValue>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM state_entries WHERE user_id = ?1 ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id], |r| {
            let key: String = r.get(0)?;
            let value: String = r.get(1)?;
            Ok((key, value))
        })?;
        let mut out = HashMap::new();
        for row in rows.filter_map(|r| r.ok()) {
            let (key, json) = row;
            if let Ok(value) = serde_json::from_str::<StateValue>(&json) {
                out.insert(key, value);
            }
        }
        Ok(out)
    }

    /// Audit trail for one `(user, key)`, newest first — every write
    /// (`set`/`increment`/`transfer`/...) appends one row here, which is
    /// how tests confirm a write actually happened and recorded who/why.
    pub fn audit_trail(&self, user_id: &str, key: &str) -> Result<Vec<AuditRecord>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT timestamp, actor, channel, reason FROM state_audit
             WHERE user_id = ?1 AND key = ?2 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map(params![user_id, key], |r| {
            let timestamp: String = r.get(0)?;
            Ok(AuditRecord {
                timestamp: timestamp.parse().unwrap_or_else(|_| Utc::now()),
                actor: r.get(1)?,
                channel: r.get(2)?,
                reason: r.get(3)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// `identify_persona(user_id, message, channel, username?)`. Consults
    /// prior in-channel persona mentions; returns the most recent one, or
    /// `None` when the user has no recorded persona in this channel (the
    /// caller then treats the message as unambiguous-to-user).
    pub fn identify_persona(&self, user_id: &str, _message: &str, channel: &str) -> Result<Option<String>> {
        let conn = self.db.lock().unwrap();
        conn.query_row(
            "SELECT persona_id FROM persona_mentions
             WHERE user_id = ?1 AND channel_id = ?2 ORDER BY mentioned_at DESC LIMIT 1",
            params![user_id, channel],
            |r| r.get(0),
        )
        .optional()
        .map_err(CoreError::from)
    }

    pub fn record_persona_mention(&self, user_id: &str, channel: &str, persona_id: &str) -> Result<()> {
        let conn = self.db.lock().unwrap();
        conn.execute(
            "INSERT INTO persona_mentions (user_id, channel_id, persona_id, mentioned_at) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, channel, persona_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

/// Lexicographic order on `user_id` first, per spec §5's deadlock-avoidance
/// rule. Ties (self-transfer) collapse to a single lock.
fn canonical_order(a: &str, b: &str) -> (String, String) {
    if a <= b { (a.to_string(), b.to_string()) } else { (b.to_string(), a.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> StateLedger {
        let conn = Connection::open_in_memory().unwrap();
        StateLedger::new(conn).unwrap()
    }

    fn ctx() -> WriteContext {
        WriteContext::new("tester", Some("chan".to_string()), "test")
    }

    #[test]
    fn get_returns_default_when_unset() {
        let l = ledger();
        let v = l.get("a", "gold", StateValue::Number(0.0)).unwrap();
        assert_eq!(v, StateValue::Number(0.0));
    }

    #[test]
    fn set_then_get_round_trips() {
        let l = ledger();
        l.set("a", "gold", StateValue::Number(10.0), &ctx()).unwrap();
        assert_eq!(l.get("a", "gold", StateValue::Number(0.0)).unwrap(), StateValue::Number(10.0));
    }

    #[test]
    fn increment_accumulates() {
        let l = ledger();
        l.increment("a", "gold", 5.0, &ctx()).unwrap();
        let total = l.increment("a", "gold", 3.0, &ctx()).unwrap();
        assert_eq!(total, 8.0);
    }

    #[test]
    fn transfer_conserves_total_and_updates_both_sides() {
        let l = ledger();
        l.set("a", "gold", StateValue::Number(10.0), &ctx()).unwrap();
        l.set("b", "gold", StateValue::Number(0.0), &ctx()).unwrap();
        let (new_a, new_b) = l.transfer("a", "b", "gold", 3.0, &ctx()).unwrap();
        assert_eq!(new_a, 7.0);
        assert_eq!(new_b, 3.0);
        assert_eq!(new_a + new_b, 10.0);
    }

    #[test]
    fn transfer_rejects_insufficient_balance() {
        let l = ledger();
        l.set("a", "gold", StateValue::Number(2.0), &ctx()).unwrap();
        let err = l.transfer("a", "b", "gold", 5.0, &ctx()).unwrap_err();
        assert!(matches!(err, CoreError::Inconsistency(_)));
        assert_eq!(l.get("a", "gold", StateValue::Number(0.0)).unwrap(), StateValue::Number(2.0));
    }

    #[test]
    fn add_to_inventory_accumulates_per_item() {
        let l = ledger();
        l.add_to_inventory("a", "unicorn dildo", 2.0, &ctx()).unwrap();
        let total = l.add_to_inventory("a", "unicorn dildo", 1.0, &ctx()).unwrap();
        assert_eq!(total, 3.0);
    }

    #[test]
    fn transfer_item_moves_quantity_between_inventories() {
        let l = ledger();
        l.add_to_inventory("a", "sword", 2.0, &ctx()).unwrap();
        let (left, arrived) = l.transfer_item("a", "b", "sword", 1.0, &ctx()).unwrap();
        assert_eq!(left, 1.0);
        assert_eq!(arrived, 1.0);
    }

    #[test]
    fn get_all_reflects_every_written_key() {
        let l = ledger();
        l.set("a", "gold", StateValue::Number(4.0), &ctx()).unwrap();
        l.add_to_inventory("a", "torch", 1.0, &ctx()).unwrap();
        let all = l.get_all("a").unwrap();
        assert_eq!(all.get("gold"), Some(&StateValue::Number(4.0)));
        assert!(all.contains_key("inventory"));
    }

    #[test]
    fn every_write_leaves_an_audit_record() {
        let l = ledger();
        l.set("a", "gold", StateValue::Number(1.0), &ctx()).unwrap();
        l.increment("a", "gold", 1.0, &ctx()).unwrap();
        let trail = l.audit_trail("a", "gold").unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].actor, "tester");
    }

    #[test]
    fn persona_lookup_is_none_until_recorded() {
        let l = ledger();
        assert_eq!(l.identify_persona("a", "hi", "chan").unwrap(), None);
        l.record_persona_mention("a", "chan", "persona-1").unwrap();
        assert_eq!(l.identify_persona("a", "hi", "chan").unwrap(), Some("persona-1".to_string()));
    }
}
