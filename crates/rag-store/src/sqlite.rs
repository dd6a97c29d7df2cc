//! Local tables backing the memory and conversation mirrors of the store
//! facade (spec §4.1 "Memory and conversation mirrors of the above").
//!
//! Grounded on `skynet-memory/src/db.rs`: `CREATE TABLE IF NOT EXISTS` +
//! `execute_batch` for idempotent startup init, an FTS5 virtual table kept
//! in sync alongside the base table for lexical memory search, and
//! per-table row-mapping functions colocated with their queries.

use rag_core::types::{ConversationMessage, Memory, MemoryType};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

pub fn init_db(conn: &Connection) -> SqlResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memories (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id          TEXT NOT NULL,
            content             TEXT NOT NULL,
            embedding           BLOB,
            memory_type         TEXT NOT NULL,
            user_id             TEXT,
            username            TEXT,
            mentioned_user_id   TEXT,
            created_at          TEXT NOT NULL,
            importance          REAL NOT NULL DEFAULT 0.5
        );
        CREATE INDEX IF NOT EXISTS idx_memories_channel ON memories (channel_id);
        CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
            content, content='memories', content_rowid='id'
        );
        CREATE TABLE IF NOT EXISTS conversations (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL,
            channel_id  TEXT,
            question    TEXT NOT NULL,
            answer      TEXT NOT NULL,
            embedding   BLOB,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations (user_id, channel_id);
        CREATE VIRTUAL TABLE IF NOT EXISTS conversations_fts USING fts5(
            question, answer, content='conversations', content_rowid='id'
        );",
    )
}

pub fn insert_memory(conn: &Connection, memory: &Memory) -> SqlResult<i64> {
    let embedding_blob = memory.embedding.as_ref().map(|v| encode_vec(v));
    conn.execute(
        "INSERT INTO memories
            (channel_id, content, embedding, memory_type, user_id, username,
             mentioned_user_id, created_at, importance)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            memory.channel_id,
            memory.content,
            embedding_blob,
            memory.memory_type.to_string(),
            memory.user_id,
            memory.username,
            memory.mentioned_user_id,
            memory.created_at.to_rfc3339(),
            memory.importance,
        ],
    )?;
    let id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO memories_fts(rowid, content) VALUES (?1, ?2)",
        params![id, memory.content],
    )?;
    Ok(id)
}

/// Lexical (BM25-via-FTS5) search over a channel's memories, newest-ranked
/// ties broken by recency. Dense re-ranking against `embedding` happens in
/// `rag-retrieval`, not here — this returns candidates only.
pub fn search_memories_lexical(
    conn: &Connection,
    channel_id: &str,
    query: &str,
    limit: usize,
) -> SqlResult<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT m.id, m.channel_id, m.content, m.embedding, m.memory_type, m.user_id,
                m.username, m.mentioned_user_id, m.created_at, m.importance
         FROM memories m
         JOIN memories_fts f ON m.id = f.rowid
         WHERE m.channel_id = ?1 AND memories_fts MATCH ?2
         ORDER BY rank
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![channel_id, query, limit], row_to_memory)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn recent_memories(conn: &Connection, channel_id: &str, limit: usize) -> SqlResult<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT id, channel_id, content, embedding, memory_type, user_id,
                username, mentioned_user_id, created_at, importance
         FROM memories WHERE channel_id = ?1 ORDER BY created_at DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![channel_id, limit], row_to_memory)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn clear_channel_memories(conn: &Connection, channel_id: &str) -> SqlResult<u64> {
    let ids: Vec<i64> = conn
        .prepare("SELECT id FROM memories WHERE channel_id = ?1")?
        .query_map(params![channel_id], |r| r.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    for id in &ids {
        conn.execute(
            "INSERT INTO memories_fts(memories_fts, rowid, content) VALUES ('delete', ?1, '')",
            params![id],
        )
        .ok();
    }
    let n = conn.execute("DELETE FROM memories WHERE channel_id = ?1", params![channel_id])?;
    Ok(n as u64)
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let type_str: String = row.get(4)?;
    let embedding: Option<Vec<u8>> = row.get(3)?;
    let created_at: String = row.get(8)?;
    Ok(Memory {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        content: row.get(2)?,
        embedding: embedding.map(|b| decode_vec(&b)),
        memory_type: type_str.parse().unwrap_or(MemoryType::UserMessage),
        user_id: row.get(5)?,
        username: row.get(6)?,
        mentioned_user_id: row.get(7)?,
        created_at: created_at
            .parse()
            .unwrap_or_else(|_| chrono::Utc::now()),
        importance: row.get(9)?,
    })
}

pub fn insert_conversation(conn: &Connection, msg: &ConversationMessage) -> SqlResult<i64> {
    conn.execute(
        "INSERT INTO conversations (user_id, channel_id, question, answer, embedding, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            msg.user_id,
            msg.channel_id,
            msg.question,
            msg.answer,
            msg.embedding.as_ref().map(|v| encode_vec(v)),
            msg.created_at.to_rfc3339(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO conversations_fts(rowid, question, answer) VALUES (?1, ?2, ?3)",
        params![id, msg.question, msg.answer],
    )?;
    Ok(id)
}

/// Lexical search over a user's own conversation history (spec §6
/// `get_relevant_conversations`), scored by FTS5 bm25 rank folded into a
/// positive, higher-is-better `f32` the same way `rag-retrieval` expects
/// lexical scores to look.
pub fn get_relevant_conversations(
    conn: &Connection,
    user_id: &str,
    query: &str,
    k: usize,
) -> SqlResult<Vec<(ConversationMessage, f32)>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.user_id, c.channel_id, c.question, c.answer, c.embedding, c.created_at, rank
         FROM conversations c
         JOIN conversations_fts f ON c.id = f.rowid
         WHERE c.user_id = ?1 AND conversations_fts MATCH ?2
         ORDER BY rank
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![user_id, query, k], |row| {
        let msg = row_to_conversation(row)?;
        let rank: f64 = row.get(7)?;
        Ok((msg, (-rank) as f32))
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn get_conversation(
    conn: &Connection,
    user_id: &str,
    channel_id: Option<&str>,
    limit: usize,
) -> SqlResult<Vec<ConversationMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, channel_id, question, answer, embedding, created_at
         FROM conversations
         WHERE user_id = ?1 AND (?2 IS NULL OR channel_id = ?2)
         ORDER BY created_at DESC LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![user_id, channel_id, limit], row_to_conversation)?;
    let mut v: Vec<_> = rows.filter_map(|r| r.ok()).collect();
    v.reverse();
    Ok(v)
}

pub fn get_recent_conversation(
    conn: &Connection,
    user_id: &str,
    channel_id: Option<&str>,
) -> SqlResult<Option<ConversationMessage>> {
    conn.query_row(
        "SELECT id, user_id, channel_id, question, answer, embedding, created_at
         FROM conversations
         WHERE user_id = ?1 AND (?2 IS NULL OR channel_id = ?2)
         ORDER BY created_at DESC LIMIT 1",
        params![user_id, channel_id],
        row_to_conversation,
    )
    .optional()
}

pub fn conversation_stats(conn: &Connection, user_id: &str) -> SqlResult<(u64, Vec<String>, Option<String>, Option<String>)> {
    let total: u64 = conn.query_row(
        "SELECT COUNT(*) FROM conversations WHERE user_id = ?1",
        params![user_id],
        |r| r.get(0),
    )?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT channel_id FROM conversations WHERE user_id = ?1 AND channel_id IS NOT NULL",
    )?;
    let channels: Vec<String> = stmt
        .query_map(params![user_id], |r| r.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    let first: Option<String> = conn
        .query_row(
            "SELECT MIN(created_at) FROM conversations WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    let last: Option<String> = conn
        .query_row(
            "SELECT MAX(created_at) FROM conversations WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    Ok((total, channels, first, last))
}

pub fn clear_conversation(conn: &Connection, user_id: &str, channel_id: Option<&str>) -> SqlResult<u64> {
    let ids: Vec<i64> = conn
        .prepare("SELECT id FROM conversations WHERE user_id = ?1 AND (?2 IS NULL OR channel_id = ?2)")?
        .query_map(params![user_id, channel_id], |r| r.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    for id in &ids {
        conn.execute(
            "INSERT INTO conversations_fts(conversations_fts, rowid, question, answer) VALUES ('delete', ?1, '', '')",
            params![id],
        )
        .ok();
    }
    let n = conn.execute(
        "DELETE FROM conversations WHERE user_id = ?1 AND (?2 IS NULL OR channel_id = ?2)",
        params![user_id, channel_id],
    )?;
    Ok(n as u64)
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationMessage> {
    let embedding: Option<Vec<u8>> = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(ConversationMessage {
        id: row.get(0)?,
        user_id: row.get(1)?,
        channel_id: row.get(2)?,
        question: row.get(3)?,
        answer: row.get(4)?,
        embedding: embedding.map(|b| decode_vec(&b)),
        created_at: created_at.parse().unwrap_or_else(|_| chrono::Utc::now()),
    })
}

fn encode_vec(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
