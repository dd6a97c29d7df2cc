//! Context assembly: order the evidence gathered for one query into a
//! single prompt string under a hard character budget. The ordering rule
//! — user context, then important memories, then other memories, then
//! chunks, dropping the tail once the budget is spent — prioritizes the
//! evidence most likely to matter when not everything fits.

use rag_core::types::{Memory, ScoredChunk};

const CHARS_PER_TOKEN: f32 = 2.5;
const IMPORTANT_MEMORY_THRESHOLD: f32 = 0.7;

pub struct AssembledContext {
    pub text: String,
    pub chunks_used: usize,
    pub memories_used: usize,
}

enum PieceKind {
    Conversation,
    Memory,
    Chunk,
}

struct Piece {
    kind: PieceKind,
    text: String,
}

/// Build prompt context under `max_context_tokens * 2.5` characters.
/// Priority order: prior conversation turn, important memories
/// (`importance >= 0.7`), other memories, retrieved chunks — all already
/// score-ranked by their callers. Once the budget runs out the current
/// piece is truncated and everything after it is dropped; higher-priority
/// material is never displaced to make room for lower-priority material.
pub fn build_context(
    prior_turn: Option<&str>,
    memories: &[Memory],
    chunks: &[ScoredChunk],
    max_context_tokens: u32,
) -> AssembledContext {
    let max_chars = (max_context_tokens as f32 * CHARS_PER_TOKEN) as usize;

    let mut important: Vec<&Memory> = memories.iter().filter(|m| m.importance >= IMPORTANT_MEMORY_THRESHOLD).collect();
    let mut other: Vec<&Memory> = memories.iter().filter(|m| m.importance < IMPORTANT_MEMORY_THRESHOLD).collect();
    important.sort_by(|a, b| b.importance.partial_cmp(&a.importance).unwrap_or(std::cmp::Ordering::Equal));
    other.sort_by(|a, b| b.importance.partial_cmp(&a.importance).unwrap_or(std::cmp::Ordering::Equal));

    let mut pieces = Vec::new();
    if let Some(turn) = prior_turn {
        if !turn.trim().is_empty() {
            pieces.push(Piece { kind: PieceKind::Conversation, text: format!("Recent conversation:\n{turn}") });
        }
    }
    for m in important.into_iter().chain(other) {
        pieces.push(Piece { kind: PieceKind::Memory, text: format!("[memory] {}", m.content) });
    }
    for c in chunks {
        pieces.push(Piece { kind: PieceKind::Chunk, text: format!("[{}] {}", c.file_name, c.text) });
    }

    let mut text = String::new();
    let mut chunks_used = 0usize;
    let mut memories_used = 0usize;

    for piece in pieces {
        let separator = if text.is_empty() { 0 } else { 2 };
        let used = text.chars().count() + separator;
        if used >= max_chars {
            break;
        }
        let remaining = max_chars - used;
        let truncated: String = piece.text.chars().take(remaining).collect();
        let was_truncated = truncated.chars().count() < piece.text.chars().count();

        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(&truncated);

        match piece.kind {
            PieceKind::Memory => memories_used += 1,
            PieceKind::Chunk => chunks_used += 1,
            PieceKind::Conversation => {}
        }

        if was_truncated {
            break;
        }
    }

    AssembledContext { text, chunks_used, memories_used }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rag_core::types::{ChunkId, MemoryType};

    fn memory(content: &str, importance: f32) -> Memory {
        Memory {
            id: 1,
            channel_id: "c".to_string(),
            content: content.to_string(),
            embedding: None,
            memory_type: MemoryType::UserMessage,
            user_id: Some("u".to_string()),
            username: None,
            mentioned_user_id: None,
            created_at: Utc::now(),
            importance,
        }
    }

    fn chunk(text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk_id: ChunkId { doc_id: "d".to_string(), chunk_index: 0 },
            text: text.to_string(),
            score: 1.0,
            doc_id: "d".to_string(),
            file_name: "doc.txt".to_string(),
            chunk_index: 0,
            uploaded_by: "u".to_string(),
            embedding: None,
            uploaded_at: None,
        }
    }

    #[test]
    fn respects_character_budget() {
        let chunks = vec![chunk(&"x".repeat(1000))];
        let out = build_context(None, &[], &chunks, 10);
        assert!(out.text.chars().count() <= 25);
    }

    #[test]
    fn orders_conversation_before_memories_before_chunks() {
        let memories = vec![memory("important fact", 0.9), memory("minor fact", 0.1)];
        let chunks = vec![chunk("chunk text")];
        let out = build_context(Some("Q: hi A: hello"), &memories, &chunks, 1000);
        let conv_pos = out.text.find("Recent conversation").unwrap();
        let important_pos = out.text.find("important fact").unwrap();
        let minor_pos = out.text.find("minor fact").unwrap();
        let chunk_pos = out.text.find("chunk text").unwrap();
        assert!(conv_pos < important_pos);
        assert!(important_pos < minor_pos);
        assert!(minor_pos < chunk_pos);
        assert_eq!(out.memories_used, 2);
        assert_eq!(out.chunks_used, 1);
    }

    #[test]
    fn tight_budget_drops_low_priority_tail_entirely() {
        let memories = vec![memory("a".repeat(50).as_str(), 0.9)];
        let chunks = vec![chunk(&"b".repeat(50))];
        // Budget only fits the conversation line and part of the memory.
        let out = build_context(Some("short"), &memories, &chunks, 10);
        assert!(!out.text.contains('b'), "chunk material must not appear once the budget is exhausted");
    }

    #[test]
    fn empty_inputs_yield_empty_context() {
        let out = build_context(None, &[], &[], 500);
        assert_eq!(out.text, "");
        assert_eq!(out.chunks_used, 0);
        assert_eq!(out.memories_used, 0);
    }
}
