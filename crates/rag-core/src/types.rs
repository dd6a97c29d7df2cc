//! Shared data model types. See `[DATA MODEL]`.
//!
//! These types cross every component boundary in the pipeline, so they live
//! in `rag-core` rather than in whichever crate happens to create them first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable identifier for an uploaded document.
pub type DocId = String;

/// An uploaded unit of text. Owned by the store; created by the ingestion
/// collaborator (out of scope here); destroyed only by explicit delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: DocId,
    pub file_name: String,
    pub file_type: String,
    pub uploaded_by: String,
    pub uploaded_at: DateTime<Utc>,
    pub chunk_count: u32,
}

/// `chunk_id = (doc_id, chunk_index)` — stable, and the ordering key within
/// a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub doc_id: DocId,
    pub chunk_index: u32,
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.doc_id, self.chunk_index)
    }
}

/// A contiguous text span of a document. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub text: String,
    pub embedding: Vec<f32>,
    pub uploaded_by: String,
    pub file_name: String,
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// A scored retrieval result, carrying enough provenance for the result
/// envelope without a second round-trip to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk_id: ChunkId,
    pub text: String,
    pub score: f32,
    pub doc_id: DocId,
    pub file_name: String,
    pub chunk_index: u32,
    pub uploaded_by: String,
    /// Present when the backend returns it inline; absent otherwise (the
    /// caller can still diversify on text overlap). MMR (spec §4.6.6)
    /// uses this when available for cosine-distance diversification.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Mirrors `Chunk::uploaded_at` — carried through so temporal
    /// reweighting (spec §4.6.5) doesn't need a second round-trip to the
    /// store just to learn a document's age.
    #[serde(default)]
    pub uploaded_at: Option<DateTime<Utc>>,
}

/// Tag distinguishing what produced a conversational memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    UserMessage,
    BotResponse,
    Action,
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryType::UserMessage => write!(f, "user_message"),
            MemoryType::BotResponse => write!(f, "bot_response"),
            MemoryType::Action => write!(f, "action"),
        }
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_message" => Ok(Self::UserMessage),
            "bot_response" => Ok(Self::BotResponse),
            "action" => Ok(Self::Action),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

/// A conversational utterance preserved for later retrieval, keyed by
/// channel. Destroyed only by explicit channel clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub channel_id: String,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub memory_type: MemoryType,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub mentioned_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// In [0, 1].
    pub importance: f32,
}

/// A scored memory as returned from retrieval, with the recency/temporal
/// boost already folded into `score`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f32,
}

/// A (question, answer) pair keyed by user and optionally channel, used
/// for semantic continuity across turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: i64,
    pub user_id: String,
    pub channel_id: Option<String>,
    pub question: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
    pub embedding: Option<Vec<f32>>,
}

/// One of multiple addressable identities under a single user id, selected
/// by message content and channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub persona_id: String,
    pub user_id: String,
    pub display_name: String,
    pub channel_id: Option<String>,
}

/// A user id with a display name, inferred interests and preferences, and
/// zero or more personas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: String,
    pub interests: Vec<String>,
    pub preferences: HashMap<String, String>,
    pub personas: Vec<Persona>,
}

/// The value held at a state entry — either a flat number (gold, level) or
/// a nested inventory map. Numeric keys participate in the ledger's
/// transfer conservation invariant; map keys do not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StateValue {
    Number(f64),
    Inventory(HashMap<String, f64>),
}

impl StateValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            StateValue::Number(n) => Some(*n),
            StateValue::Inventory(_) => None,
        }
    }
}

/// A mapping `(user_id, key) -> value`. At most one entry exists per key
/// per user (`[I-UNIQUE-ENTRY]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub user_id: String,
    pub key: String,
    pub value: StateValue,
    pub updated_at: DateTime<Utc>,
}

/// Audit tuple recorded on every ledger write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub channel: Option<String>,
    pub reason: String,
}

/// A model-normalized item name, owner id, quantity, and arbitrary
/// property map. The canonical key is the normalized name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedItem {
    pub owner_id: String,
    pub canonical_name: String,
    pub quantity: f64,
    pub item_type: String,
    pub properties: HashMap<String, serde_json::Value>,
}

/// Name, description, JSON-schema parameters, source, test results, usage
/// counter, and registration state of a model-authored tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub source: String,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub usage_count: u64,
    pub registered: bool,
    pub created_at: DateTime<Utc>,
}

/// A chat-completion message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in an ordered completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}
