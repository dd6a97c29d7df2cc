//! Conversation-store CRUD method params/results (spec §6): `add_conversation`,
//! `get_conversation`, `get_recent_conversation`, `get_conversation_stats`,
//! `get_relevant_conversations`, `clear_conversation`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddConversationParams {
    pub user_id: String,
    pub channel_id: Option<String>,
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddConversationResult {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConversationParams {
    pub user_id: String,
    pub channel_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub id: i64,
    pub question: String,
    pub answer: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConversationResult {
    pub entries: Vec<ConversationEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRecentConversationParams {
    pub user_id: String,
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRecentConversationResult {
    pub entry: Option<ConversationEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStatsParams {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationStatsResult {
    pub total_turns: u64,
    pub channels: Vec<String>,
    pub first_turn_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_turn_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRelevantConversationsParams {
    pub user_id: String,
    pub query: String,
    #[serde(default = "default_relevant_k")]
    pub k: usize,
}

fn default_relevant_k() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredConversationEntry {
    pub entry: ConversationEntry,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRelevantConversationsResult {
    pub entries: Vec<ScoredConversationEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearConversationParams {
    pub user_id: String,
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearConversationResult {
    pub cleared: u64,
}
