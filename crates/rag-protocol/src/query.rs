//! `query` method params/result, and the internal tagged-union result type
//! that the orchestrator produces before it's flattened onto the wire.
//!
//! Design Note (duck-typed response shapes → explicit tagged union):
//! the source returns ad-hoc dicts with whatever fields happened to apply
//! to the branch that fired. `QueryOutcome` makes each branch's fields
//! explicit and exhaustive; `to_wire()` flattens whichever variant fired
//! into the one observable `QueryResult` shape clients actually receive.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_top_k() -> usize {
    10
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    600
}
fn default_max_context_tokens() -> u32 {
    1500
}
fn bool_true() -> bool {
    true
}

/// Params for the `query` wire method. See spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParams {
    pub question: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
    #[serde(default = "bool_true")]
    pub use_memory: bool,
    #[serde(default = "bool_true")]
    pub use_shared_docs: bool,
    #[serde(default = "bool_true")]
    pub use_hybrid_search: bool,
    #[serde(default = "bool_true")]
    pub use_query_expansion: bool,
    #[serde(default = "bool_true")]
    pub use_temporal_weighting: bool,
    pub doc_id: Option<String>,
    pub doc_filename: Option<String>,
    pub mentioned_user_id: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Timing {
    pub retrieval_ms: u64,
    pub generation_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMemory {
    #[serde(rename = "type")]
    pub memory_type: String,
    pub preview: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    pub arguments: serde_json::Value,
    pub success: bool,
    pub result_preview: String,
}

/// The flat wire shape of a `query` result. Every `QueryOutcome` variant
/// flattens onto this.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueryResult {
    pub answer: String,
    pub context_chunks: usize,
    pub memories_used: usize,
    pub question: String,
    pub source_documents: Vec<String>,
    pub source_memories: Vec<SourceMemory>,
    pub timing: Timing,
    pub is_casual_conversation: bool,
    pub service_routing: String,
    pub tool_calls: Vec<ToolCallRecord>,
    /// `true` when an inventory/currency action was parsed and executed.
    #[serde(default, skip_serializing_if = "is_false")]
    pub action_processed: bool,
    /// `true` when the state-query handler produced the answer directly.
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_state_query: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Internal tagged union the orchestrator actually builds (Design Note:
/// "Replace with explicit tagged-union result types"). Each variant
/// carries exactly the fields its branch produces; `into_wire` is the one
/// place that knows how to flatten them onto `QueryResult`.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Casual {
        answer: String,
        timing: Timing,
    },
    StateAnswer {
        answer: String,
        timing: Timing,
    },
    ActionConfirmation {
        answer: String,
        timing: Timing,
    },
    RagAnswer {
        answer: String,
        context_chunks: usize,
        memories_used: usize,
        source_documents: Vec<String>,
        source_memories: Vec<SourceMemory>,
        routing: String,
        tool_calls: Vec<ToolCallRecord>,
        timing: Timing,
    },
}

impl QueryOutcome {
    pub fn into_wire(self, question: String) -> QueryResult {
        match self {
            QueryOutcome::Casual { answer, timing } => QueryResult {
                answer,
                question,
                timing,
                is_casual_conversation: true,
                service_routing: "chat".to_string(),
                ..Default::default()
            },
            QueryOutcome::StateAnswer { answer, timing } => QueryResult {
                answer,
                question,
                timing,
                service_routing: "state".to_string(),
                is_state_query: true,
                ..Default::default()
            },
            QueryOutcome::ActionConfirmation { answer, timing } => QueryResult {
                answer,
                question,
                timing,
                service_routing: "action".to_string(),
                action_processed: true,
                ..Default::default()
            },
            QueryOutcome::RagAnswer {
                answer,
                context_chunks,
                memories_used,
                source_documents,
                source_memories,
                routing,
                tool_calls,
                timing,
            } => QueryResult {
                answer,
                context_chunks,
                memories_used,
                question,
                source_documents,
                source_memories,
                timing,
                service_routing: routing,
                tool_calls,
                ..Default::default()
            },
        }
    }
}

/// `POST /classify_intent`, `POST /route_message` companion payloads —
/// same shapes, smaller surface than the full query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyIntentResponse {
    pub intent: String,
    pub routing: String,
    pub confidence: f32,
    pub needs_rag: bool,
    pub needs_tools: bool,
    pub needs_memory: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub uptime_seconds: u64,
    pub queries_total: u64,
    pub cache_hits: HashMap<String, u64>,
    pub cache_misses: HashMap<String, u64>,
}
