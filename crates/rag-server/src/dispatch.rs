//! Maps one wire `{id, method, params}` request onto an `Orchestrator` call
//! and back onto a `{id, result, error}` reply (spec §6). Shared by the
//! stdio loop and, for the four methods that have an HTTP-companion
//! equivalent, by `http.rs`.

use rag_core::types::ConversationMessage;
use rag_orchestrator::Orchestrator;
use rag_protocol::conversation::{
    AddConversationParams, AddConversationResult, ClearConversationParams, ClearConversationResult,
    ConversationEntry, ConversationStatsParams, ConversationStatsResult, GetConversationParams,
    GetConversationResult, GetRecentConversationParams, GetRecentConversationResult,
    GetRelevantConversationsParams, GetRelevantConversationsResult, ScoredConversationEntry,
};
use rag_protocol::query::QueryParams;
use rag_protocol::{RequestFrame, ResponseFrame};
use serde::Serialize;
use serde_json::Value;

fn to_entry(msg: ConversationMessage) -> ConversationEntry {
    ConversationEntry { id: msg.id, question: msg.question, answer: msg.answer, created_at: msg.created_at }
}

/// Parse `params` into `T`, producing the same `{result:null, error:"..."}`
/// shape a malformed line produces, just keyed to this request's `id`.
fn parse_params<T: serde::de::DeserializeOwned>(id: &str, params: Option<Value>) -> Result<T, ResponseFrame> {
    let params = params.unwrap_or(Value::Null);
    serde_json::from_value(params).map_err(|e| ResponseFrame::err(id, format!("invalid params: {e}")))
}

fn ok<T: Serialize>(id: &str, value: T) -> ResponseFrame {
    ResponseFrame::ok(id, value)
}

/// Run one request frame against the orchestrator. Never panics: any
/// failure — bad params, a propagated `CoreError` — becomes an `error`
/// string on the reply rather than an aborted connection.
pub async fn handle(orchestrator: &Orchestrator, frame: RequestFrame) -> ResponseFrame {
    let id = frame.id.as_str();
    match frame.method.as_str() {
        "ping" => ok(id, serde_json::json!({"status": "ok"})),

        "query" => {
            let params: QueryParams = match parse_params(id, frame.params) {
                Ok(p) => p,
                Err(e) => return e,
            };
            match orchestrator.query(params).await {
                Ok(result) => ok(id, result),
                Err(e) => ResponseFrame::err(id, e.to_string()),
            }
        }

        "add_conversation" => {
            let params: AddConversationParams = match parse_params(id, frame.params) {
                Ok(p) => p,
                Err(e) => return e,
            };
            let msg = ConversationMessage {
                id: 0,
                user_id: params.user_id,
                channel_id: params.channel_id,
                question: params.question,
                answer: params.answer,
                created_at: chrono::Utc::now(),
                embedding: None,
            };
            match orchestrator.add_conversation(&msg) {
                Ok(inserted_id) => ok(id, AddConversationResult { id: inserted_id }),
                Err(e) => ResponseFrame::err(id, e.to_string()),
            }
        }

        "get_conversation" => {
            let params: GetConversationParams = match parse_params(id, frame.params) {
                Ok(p) => p,
                Err(e) => return e,
            };
            match orchestrator.get_conversation(&params.user_id, params.channel_id.as_deref(), params.limit) {
                Ok(entries) => ok(id, GetConversationResult { entries: entries.into_iter().map(to_entry).collect() }),
                Err(e) => ResponseFrame::err(id, e.to_string()),
            }
        }

        "get_recent_conversation" => {
            let params: GetRecentConversationParams = match parse_params(id, frame.params) {
                Ok(p) => p,
                Err(e) => return e,
            };
            match orchestrator.get_recent_conversation(&params.user_id, params.channel_id.as_deref()) {
                Ok(entry) => ok(id, GetRecentConversationResult { entry: entry.map(to_entry) }),
                Err(e) => ResponseFrame::err(id, e.to_string()),
            }
        }

        "get_conversation_stats" => {
            let params: ConversationStatsParams = match parse_params(id, frame.params) {
                Ok(p) => p,
                Err(e) => return e,
            };
            match orchestrator.conversation_stats(&params.user_id) {
                Ok((total_turns, channels, first_turn_at, last_turn_at)) => ok(
                    id,
                    ConversationStatsResult {
                        total_turns,
                        channels,
                        first_turn_at: first_turn_at.and_then(|s| s.parse().ok()),
                        last_turn_at: last_turn_at.and_then(|s| s.parse().ok()),
                    },
                ),
                Err(e) => ResponseFrame::err(id, e.to_string()),
            }
        }

        "get_relevant_conversations" => {
            let params: GetRelevantConversationsParams = match parse_params(id, frame.params) {
                Ok(p) => p,
                Err(e) => return e,
            };
            match orchestrator.get_relevant_conversations(&params.user_id, &params.query, params.k) {
                Ok(scored) => ok(
                    id,
                    GetRelevantConversationsResult {
                        entries: scored.into_iter().map(|(msg, score)| ScoredConversationEntry { entry: to_entry(msg), score }).collect(),
                    },
                ),
                Err(e) => ResponseFrame::err(id, e.to_string()),
            }
        }

        "clear_conversation" => {
            let params: ClearConversationParams = match parse_params(id, frame.params) {
                Ok(p) => p,
                Err(e) => return e,
            };
            match orchestrator.clear_conversation(&params.user_id, params.channel_id.as_deref()) {
                Ok(cleared) => ok(id, ClearConversationResult { cleared }),
                Err(e) => ResponseFrame::err(id, e.to_string()),
            }
        }

        other => ResponseFrame::err(id, format!("unknown method: {other}")),
    }
}
