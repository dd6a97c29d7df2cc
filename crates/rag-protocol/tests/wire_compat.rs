// Verify wire format matches what the chat-client front end expects.

use rag_protocol::frames::{parse_request, ResponseFrame};
use rag_protocol::query::{QueryOutcome, QueryParams, SourceMemory, Timing, ToolCallRecord};

#[test]
fn request_frame_round_trip() {
    let line = r#"{"id":"abc-123","method":"query","params":{"question":"hi"}}"#;
    let req = parse_request(line).unwrap();
    assert_eq!(req.id, "abc-123");
    assert_eq!(req.method, "query");
    assert!(req.params.is_some());
}

#[test]
fn invalid_json_has_empty_id_and_null_result() {
    let err = parse_request("not json").unwrap_err();
    let json = serde_json::to_string(&err).unwrap();
    assert!(json.contains(r#""result":null"#));
    assert!(json.contains("Invalid JSON"));
}

#[test]
fn response_ok_omits_error_field_value() {
    let res = ResponseFrame::ok("1", serde_json::json!({"pong": true}));
    assert!(res.error.is_none());
    let json = serde_json::to_string(&res).unwrap();
    assert!(json.contains(r#""error":null"#));
}

#[test]
fn query_params_defaults() {
    let json = r#"{"question":"hi there"}"#;
    let params: QueryParams = serde_json::from_str(json).unwrap();
    assert_eq!(params.top_k, 10);
    assert!((params.temperature - 0.7).abs() < f32::EPSILON);
    assert_eq!(params.max_tokens, 600);
    assert!(params.use_memory);
    assert!(params.doc_id.is_none());
}

#[test]
fn casual_outcome_flattens_to_chat_routing() {
    let outcome = QueryOutcome::Casual {
        answer: "hey!".to_string(),
        timing: Timing::default(),
    };
    let wire = outcome.into_wire("hi there".to_string());
    assert!(wire.is_casual_conversation);
    assert_eq!(wire.service_routing, "chat");
    assert_eq!(wire.context_chunks, 0);
    assert!(wire.source_documents.is_empty());
}

#[test]
fn rag_outcome_carries_tool_calls_and_sources() {
    let outcome = QueryOutcome::RagAnswer {
        answer: "the doc says X".to_string(),
        context_chunks: 3,
        memories_used: 0,
        source_documents: vec!["alpha.pdf".to_string()],
        source_memories: vec![SourceMemory {
            memory_type: "user_message".to_string(),
            preview: "earlier...".to_string(),
        }],
        routing: "rag".to_string(),
        tool_calls: vec![ToolCallRecord {
            tool: "add".to_string(),
            arguments: serde_json::json!({"a": 1, "b": 1}),
            success: true,
            result_preview: "2".to_string(),
        }],
        timing: Timing::default(),
    };
    let wire = outcome.into_wire("summarize".to_string());
    assert_eq!(wire.context_chunks, 3);
    assert_eq!(wire.source_documents, vec!["alpha.pdf".to_string()]);
    assert_eq!(wire.tool_calls.len(), 1);
    assert!(!wire.is_casual_conversation);
}
