//! Tool executor — the generation loop that lets the completion model call
//! tools. Follows an iterate-until-no-tool-calls structure, adapted to
//! this system's synthetic-JSON convention (the model emits
//! `{"tool": "...", "arguments": {...}}` in plain text rather than a
//! provider-native tool-call field — though `complete_with_tools` is
//! checked first in case the backend does return structured calls).

use std::time::Duration;

use rag_completion::client::{ChatResponse, ToolSchema};
use rag_completion::{CompletionClient, CompletionError, Message, Role};
use rag_protocol::query::ToolCallRecord;
use serde_json::json;
use tracing::debug;

use crate::registry::ToolRegistry;

/// Tool-loop iteration cap (spec §5: "tool-loop iterations ≤ 3").
pub const MAX_ITERATIONS: usize = 3;
/// Tool schemas advertised per prompt (spec §5: "prompt tools advertised ≤ 10").
pub const MAX_PROMPT_TOOLS: usize = 10;
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(5);

/// One parsed tool invocation, whether it came from the provider's native
/// `tool_calls` field or from text the model emitted directly.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Ambient values auto-injected into a call's arguments when its schema
/// declares them but the model omitted them (spec §4.13 step 1).
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub user_id: Option<String>,
    pub channel_id: Option<String>,
}

/// `parse_tool_calls(model_text) -> [call]` (spec §4.13): scans for fenced
/// or bare JSON objects carrying a `tool` or `name` field. Fence markers
/// are irrelevant to the scan itself — balanced-brace extraction finds the
/// object whether or not it's wrapped in ```` ```json ... ``` ````.
pub fn parse_tool_calls(model_text: &str) -> Vec<ToolCall> {
    extract_json_objects(model_text)
        .iter()
        .filter_map(|candidate| serde_json::from_str::<serde_json::Value>(candidate).ok())
        .filter_map(|value| {
            let obj = value.as_object()?;
            let name = obj.get("tool").or_else(|| obj.get("name"))?.as_str()?.to_string();
            let arguments = obj.get("arguments").or_else(|| obj.get("parameters")).cloned().unwrap_or_else(|| json!({}));
            let id = obj.get("id").and_then(|v| v.as_str()).map(str::to_string);
            Some(ToolCall { id, name, arguments })
        })
        .collect()
}

fn extract_json_objects(text: &str) -> Vec<String> {
    let mut objects = Vec::new();
    let mut depth = 0i32;
    let mut start = None;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        objects.push(text[s..=i].to_string());
                    }
                } else if depth < 0 {
                    depth = 0;
                }
            }
            _ => {}
        }
    }
    objects
}

/// If a call's target schema declares `user_id`/`channel_id` parameters
/// and the model didn't supply them, fill them in from the live request
/// context rather than trusting (or requiring) the model to know them.
pub fn inject_ambient_context(schemas: &[ToolSchema], call: &mut ToolCall, ctx: &ToolContext) {
    let Some(schema) = schemas.iter().find(|s| s.name == call.name) else { return };
    let Some(properties) = schema.parameters.get("properties").and_then(|p| p.as_object()) else { return };
    let Some(obj) = call.arguments.as_object_mut() else { return };

    if properties.contains_key("user_id") && !obj.contains_key("user_id") {
        if let Some(uid) = &ctx.user_id {
            obj.insert("user_id".to_string(), json!(uid));
        }
    }
    if properties.contains_key("channel_id") && !obj.contains_key("channel_id") {
        if let Some(cid) = &ctx.channel_id {
            obj.insert("channel_id".to_string(), json!(cid));
        }
    }
}

fn native_or_text_calls(response: &ChatResponse) -> Vec<ToolCall> {
    if !response.tool_calls.is_empty() {
        response
            .tool_calls
            .iter()
            .map(|c| ToolCall { id: Some(c.id.clone()), name: c.name.clone(), arguments: c.arguments.clone() })
            .collect()
    } else {
        parse_tool_calls(&response.content)
    }
}

fn result_preview(result: &serde_json::Value) -> String {
    let rendered = result.to_string();
    if rendered.len() > 200 {
        format!("{}…", &rendered[..200])
    } else {
        rendered
    }
}

fn result_succeeded(result: &serde_json::Value) -> bool {
    result.get("success").and_then(|v| v.as_bool()).unwrap_or(true)
}

/// Run the tool loop: call with tool schemas attached, execute any calls
/// the model emits, feed results back as a synthetic user turn, repeat up
/// to `MAX_ITERATIONS` (spec §4.13 steps 2-4). Returns the model's final
/// text and a record of every tool call made, for the result envelope.
pub async fn run_tool_loop(
    completion: &CompletionClient,
    registry: &ToolRegistry,
    mut messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
    ctx: &ToolContext,
) -> Result<(String, Vec<ToolCallRecord>), CompletionError> {
    let mut schemas = ToolRegistry::meta_tool_schemas();
    schemas.extend(registry.registered_tool_schemas());
    schemas.truncate(MAX_PROMPT_TOOLS);

    let mut records = Vec::new();
    let mut last_text = String::new();

    for iteration in 0..MAX_ITERATIONS {
        let response = completion.complete_with_tools(&messages, temperature, max_tokens, &schemas).await?;
        last_text = response.content.clone();

        let mut calls = native_or_text_calls(&response);
        if calls.is_empty() {
            debug!(iteration, "tool loop complete, no further calls");
            return Ok((response.content, records));
        }

        messages.push(Message { role: Role::Assistant, content: response.content.clone() });

        let mut summaries = Vec::with_capacity(calls.len());
        for call in calls.iter_mut() {
            inject_ambient_context(&schemas, call, ctx);
            let result = registry.dispatch(&call.name, &call.arguments).await;
            let success = result_succeeded(&result);
            let preview = result_preview(&result);
            records.push(ToolCallRecord {
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
                success,
                result_preview: preview.clone(),
            });
            summaries.push(format!("{}: {}", call.name, preview));
        }

        messages.push(Message {
            role: Role::User,
            content: format!("Tool results:\n{}", summaries.join("\n")),
        });
    }

    debug!(max_iterations = MAX_ITERATIONS, "tool loop hit iteration cap");
    Ok((last_text, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tool_calls_reads_bare_json() {
        let text = r#"I'll use a tool: {"tool": "add", "arguments": {"a": 1, "b": 1}}"#;
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "add");
        assert_eq!(calls[0].arguments, json!({"a": 1, "b": 1}));
    }

    #[test]
    fn parse_tool_calls_reads_fenced_json() {
        let text = "Let me call it.\n```json\n{\"tool\": \"add\", \"arguments\": {\"a\": 2, \"b\": 2}}\n```";
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "add");
    }

    #[test]
    fn parse_tool_calls_accepts_name_key_as_alias_for_tool() {
        let text = r#"{"name": "lookup", "parameters": {"q": "x"}}"#;
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "lookup");
        assert_eq!(calls[0].arguments, json!({"q": "x"}));
    }

    #[test]
    fn parse_tool_calls_ignores_objects_without_tool_or_name() {
        let text = r#"here is some data: {"a": 1, "b": 2}"#;
        assert!(parse_tool_calls(text).is_empty());
    }

    #[test]
    fn ambient_context_injected_only_when_schema_declares_it_and_model_omitted_it() {
        let schemas = vec![ToolSchema {
            name: "send_message".to_string(),
            description: "d".to_string(),
            parameters: json!({"type": "object", "properties": {"user_id": {"type": "string"}, "text": {"type": "string"}}}),
        }];
        let ctx = ToolContext { user_id: Some("u1".to_string()), channel_id: None };
        let mut call = ToolCall { id: None, name: "send_message".to_string(), arguments: json!({"text": "hi"}) };
        inject_ambient_context(&schemas, &mut call, &ctx);
        assert_eq!(call.arguments["user_id"], json!("u1"));

        let mut call_with_id = ToolCall { id: None, name: "send_message".to_string(), arguments: json!({"text": "hi", "user_id": "explicit"}) };
        inject_ambient_context(&schemas, &mut call_with_id, &ctx);
        assert_eq!(call_with_id.arguments["user_id"], json!("explicit"), "model-supplied value must not be overwritten");
    }
}
