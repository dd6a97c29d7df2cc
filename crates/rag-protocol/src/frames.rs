use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → Server request, one per line of the newline-delimited stream.
/// Wire: `{ "id": "abc", "method": "query", "params": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Server → Client reply. `error` is `null` on success; `result` is `null`
/// on failure. Exactly one of the two carries data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, result: impl Serialize) -> Self {
        Self {
            id: id.into(),
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(message.into()),
        }
    }

    /// The `{result:null, error:"Invalid JSON: …"}` shape for a line that
    /// couldn't even be parsed as a `RequestFrame` — there's no `id` to
    /// echo back, so it's replaced with an empty string.
    pub fn invalid_json(detail: impl std::fmt::Display) -> Self {
        Self {
            id: String::new(),
            result: None,
            error: Some(format!("Invalid JSON: {detail}")),
        }
    }
}

/// Parse one line of the inbound stream into a request frame, producing
/// the wire-shaped error response directly on failure so callers never
/// need to construct that message twice.
pub fn parse_request(line: &str) -> Result<RequestFrame, ResponseFrame> {
    serde_json::from_str(line).map_err(ResponseFrame::invalid_json)
}
