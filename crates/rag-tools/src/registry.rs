//! Meta-tools — the six operations the model uses to write, test, and
//! invoke its own tools. Ported almost directly from
//! `original_source/src/tools/meta_tools.py::create_meta_tools`: same six
//! names, same non-destructive `write_tool` contract, same
//! tested-then-zero-failures gate on `register_tool`.

use std::path::Path;
use std::time::Duration;

use rag_completion::client::ToolSchema;
use serde_json::json;
use tracing::warn;

use crate::sandbox::{self, TestCase};
use crate::storage::ToolStorage;

pub const META_TOOL_NAMES: &[&str] =
    &["write_tool", "test_tool", "register_tool", "list_stored_tools", "execute_stored_tool", "get_tool_code"];

pub struct ToolRegistry {
    storage: ToolStorage,
}

impl ToolRegistry {
    pub fn new(dir: impl AsRef<Path>, storage_file_name: &str) -> rag_core::error::Result<Self> {
        Ok(Self { storage: ToolStorage::new(dir, storage_file_name)? })
    }

    pub fn is_meta_tool(name: &str) -> bool {
        META_TOOL_NAMES.contains(&name)
    }

    pub fn meta_tool_schemas() -> Vec<ToolSchema> {
        vec![
            ToolSchema {
                name: "write_tool".to_string(),
                description: "Write a new tool. Provide rhai source defining a function. Non-destructive — only validates and stores; use test_tool before it can be registered.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "code": {"type": "string", "description": "Rhai source defining the function. Must not reference the filesystem, processes, or network."},
                        "function_name": {"type": "string", "description": "Name of the function the source defines"},
                        "description": {"type": "string", "description": "What the tool does"},
                        "parameters": {"type": "object", "description": "JSON Schema for the function's arguments"}
                    },
                    "required": ["code", "function_name", "description", "parameters"]
                }),
            },
            ToolSchema {
                name: "test_tool".to_string(),
                description: "Test a stored tool against a list of test cases, safely, in the sandbox.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "tool_name": {"type": "string"},
                        "test_cases": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {"arguments": {"type": "object"}, "expected_result": {}},
                                "required": ["arguments"]
                            }
                        }
                    },
                    "required": ["tool_name", "test_cases"]
                }),
            },
            ToolSchema {
                name: "register_tool".to_string(),
                description: "Register a tested tool so it becomes callable. Only succeeds if test_tool reported zero failures.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {"tool_name": {"type": "string"}},
                    "required": ["tool_name"]
                }),
            },
            ToolSchema {
                name: "list_stored_tools".to_string(),
                description: "List every stored tool, tested and untested, registered and not.".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ToolSchema {
                name: "execute_stored_tool".to_string(),
                description: "Execute a stored tool in the sandbox, independent of registration. Intended for manual testing.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {"tool_name": {"type": "string"}, "arguments": {"type": "object"}},
                    "required": ["tool_name", "arguments"]
                }),
            },
            ToolSchema {
                name: "get_tool_code".to_string(),
                description: "Fetch the stored source, description, and parameter schema for a tool.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {"tool_name": {"type": "string"}},
                    "required": ["tool_name"]
                }),
            },
        ]
    }

    /// Schemas for tools the model may currently invoke directly: the six
    /// meta-tools plus every stored tool that has passed registration.
    pub fn registered_tool_schemas(&self) -> Vec<ToolSchema> {
        self.storage
            .list_tools()
            .into_iter()
            .filter(|(_, tool)| tool.registered)
            .map(|(name, tool)| ToolSchema { name, description: tool.description, parameters: tool.parameters })
            .collect()
    }

    pub async fn dispatch(&self, name: &str, arguments: &serde_json::Value) -> serde_json::Value {
        match name {
            "write_tool" => self.write_tool(arguments),
            "test_tool" => self.test_tool(arguments).await,
            "register_tool" => self.register_tool(arguments),
            "list_stored_tools" => self.list_stored_tools(),
            "execute_stored_tool" => self.execute_stored_tool(arguments).await,
            "get_tool_code" => self.get_tool_code(arguments),
            _ => self.execute_registered_tool(name, arguments).await,
        }
    }

    fn write_tool(&self, arguments: &serde_json::Value) -> serde_json::Value {
        let Some(code) = arguments.get("code").and_then(|v| v.as_str()) else {
            return json!({"success": false, "error": "missing 'code'"});
        };
        let Some(function_name) = arguments.get("function_name").and_then(|v| v.as_str()) else {
            return json!({"success": false, "error": "missing 'function_name'"});
        };
        let description = arguments.get("description").and_then(|v| v.as_str()).unwrap_or_default();
        let parameters = arguments.get("parameters").cloned().unwrap_or_else(|| json!({}));

        let validation = sandbox::validate(code);
        if !validation.valid {
            return json!({
                "success": false,
                "error": format!("code validation failed: {}", validation.errors.join(", ")),
                "validation_errors": validation.errors,
            });
        }

        match self.storage.store_tool(function_name, code, description, parameters) {
            Ok(true) => json!({
                "success": true,
                "message": format!("tool '{function_name}' written and stored. Use test_tool to test it before registering."),
                "tool_name": function_name,
            }),
            Ok(false) => json!({"success": false, "error": format!("tool '{function_name}' already exists")}),
            Err(e) => json!({"success": false, "error": e.to_string()}),
        }
    }

    async fn test_tool(&self, arguments: &serde_json::Value) -> serde_json::Value {
        let Some(tool_name) = arguments.get("tool_name").and_then(|v| v.as_str()) else {
            return json!({"success": false, "error": "missing 'tool_name'"});
        };
        let Some(tool) = self.storage.get_tool(tool_name) else {
            return json!({"success": false, "error": format!("tool '{tool_name}' not found. Use write_tool to create it first.")});
        };
        let cases: Vec<TestCase> = arguments
            .get("test_cases")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let results = sandbox::test(&tool.code, tool_name, &cases).await;
        if let Err(e) = self.storage.set_test_results(tool_name, results.clone()) {
            warn!(error = %e, tool = tool_name, "failed to persist test results");
        }

        json!({"success": true, "tool_name": tool_name, "test_results": results})
    }

    fn register_tool(&self, arguments: &serde_json::Value) -> serde_json::Value {
        let Some(tool_name) = arguments.get("tool_name").and_then(|v| v.as_str()) else {
            return json!({"success": false, "error": "missing 'tool_name'"});
        };
        let Some(tool) = self.storage.get_tool(tool_name) else {
            return json!({"success": false, "error": format!("tool '{tool_name}' not found")});
        };
        let Some(results) = &tool.test_results else {
            return json!({"success": false, "error": format!("tool '{tool_name}' has not been tested. Use test_tool first.")});
        };
        if results.failed > 0 {
            return json!({
                "success": false,
                "error": format!("tool '{tool_name}' has failing tests. Fix the tool before registering."),
                "test_results": results,
            });
        }
        match self.storage.mark_registered(tool_name) {
            Ok(true) => json!({"success": true, "message": format!("tool '{tool_name}' registered and now available"), "tool_name": tool_name}),
            Ok(false) => json!({"success": false, "error": format!("tool '{tool_name}' failed the registration gate")}),
            Err(e) => json!({"success": false, "error": e.to_string()}),
        }
    }

    fn list_stored_tools(&self) -> serde_json::Value {
        let tools: Vec<_> = self
            .storage
            .list_tools()
            .into_iter()
            .map(|(name, tool)| {
                json!({
                    "name": name,
                    "description": tool.description,
                    "tested": tool.test_results.is_some(),
                    "tests_passed": tool.test_results.as_ref().map(|r| r.failed == 0),
                    "registered": tool.registered,
                    "usage_count": tool.usage_count,
                })
            })
            .collect();
        json!({"total": tools.len(), "tools": tools})
    }

    async fn execute_stored_tool(&self, arguments: &serde_json::Value) -> serde_json::Value {
        let Some(tool_name) = arguments.get("tool_name").and_then(|v| v.as_str()) else {
            return json!({"success": false, "error": "missing 'tool_name'"});
        };
        let call_args = arguments.get("arguments").cloned().unwrap_or_else(|| json!({}));
        self.run_stored(tool_name, call_args).await
    }

    fn get_tool_code(&self, arguments: &serde_json::Value) -> serde_json::Value {
        let Some(tool_name) = arguments.get("tool_name").and_then(|v| v.as_str()) else {
            return json!({"success": false, "error": "missing 'tool_name'"});
        };
        match self.storage.get_tool(tool_name) {
            Some(tool) => json!({
                "success": true,
                "tool_name": tool_name,
                "code": tool.code,
                "description": tool.description,
                "parameters": tool.parameters,
            }),
            None => json!({"success": false, "error": format!("tool '{tool_name}' not found")}),
        }
    }

    /// A registered tool invoked by name directly (not through
    /// `execute_stored_tool`) — this is the path the generation loop takes
    /// once the model starts emitting `{"tool": "<name>", ...}` for a
    /// self-authored tool (spec S6).
    async fn execute_registered_tool(&self, name: &str, arguments: &serde_json::Value) -> serde_json::Value {
        match self.storage.get_tool(name) {
            Some(tool) if tool.registered => self.run_stored(name, arguments.clone()).await,
            Some(_) => json!({"success": false, "error": format!("tool '{name}' is stored but not registered")}),
            None => json!({"success": false, "error": format!("unknown tool: {name}")}),
        }
    }

    async fn run_stored(&self, tool_name: &str, arguments: serde_json::Value) -> serde_json::Value {
        let Some(tool) = self.storage.get_tool(tool_name) else {
            return json!({"success": false, "error": format!("tool '{tool_name}' not found")});
        };
        let outcome = sandbox::execute(&tool.code, tool_name, arguments, Duration::from_secs(5)).await;
        if outcome.success {
            if let Err(e) = self.storage.increment_usage(tool_name) {
                warn!(error = %e, tool = tool_name, "failed to persist usage count");
            }
        }
        json!({"success": outcome.success, "result": outcome.result, "error": outcome.error, "ms": outcome.ms})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_tool_rejects_forbidden_source() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path(), "tools.json").unwrap();
        let result = registry
            .write_tool(&json!({
                "code": "fn f() {\n  os::system(\"x\")\n}",
                "function_name": "f",
                "description": "bad",
                "parameters": {}
            }))
            .clone();
        assert_eq!(result["success"], json!(false));
        let errors = result["validation_errors"].as_array().unwrap();
        assert!(errors.iter().any(|e| e.as_str().unwrap().to_lowercase().contains("os")));
    }

    #[tokio::test]
    async fn full_write_test_register_execute_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path(), "tools.json").unwrap();

        let written = registry.dispatch(
            "write_tool",
            &json!({"code": "fn add(a, b) { a + b }", "function_name": "add", "description": "adds two numbers", "parameters": {"type":"object","properties":{"a":{"type":"number"},"b":{"type":"number"}},"required":["a","b"]}}),
        ).await;
        assert_eq!(written["success"], json!(true));

        let tested = registry
            .dispatch("test_tool", &json!({"tool_name": "add", "test_cases": [{"arguments": {"a": 2, "b": 3}, "expected_result": 5}]}))
            .await;
        assert_eq!(tested["test_results"]["passed"], json!(1));
        assert_eq!(tested["test_results"]["failed"], json!(0));

        let registered = registry.dispatch("register_tool", &json!({"tool_name": "add"})).await;
        assert_eq!(registered["success"], json!(true));

        let invoked = registry.dispatch("add", &json!({"a": 1, "b": 1})).await;
        assert_eq!(invoked["success"], json!(true));
        assert_eq!(invoked["result"], json!(2));
    }

    #[tokio::test]
    async fn register_tool_gate_blocks_until_tests_pass() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new(dir.path(), "tools.json").unwrap();
        registry
            .dispatch("write_tool", &json!({"code": "fn add(a, b) { a + b }", "function_name": "add", "description": "d", "parameters": {}}))
            .await;

        let premature = registry.dispatch("register_tool", &json!({"tool_name": "add"})).await;
        assert_eq!(premature["success"], json!(false));

        registry
            .dispatch("test_tool", &json!({"tool_name": "add", "test_cases": [{"arguments": {"a": 1, "b": 1}, "expected_result": 3}]}))
            .await;
        let still_blocked = registry.dispatch("register_tool", &json!({"tool_name": "add"})).await;
        assert_eq!(still_blocked["success"], json!(false), "a failing test case must keep the gate closed");
    }
}
