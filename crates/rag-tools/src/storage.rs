//! Tool storage — persists model-authored tools to a single JSON artifact.
//! Ported from `original_source/src/tools/tool_sandbox.py`'s `ToolStorage`:
//! create-only `store_tool`, a path-traversal guard on the storage file
//! name (`os.path.basename` there, `Path::file_name` here), and a plain
//! `usage_count` counter bumped on every successful stored-tool call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::TestOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTool {
    pub code: String,
    pub description: String,
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub test_results: Option<TestOutcome>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub registered: bool,
}

impl StoredTool {
    /// Registerable only once stored, tested, and with zero failed cases
    /// (spec §4.14, property 8).
    pub fn passes_registration_gate(&self) -> bool {
        matches!(&self.test_results, Some(r) if r.failed == 0 && r.total > 0)
    }
}

pub struct ToolStorage {
    path: PathBuf,
    tools: Mutex<HashMap<String, StoredTool>>,
}

/// Strip any directory components from a requested storage file name,
/// exactly as the python original's `os.path.basename` guard does, so a
/// caller can never point the artifact outside the working directory.
fn sanitize_storage_filename(requested: &str) -> String {
    Path::new(requested)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "tool_definitions.json".to_string())
}

impl ToolStorage {
    /// `dir` is the working directory the artifact lives in; `requested_name`
    /// is sanitized before being joined onto it.
    pub fn new(dir: impl AsRef<Path>, requested_name: &str) -> rag_core::error::Result<Self> {
        let path = dir.as_ref().join(sanitize_storage_filename(requested_name));
        let tools = Self::load(&path)?;
        Ok(Self { path, tools: Mutex::new(tools) })
    }

    fn load(path: &Path) -> rag_core::error::Result<HashMap<String, StoredTool>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&raw).map_err(rag_core::error::CoreError::Serialization)
    }

    fn save(&self, tools: &HashMap<String, StoredTool>) -> rag_core::error::Result<()> {
        let raw = serde_json::to_string_pretty(tools).map_err(rag_core::error::CoreError::Serialization)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }

    /// Create-only: returns `Ok(false)` without overwriting if the name is
    /// already stored, matching `write_tool`'s non-destructive contract.
    pub fn store_tool(
        &self,
        name: &str,
        code: &str,
        description: &str,
        parameters: serde_json::Value,
    ) -> rag_core::error::Result<bool> {
        let mut tools = self.tools.lock().unwrap();
        if tools.contains_key(name) {
            return Ok(false);
        }
        tools.insert(
            name.to_string(),
            StoredTool {
                code: code.to_string(),
                description: description.to_string(),
                parameters,
                test_results: None,
                created_at: Utc::now(),
                usage_count: 0,
                registered: false,
            },
        );
        self.save(&tools)?;
        Ok(true)
    }

    pub fn get_tool(&self, name: &str) -> Option<StoredTool> {
        self.tools.lock().unwrap().get(name).cloned()
    }

    pub fn list_tools(&self) -> Vec<(String, StoredTool)> {
        self.tools.lock().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn set_test_results(&self, name: &str, results: TestOutcome) -> rag_core::error::Result<()> {
        let mut tools = self.tools.lock().unwrap();
        if let Some(tool) = tools.get_mut(name) {
            tool.test_results = Some(results);
        }
        self.save(&tools)
    }

    /// Gated on `passes_registration_gate` by the caller (`registry::register_tool`)
    /// — this just flips the flag once that check has already passed.
    pub fn mark_registered(&self, name: &str) -> rag_core::error::Result<bool> {
        let mut tools = self.tools.lock().unwrap();
        let Some(tool) = tools.get_mut(name) else { return Ok(false) };
        if !tool.passes_registration_gate() {
            return Ok(false);
        }
        tool.registered = true;
        self.save(&tools)?;
        Ok(true)
    }

    pub fn increment_usage(&self, name: &str) -> rag_core::error::Result<()> {
        let mut tools = self.tools.lock().unwrap();
        if let Some(tool) = tools.get_mut(name) {
            tool.usage_count += 1;
        }
        self.save(&tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directory_traversal() {
        assert_eq!(sanitize_storage_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_storage_filename("/abs/path/tools.json"), "tools.json");
        assert_eq!(sanitize_storage_filename("tools.json"), "tools.json");
    }

    #[test]
    fn store_tool_is_create_only() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ToolStorage::new(dir.path(), "tools.json").unwrap();
        assert!(storage.store_tool("add", "fn add(a,b){a+b}", "adds", serde_json::json!({})).unwrap());
        assert!(!storage.store_tool("add", "fn add(a,b){a+b+1}", "adds again", serde_json::json!({})).unwrap());
        assert_eq!(storage.get_tool("add").unwrap().code, "fn add(a,b){a+b}");
    }

    #[test]
    fn registration_gate_requires_zero_failures() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ToolStorage::new(dir.path(), "tools.json").unwrap();
        storage.store_tool("add", "fn add(a,b){a+b}", "adds", serde_json::json!({})).unwrap();
        assert!(!storage.mark_registered("add").unwrap(), "untested tool must not register");

        storage
            .set_test_results(
                "add",
                TestOutcome { total: 1, passed: 0, failed: 1, per_case: vec![] },
            )
            .unwrap();
        assert!(!storage.mark_registered("add").unwrap(), "failing tests must not register");

        storage
            .set_test_results(
                "add",
                TestOutcome { total: 1, passed: 1, failed: 0, per_case: vec![] },
            )
            .unwrap();
        assert!(storage.mark_registered("add").unwrap());
        assert!(storage.get_tool("add").unwrap().registered);
    }

    #[test]
    fn storage_round_trips_through_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = ToolStorage::new(dir.path(), "tools.json").unwrap();
            storage.store_tool("add", "fn add(a,b){a+b}", "adds", serde_json::json!({})).unwrap();
        }
        let reloaded = ToolStorage::new(dir.path(), "tools.json").unwrap();
        assert!(reloaded.get_tool("add").is_some());
    }
}
