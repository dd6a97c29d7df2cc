//! Tool sandbox. Validation and execution of model-authored tool source.
//!
//! Grounded on `original_source/src/tools/tool_sandbox.py`'s `ToolSandbox`:
//! a textual deny-list scan (`FORBIDDEN_IMPORTS`/`FORBIDDEN_FUNCTIONS`/
//! `FORBIDDEN_PATTERNS`) runs before anything is parsed, mirroring the
//! python original's pattern-then-AST ordering. The execution half differs
//! by necessity — there is no `exec()` equivalent we'd want to touch in
//! Rust — so untrusted source here is a `rhai` script run in an engine
//! built with none of rhai's I/O, process, or module-loading surface
//! registered, which is the deny-list's structural enforcement rather than
//! its textual one.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use rhai::{Dynamic, Engine, Scope, AST};
use serde::{Deserialize, Serialize};

/// Names a tool body must not reference, whether as a function call, a
/// bare identifier, or (for the handful that look like module paths) a
/// dotted access. Ported from `FORBIDDEN_IMPORTS`/`FORBIDDEN_FUNCTIONS` —
/// rhai has no filesystem, process, or socket access in its standard
/// library, so these exist purely as a belt-and-suspenders textual check.
const FORBIDDEN_NAMES: &[&str] = &[
    "eval", "import", "export", "exec", "system", "command", "spawn", "process", "shell",
    "open", "read_file", "write_file", "delete_file", "remove_file", "fs", "os", "sys",
    "subprocess", "socket", "http_get", "http_post", "network", "env", "getenv",
];

fn forbidden_pattern_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let alternation = FORBIDDEN_NAMES.join("|");
        Regex::new(&format!(r"(?i)\b({alternation})\b")).unwrap()
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// `validate(source) -> {valid, errors}` (spec §4.14). Runs the deny-list
/// scan first, then a real parse, so a source that merely *mentions* a
/// forbidden word in a comment still gets a parse error surfaced alongside
/// (both failure modes are collected, not short-circuited).
pub fn validate(source: &str) -> ValidationResult {
    let mut errors = Vec::new();

    for m in forbidden_pattern_re().find_iter(source) {
        errors.push(format!("forbidden identifier: {}", m.as_str()));
    }
    errors.sort();
    errors.dedup();

    let engine = build_engine();
    if let Err(e) = engine.compile(source) {
        errors.push(format!("syntax error: {e}"));
    }

    ValidationResult { valid: errors.is_empty(), errors }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub ms: u64,
}

/// `execute(source, fn_name, args, timeout) -> {success, result, error, ms}`.
/// Arguments are matched to the script function's declared parameter names
/// (rhai has no keyword-argument call form), mirroring the python
/// original's `func(**arguments)`.
pub async fn execute(source: &str, fn_name: &str, args: serde_json::Value, timeout: Duration) -> ExecutionOutcome {
    let validation = validate(source);
    if !validation.valid {
        return ExecutionOutcome {
            success: false,
            result: None,
            error: Some(format!("code validation failed: {}", validation.errors.join(", "))),
            ms: 0,
        };
    }

    let source = source.to_string();
    let fn_name = fn_name.to_string();
    let started = Instant::now();

    let outcome = tokio::task::spawn_blocking(move || run_in_engine(&source, &fn_name, args, timeout)).await;

    match outcome {
        Ok(o) => o,
        Err(e) => ExecutionOutcome {
            success: false,
            error: Some(format!("sandbox task panicked: {e}")),
            result: None,
            ms: started.elapsed().as_millis() as u64,
        },
    }
}

fn run_in_engine(source: &str, fn_name: &str, args: serde_json::Value, timeout: Duration) -> ExecutionOutcome {
    let started = Instant::now();
    let mut engine = build_engine();
    let deadline = started + timeout;
    engine.on_progress(move |_ops| if Instant::now() > deadline { Some(Dynamic::UNIT) } else { None });

    let ast = match engine.compile(source) {
        Ok(ast) => ast,
        Err(e) => {
            return ExecutionOutcome {
                success: false,
                result: None,
                error: Some(format!("compile error: {e}")),
                ms: started.elapsed().as_millis() as u64,
            }
        }
    };

    let call_args = match build_call_args(&ast, fn_name, &args) {
        Ok(a) => a,
        Err(e) => {
            return ExecutionOutcome {
                success: false,
                result: None,
                error: Some(e),
                ms: started.elapsed().as_millis() as u64,
            }
        }
    };

    let mut scope = Scope::new();
    let result: Result<Dynamic, _> = engine.call_fn(&mut scope, &ast, fn_name, call_args);

    let ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(value) => match rhai::serde::from_dynamic::<serde_json::Value>(&value) {
            Ok(json) => ExecutionOutcome { success: true, result: Some(json), error: None, ms },
            Err(e) => ExecutionOutcome { success: false, result: None, error: Some(format!("result conversion failed: {e}")), ms },
        },
        Err(e) => ExecutionOutcome { success: false, result: None, error: Some(e.to_string()), ms },
    }
}

fn build_call_args(ast: &AST, fn_name: &str, args: &serde_json::Value) -> Result<Vec<Dynamic>, String> {
    let meta = ast
        .iter_functions()
        .find(|f| f.name == fn_name)
        .ok_or_else(|| format!("function '{fn_name}' not found in code"))?;

    let obj = args.as_object();
    meta.params
        .iter()
        .map(|param| {
            let value = obj.and_then(|o| o.get(*param)).cloned().unwrap_or(serde_json::Value::Null);
            rhai::serde::to_dynamic(&value).map_err(|e| format!("argument '{param}' conversion failed: {e}"))
        })
        .collect()
}

/// A restricted engine: no filesystem, process, or network access is ever
/// registered (rhai's default build has none of that surface to begin
/// with), `eval`/`import` are explicitly disabled, and resource limits
/// bound runaway scripts that don't hit the wall-clock deadline first.
fn build_engine() -> Engine {
    let mut engine = Engine::new();
    engine.disable_symbol("eval");
    engine.disable_symbol("import");
    engine.set_max_operations(2_000_000);
    engine.set_max_call_levels(32);
    engine.set_max_expr_depths(64, 64);
    engine.set_max_string_size(64 * 1024);
    engine.set_max_array_size(10_000);
    engine.set_max_map_size(10_000);
    engine
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub expected_result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub arguments: serde_json::Value,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    pub total: usize,
    pub passed: u32,
    pub failed: u32,
    pub per_case: Vec<TestCaseResult>,
}

/// `test(source, fn_name, cases) -> {passed, failed, per_case}`. A case
/// passes if execution succeeds and, when `expected_result` is given,
/// the result matches it exactly; with no expectation, success alone is
/// enough (spec §4.14, ported from `ToolSandbox.test_tool`).
pub async fn test(source: &str, fn_name: &str, cases: &[TestCase]) -> TestOutcome {
    let mut per_case = Vec::with_capacity(cases.len());
    let mut passed = 0u32;
    let mut failed = 0u32;

    for case in cases {
        let outcome = execute(source, fn_name, case.arguments.clone(), Duration::from_secs(5)).await;
        let case_passed = outcome.success
            && match &case.expected_result {
                Some(expected) => outcome.result.as_ref() == Some(expected),
                None => true,
            };
        if case_passed {
            passed += 1;
        } else {
            failed += 1;
        }
        per_case.push(TestCaseResult {
            arguments: case.arguments.clone(),
            success: outcome.success,
            result: outcome.result,
            error: outcome.error,
            passed: case_passed,
            expected: case.expected_result.clone(),
        });
    }

    TestOutcome { total: cases.len(), passed, failed, per_case }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_flags_forbidden_identifiers() {
        let result = validate("fn f() {\n  eval(\"1+1\")\n}");
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("eval")));
    }

    #[test]
    fn validate_flags_os_reference() {
        let result = validate("fn f() {\n  os::system(\"x\")\n}");
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.to_lowercase().contains("os")));
    }

    #[test]
    fn validate_accepts_clean_code() {
        let result = validate("fn add(a, b) {\n  a + b\n}");
        assert!(result.valid, "errors: {:?}", result.errors);
    }

    #[tokio::test]
    async fn execute_runs_simple_function_and_matches_args_by_name() {
        let outcome = execute(
            "fn add(a, b) { a + b }",
            "add",
            serde_json::json!({"a": 2, "b": 3}),
            Duration::from_secs(1),
        )
        .await;
        assert!(outcome.success, "error: {:?}", outcome.error);
        assert_eq!(outcome.result, Some(serde_json::json!(5)));
    }

    #[tokio::test]
    async fn execute_rejects_forbidden_source() {
        let outcome = execute(
            "fn f() {\n  os::system(\"x\")\n}",
            "f",
            serde_json::json!({}),
            Duration::from_secs(1),
        )
        .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().to_lowercase().contains("os"));
    }

    #[tokio::test]
    async fn test_tool_reports_passed_and_failed() {
        let cases = vec![TestCase { arguments: serde_json::json!({"a": 2, "b": 3}), expected_result: Some(serde_json::json!(5)) }];
        let outcome = test("fn add(a, b) { a + b }", "add", &cases).await;
        assert_eq!(outcome.passed, 1);
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test]
    async fn test_tool_counts_mismatched_expectation_as_failed() {
        let cases = vec![TestCase { arguments: serde_json::json!({"a": 2, "b": 3}), expected_result: Some(serde_json::json!(99)) }];
        let outcome = test("fn add(a, b) { a + b }", "add", &cases).await;
        assert_eq!(outcome.passed, 0);
        assert_eq!(outcome.failed, 1);
    }
}
