pub mod executor;
pub mod registry;
pub mod sandbox;
pub mod storage;

pub use executor::{inject_ambient_context, parse_tool_calls, run_tool_loop, ToolCall, ToolContext, MAX_ITERATIONS, MAX_PROMPT_TOOLS};
pub use registry::ToolRegistry;
pub use sandbox::{test as test_tool_source, validate, ExecutionOutcome, TestCase, TestOutcome, ValidationResult};
pub use storage::{StoredTool, ToolStorage};
