use thiserror::Error;

/// Core error taxonomy shared by every component of the query pipeline.
///
/// These are *kinds*, not wrappers around specific backends — each module
/// maps its own failures onto one of these before they cross a component
/// boundary, so the orchestrator can apply one consistent propagation
/// policy (degrade gracefully vs. fail the query) instead of matching on
/// a dozen per-crate error enums.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Empty question, malformed JSON, schema violation. Surfaced to the
    /// caller immediately.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Vector/graph index or completion service unreachable. Evidence-gathering
    /// paths degrade silently (empty list); generation paths surface this.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Per-branch deadline exceeded.
    #[error("operation timed out after {ms}ms: {what}")]
    Timeout { ms: u64, what: String },

    /// Sandbox validation refused, or execution hit a deny-listed construct.
    /// Never surfaced to the model as executable output.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// Transfer refused because source balance is insufficient, or a
    /// state-set value fails its type check.
    #[error("inconsistent state: {0}")]
    Inconsistency(String),

    /// Analyzer or action-parser JSON was unparseable; caller should fall
    /// back to the rule-based path rather than propagate.
    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short error code sent to clients in wire-protocol error fields.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "INVALID_INPUT",
            CoreError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            CoreError::Timeout { .. } => "TIMEOUT",
            CoreError::SecurityViolation(_) => "SECURITY_VIOLATION",
            CoreError::Inconsistency(_) => "INCONSISTENCY",
            CoreError::ParseFailure(_) => "PARSE_FAILURE",
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::Database(_) => "DATABASE_ERROR",
            CoreError::Serialization(_) => "SERIALIZATION_ERROR",
            CoreError::Io(_) => "IO_ERROR",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error kind should degrade silently (empty evidence)
    /// rather than propagate to the caller, per the evidence-gathering
    /// propagation policy.
    pub fn degrades_silently(&self) -> bool {
        matches!(
            self,
            CoreError::BackendUnavailable(_) | CoreError::Timeout { .. }
        )
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
