pub mod analyzer;
pub mod types;

pub use analyzer::QueryAnalyzer;
pub use types::{AnalysisResult, AnalyzerContext, Complexity, Intent, QuestionType, Routing};
