//! Wire-ish types for the query analyzer's classification result.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Question,
    Command,
    Casual,
    Action,
    Upload,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    Rag,
    Chat,
    Tools,
    Memory,
    Action,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Factual,
    Analytical,
    Comparative,
    Procedural,
    Quantitative,
    General,
}

/// Context the caller already knows and the analyzer cannot infer from the
/// raw utterance alone (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct AnalyzerContext {
    pub has_attachments: bool,
    pub is_mentioned: bool,
    pub recent_messages: Vec<String>,
    pub previous_question: Option<String>,
    pub previous_answer: Option<String>,
}

impl AnalyzerContext {
    /// Prior-turn context present means the cache must be bypassed
    /// (routing depends on it, per spec §4.5).
    pub fn has_prior_turn(&self) -> bool {
        self.previous_question.is_some() || self.previous_answer.is_some() || !self.recent_messages.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub intent: Intent,
    pub should_respond: bool,
    pub confidence: f32,
    pub routing: Routing,
    pub needs_rag: bool,
    pub needs_tools: bool,
    pub needs_memory: bool,
    pub needs_relations: bool,
    pub is_casual: bool,
    pub complexity: Complexity,
    pub question_type: QuestionType,
    pub document_references: Vec<String>,
    pub key_concepts: Vec<String>,
}

impl AnalysisResult {
    pub fn default_rag_question() -> Self {
        Self {
            intent: Intent::Question,
            should_respond: true,
            confidence: 0.5,
            routing: Routing::Rag,
            needs_rag: true,
            needs_tools: false,
            needs_memory: false,
            needs_relations: false,
            is_casual: false,
            complexity: Complexity::Moderate,
            question_type: QuestionType::General,
            document_references: Vec::new(),
            key_concepts: Vec::new(),
        }
    }
}

/// Raw JSON shape the completion prompt is asked to emit — a strict subset
/// of `AnalysisResult` (spec §4.5's prompt only asks for the core fields;
/// `complexity`/`question_type`/`key_concepts` are filled in afterward by
/// rule-based enrichment, same two-tier split the teacher prompt uses for
/// `needs_relations` et al.).
#[derive(Debug, Clone, Deserialize)]
pub struct RawClassification {
    pub intent: String,
    pub should_respond: bool,
    pub confidence: f32,
    pub routing: String,
    pub needs_rag: bool,
    pub needs_tools: bool,
    pub needs_memory: bool,
    #[serde(default)]
    pub needs_relations: bool,
    pub is_casual: bool,
    #[serde(default)]
    pub document_references: Vec<String>,
}
