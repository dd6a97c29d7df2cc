pub mod expansion;
pub mod hybrid;
pub mod rerank;
pub mod selector;

pub use hybrid::HybridRetriever;
pub use rerank::Reranker;
pub use selector::{extract_document_references, find_documents_by_reference, score_documents, should_search_documents, ScoredDocument};
