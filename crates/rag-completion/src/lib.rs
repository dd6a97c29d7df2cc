pub mod client;
pub mod rerank;

pub use client::{CompletionClient, CompletionError};
pub use rag_core::types::{Message, Role};
