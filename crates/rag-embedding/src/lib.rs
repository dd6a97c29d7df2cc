pub mod client;
pub mod sanitize;

pub use client::EmbeddingClient;
