//! Cross-encoder rerank client, called from `rag-retrieval`'s re-ranker.
//! Grounded on `original_source/src/utils/cross_encoder_reranker.py` for
//! the call shape (batched `(query, passage)` pairs -> scores), with the
//! usual reqwest error-mapping idiom.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::client::CompletionError;

pub struct RerankClient {
    client: reqwest::Client,
    base_url: String,
}

impl RerankClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Score every `(query, passage)` pair in one batch call. Returns
    /// scores in the same order as `passages`. On any failure, the caller
    /// is expected to fall back to preserving upstream order (spec §4.7)
    /// — this returns `Err` rather than guessing, so that fallback is
    /// explicit at the call site.
    pub async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, CompletionError> {
        let body = RerankRequest {
            query: query.to_string(),
            passages: passages.to_vec(),
        };

        let resp = self
            .client
            .post(format!("{}/v1/rerank", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout
                } else {
                    CompletionError::Unavailable(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "rerank service error");
            return Err(CompletionError::Api { status, message: text });
        }

        let parsed: RerankResponse = resp.json().await.map_err(|e| CompletionError::Parse(e.to_string()))?;
        if parsed.scores.len() != passages.len() {
            return Err(CompletionError::Parse(format!(
                "rerank service returned {} scores for {} passages",
                parsed.scores.len(),
                passages.len()
            )));
        }
        Ok(parsed.scores)
    }
}

#[derive(Serialize)]
struct RerankRequest {
    query: String,
    passages: Vec<String>,
}

#[derive(Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}
