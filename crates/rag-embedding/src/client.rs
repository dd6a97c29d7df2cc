//! Embedding Client — `embed`/`embed_batch` over an opaque HTTP embedding
//! service, following the usual reqwest-wrapper-with-mapped-errors idiom.

use rag_core::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::sanitize::{sanitize, truncate, MAX_CHUNK_CHARS, MAX_QUERY_CHARS};

pub struct EmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    dimension: usize,
    batch_size: usize,
}

impl EmbeddingClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, dimension: usize, batch_size: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            dimension,
            batch_size,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed a single (typically short, query-shaped) text. Sanitizes and
    /// truncates to `MAX_QUERY_CHARS` before calling the service.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let cleaned = sanitize(text);
        if cleaned.is_empty() {
            return Err(CoreError::InvalidInput(
                "text is empty after sanitization".to_string(),
            ));
        }
        let truncated = truncate(&cleaned, MAX_QUERY_CHARS);
        let vecs = self.call_embed(&[truncated], false).await?;
        vecs.into_iter()
            .next()
            .ok_or_else(|| CoreError::BackendUnavailable("embedding service returned no vectors".to_string()))
    }

    /// Embed a batch of (typically longer, chunk-shaped) texts, capped at
    /// `MAX_CHUNK_CHARS` each. Results are L2-normalized so cosine
    /// similarity downstream reduces to a dot product (spec §4.2).
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut cleaned = Vec::with_capacity(texts.len());
        for t in texts {
            let c = sanitize(t);
            if c.is_empty() {
                return Err(CoreError::InvalidInput(
                    "batch contains a text that is empty after sanitization".to_string(),
                ));
            }
            cleaned.push(truncate(&c, MAX_CHUNK_CHARS));
        }

        let mut out = Vec::with_capacity(cleaned.len());
        for chunk in cleaned.chunks(self.batch_size) {
            let vecs = self.call_embed(chunk, true).await?;
            out.extend(vecs);
        }
        Ok(out)
    }

    async fn call_embed(&self, texts: &[String], normalize: bool) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = EmbedRequest {
            input: texts.to_vec(),
            dimensions: self.dimension,
        };
        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| CoreError::BackendUnavailable(format!("embedding request failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CoreError::BackendUnavailable("embedding service rate limited".to_string()));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "embedding service error");
            return Err(CoreError::BackendUnavailable(format!("embedding service returned {status}")));
        }

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::ParseFailure(format!("unparseable embedding response: {e}")))?;

        let mut vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        if normalize {
            for v in &mut vectors {
                l2_normalize(v);
            }
        }
        Ok(vectors)
    }
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest {
    input: Vec<String>,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_yields_unit_vector() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn l2_normalize_zero_vector_is_noop() {
        let mut v = vec![0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
