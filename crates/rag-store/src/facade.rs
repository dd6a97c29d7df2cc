//! Store Facade — uniform API over a vector+full-text index (preferred)
//! and a graph index (fallback, and relationship authority).
//!
//! HTTP call shape: a thin `reqwest::Client` wrapper, status-code
//! branching, and errors mapped to the crate's own error kind rather than
//! bubbling raw `reqwest::Error`.

use std::time::Duration;

use async_trait::async_trait;
use rag_core::error::{CoreError, Result};
use rag_core::types::{Chunk, ChunkId, Document, DocId, ScoredChunk};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Filters shared by every search entry point. `doc_id`/`doc_filename`
/// narrow results to one document; `min_score` drops weak matches.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub doc_id: Option<DocId>,
    pub doc_filename: Option<String>,
    pub min_score: Option<f32>,
}

/// Uniform surface the rest of the pipeline calls. Implemented once over
/// the dual vector+graph backend; a test double can implement it directly
/// for retrieval/orchestrator unit tests without any HTTP plumbing.
#[async_trait]
pub trait StoreFacade: Send + Sync {
    async fn vector_search(&self, query_vec: &[f32], k: usize, filters: &SearchFilters) -> Vec<ScoredChunk>;
    async fn lexical_search(&self, query_text: &str, k: usize, filters: &SearchFilters) -> Vec<ScoredChunk>;
    async fn hybrid_search(
        &self,
        query_text: &str,
        query_vec: &[f32],
        k: usize,
        filters: &SearchFilters,
        semantic_weight: f32,
        lexical_weight: f32,
    ) -> Vec<ScoredChunk>;
    async fn get_all_documents(&self) -> Vec<Document>;
    async fn get_chunks(&self, doc_id: &DocId) -> Vec<Chunk>;
    async fn delete_document(&self, doc_id: &DocId) -> Result<()>;
}

/// The real dual-backed implementation. "Preferred" talks vector+FTS;
/// "fallback" talks the graph index and is also the sole authority for
/// relationship edges (§4.1) — that part lives in `rag-retrieval`'s
/// document selector, which calls `graph_client` directly.
pub struct HttpStoreFacade {
    client: reqwest::Client,
    vector_base_url: String,
    vector_api_key: Option<String>,
    graph_base_url: String,
    graph_api_key: Option<String>,
}

impl HttpStoreFacade {
    pub fn new(
        vector_base_url: impl Into<String>,
        vector_api_key: Option<String>,
        graph_base_url: impl Into<String>,
        graph_api_key: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            vector_base_url: vector_base_url.into(),
            vector_api_key,
            graph_base_url: graph_base_url.into(),
            graph_api_key,
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder, key: &Option<String>) -> reqwest::RequestBuilder {
        match key {
            Some(k) => builder.bearer_auth(k),
            None => builder,
        }
    }

    /// One request with a single jittered retry on transient failure.
    /// Persistent failures degrade to an empty vec rather than raising,
    /// per §4.1 "missing evidence degrades quality, not availability."
    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        base_url: &str,
        api_key: &Option<String>,
        path: &str,
        body: &Req,
    ) -> Option<Resp> {
        let url = format!("{base_url}{path}");
        for attempt in 0..2 {
            if attempt > 0 {
                let jitter_ms = rand::rng().random_range(50..250);
                tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            }
            let builder = self.client.post(&url).json(body);
            let builder = self.auth(builder, api_key);
            match builder.send().await {
                Ok(resp) if resp.status().is_success() => match resp.json::<Resp>().await {
                    Ok(parsed) => return Some(parsed),
                    Err(e) => {
                        warn!(url = %url, error = %e, "store backend returned unparseable body");
                        return None;
                    }
                },
                Ok(resp) => {
                    debug!(url = %url, status = %resp.status(), attempt, "store backend non-success");
                    continue;
                }
                Err(e) => {
                    debug!(url = %url, error = %e, attempt, "store backend request failed");
                    continue;
                }
            }
        }
        None
    }

    async fn vector_search_backend(&self, query_vec: &[f32], k: usize, filters: &SearchFilters) -> Vec<ScoredChunk> {
        let req = VectorSearchRequest {
            query_vec: query_vec.to_vec(),
            k,
            doc_id: filters.doc_id.clone(),
            doc_filename: filters.doc_filename.clone(),
            min_score: filters.min_score,
        };
        self.post_json::<_, SearchResponse>(&self.vector_base_url, &self.vector_api_key, "/v1/vector_search", &req)
            .await
            .map(|r| r.chunks)
            .unwrap_or_default()
    }

    async fn lexical_search_backend(&self, query_text: &str, k: usize, filters: &SearchFilters) -> Vec<ScoredChunk> {
        let req = LexicalSearchRequest {
            query_text: query_text.to_string(),
            k,
            doc_id: filters.doc_id.clone(),
            doc_filename: filters.doc_filename.clone(),
            min_score: filters.min_score,
        };
        self.post_json::<_, SearchResponse>(&self.vector_base_url, &self.vector_api_key, "/v1/lexical_search", &req)
            .await
            .map(|r| r.chunks)
            .unwrap_or_default()
    }

    async fn graph_search(&self, query_text: &str, k: usize, filters: &SearchFilters) -> Vec<ScoredChunk> {
        let req = LexicalSearchRequest {
            query_text: query_text.to_string(),
            k,
            doc_id: filters.doc_id.clone(),
            doc_filename: filters.doc_filename.clone(),
            min_score: filters.min_score,
        };
        self.post_json::<_, SearchResponse>(&self.graph_base_url, &self.graph_api_key, "/v1/search", &req)
            .await
            .map(|r| r.chunks)
            .unwrap_or_default()
    }
}

#[async_trait]
impl StoreFacade for HttpStoreFacade {
    async fn vector_search(&self, query_vec: &[f32], k: usize, filters: &SearchFilters) -> Vec<ScoredChunk> {
        let results = self.vector_search_backend(query_vec, k, filters).await;
        if results.is_empty() && filters.doc_id.is_some() {
            // Specific-document query came back empty on the preferred
            // backend — retry on the fallback before reporting empty
            // (§4.1: repairs the one-backend-missing-a-chunk failure mode).
            debug!("vector_search empty for targeted doc_id, retrying on graph fallback");
            return self.graph_search("", k, filters).await;
        }
        results
    }

    async fn lexical_search(&self, query_text: &str, k: usize, filters: &SearchFilters) -> Vec<ScoredChunk> {
        let results = self.lexical_search_backend(query_text, k, filters).await;
        if results.is_empty() && filters.doc_id.is_some() {
            debug!("lexical_search empty for targeted doc_id, retrying on graph fallback");
            return self.graph_search(query_text, k, filters).await;
        }
        results
    }

    async fn hybrid_search(
        &self,
        query_text: &str,
        query_vec: &[f32],
        k: usize,
        filters: &SearchFilters,
        semantic_weight: f32,
        lexical_weight: f32,
    ) -> Vec<ScoredChunk> {
        let (dense, lexical) = tokio::join!(
            self.vector_search(query_vec, k, filters),
            self.lexical_search(query_text, k, filters),
        );

        if dense.is_empty() {
            return lexical;
        }
        if lexical.is_empty() {
            return dense;
        }

        let by_id: std::collections::HashMap<ChunkId, ScoredChunk> = dense
            .iter()
            .chain(lexical.iter())
            .map(|c| (c.chunk_id.clone(), c.clone()))
            .collect();

        let dense_ranked: Vec<(ChunkId, f32)> = dense.iter().map(|c| (c.chunk_id.clone(), c.score)).collect();
        let lexical_ranked: Vec<(ChunkId, f32)> = lexical.iter().map(|c| (c.chunk_id.clone(), c.score)).collect();

        let fused = crate::rrf::fuse(&[(dense_ranked, semantic_weight), (lexical_ranked, lexical_weight)]);

        fused
            .into_iter()
            .take(k)
            .filter_map(|(id, score)| {
                by_id.get(&id).map(|c| ScoredChunk {
                    score,
                    ..c.clone()
                })
            })
            .collect()
    }

    async fn get_all_documents(&self) -> Vec<Document> {
        let url = format!("{}/v1/documents", self.vector_base_url);
        let builder = self.auth(self.client.get(&url), &self.vector_api_key);
        match builder.send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<Vec<Document>>()
                .await
                .inspect_err(|e| warn!(error = %e, "get_all_documents: unparseable body"))
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    async fn get_chunks(&self, doc_id: &DocId) -> Vec<Chunk> {
        let url = format!("{}/v1/documents/{}/chunks", self.vector_base_url, doc_id);
        let builder = self.auth(self.client.get(&url), &self.vector_api_key);
        match builder.send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<Vec<Chunk>>().await.unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    async fn delete_document(&self, doc_id: &DocId) -> Result<()> {
        // Idempotent: deleting an already-gone doc_id is still success
        // (property 10) — a 404 from the backend is not a caller-visible
        // error, only a genuine connection failure is.
        let url = format!("{}/v1/documents/{}", self.vector_base_url, doc_id);
        let builder = self.auth(self.client.delete(&url), &self.vector_api_key);
        match builder.send().await {
            Ok(_) => Ok(()),
            Err(e) => Err(CoreError::BackendUnavailable(e.to_string())),
        }
    }
}

#[derive(Serialize)]
struct VectorSearchRequest {
    query_vec: Vec<f32>,
    k: usize,
    doc_id: Option<DocId>,
    doc_filename: Option<String>,
    min_score: Option<f32>,
}

#[derive(Serialize)]
struct LexicalSearchRequest {
    query_text: String,
    k: usize,
    doc_id: Option<DocId>,
    doc_filename: Option<String>,
    min_score: Option<f32>,
}

#[derive(Deserialize)]
struct SearchResponse {
    chunks: Vec<ScoredChunk>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory double used by retrieval/orchestrator tests so they don't
    /// need a live HTTP backend.
    pub struct FakeStore {
        pub chunks: Mutex<HashMap<DocId, Vec<Chunk>>>,
        pub deleted: Mutex<Vec<DocId>>,
    }

    #[async_trait]
    impl StoreFacade for FakeStore {
        async fn vector_search(&self, _q: &[f32], k: usize, filters: &SearchFilters) -> Vec<ScoredChunk> {
            self.all_scored(filters, k)
        }
        async fn lexical_search(&self, _q: &str, k: usize, filters: &SearchFilters) -> Vec<ScoredChunk> {
            self.all_scored(filters, k)
        }
        async fn hybrid_search(
            &self,
            _qt: &str,
            _qv: &[f32],
            k: usize,
            filters: &SearchFilters,
            _sw: f32,
            _lw: f32,
        ) -> Vec<ScoredChunk> {
            self.all_scored(filters, k)
        }
        async fn get_all_documents(&self) -> Vec<Document> {
            Vec::new()
        }
        async fn get_chunks(&self, doc_id: &DocId) -> Vec<Chunk> {
            if self.deleted.lock().unwrap().contains(doc_id) {
                return Vec::new();
            }
            self.chunks.lock().unwrap().get(doc_id).cloned().unwrap_or_default()
        }
        async fn delete_document(&self, doc_id: &DocId) -> Result<()> {
            self.deleted.lock().unwrap().push(doc_id.clone());
            Ok(())
        }
    }

    impl FakeStore {
        fn all_scored(&self, filters: &SearchFilters, k: usize) -> Vec<ScoredChunk> {
            let chunks = self.chunks.lock().unwrap();
            let mut out = Vec::new();
            for (doc_id, cs) in chunks.iter() {
                if self.deleted.lock().unwrap().contains(doc_id) {
                    continue;
                }
                if let Some(filter_doc) = &filters.doc_id {
                    if filter_doc != doc_id {
                        continue;
                    }
                }
                for c in cs {
                    out.push(ScoredChunk {
                        chunk_id: c.chunk_id.clone(),
                        text: c.text.clone(),
                        score: 1.0,
                        doc_id: c.chunk_id.doc_id.clone(),
                        file_name: c.file_name.clone(),
                        chunk_index: c.chunk_id.chunk_index,
                        uploaded_by: c.uploaded_by.clone(),
                        embedding: Some(c.embedding.clone()),
                        uploaded_at: c.uploaded_at,
                    });
                }
            }
            out.truncate(k);
            out
        }
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = FakeStore {
            chunks: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
        };
        let doc_id = "doc-1".to_string();
        store.delete_document(&doc_id).await.unwrap();
        store.delete_document(&doc_id).await.unwrap();
        assert!(store.get_chunks(&doc_id).await.is_empty());
    }
}
