//! Re-ranker. Grounded on
//! `original_source/src/utils/cross_encoder_reranker.py`'s `rerank()`:
//! cap at `max_candidates` (pre-sorted by existing score), truncate text
//! to 400 chars, batch-score in groups of 32, blend
//! `0.7*rerank_score + 0.3*original_score`, re-sort. Unscored remainder
//! (beyond `max_candidates`) is merged back in with a 0.5 score penalty so
//! it never outranks a freshly-reranked candidate — the python original's
//! exact merge behavior.
//!
//! Skip-thresholds (`len <= 1.5*top_k` or `len > 100`) are additions the
//! original doesn't have — the python reranker always tries, relying on
//! the cross-encoder call itself to fail gracefully.

use rag_completion::rerank::RerankClient;
use rag_core::types::ScoredChunk;
use tracing::{debug, warn};

const MAX_CANDIDATES: usize = 50;
const BATCH_SIZE: usize = 32;
const TEXT_TRUNCATE_CHARS: usize = 400;
const RERANK_WEIGHT: f32 = 0.7;
const ORIGINAL_WEIGHT: f32 = 0.3;
const NON_RERANKED_PENALTY: f32 = 0.5;

pub struct Reranker {
    client: RerankClient,
}

impl Reranker {
    pub fn new(client: RerankClient) -> Self {
        Self { client }
    }

    /// `rerank(query, candidates, top_k)` per spec §4.7. Skips entirely
    /// (returning the first `top_k` by existing order) when there isn't
    /// enough to reorder or too much to afford.
    pub async fn rerank(&self, query: &str, candidates: Vec<ScoredChunk>, top_k: usize) -> Vec<ScoredChunk> {
        if candidates.len() as f32 <= 1.5 * top_k as f32 {
            debug!(n = candidates.len(), top_k, "rerank skipped: too few candidates to matter");
            return candidates.into_iter().take(top_k).collect();
        }
        if candidates.len() > 100 {
            debug!(n = candidates.len(), "rerank skipped: too many candidates, cost unacceptable");
            return candidates.into_iter().take(top_k).collect();
        }

        let mut sorted = candidates;
        sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let (to_rerank, remainder) = if sorted.len() > MAX_CANDIDATES {
            let remainder = sorted.split_off(MAX_CANDIDATES);
            (sorted, remainder)
        } else {
            (sorted, Vec::new())
        };

        let passages: Vec<String> = to_rerank
            .iter()
            .map(|c| c.text.chars().take(TEXT_TRUNCATE_CHARS).collect())
            .collect();

        let mut reranked = Vec::with_capacity(to_rerank.len());
        let mut scores_ok = true;
        for (chunk_batch, text_batch) in to_rerank.chunks(BATCH_SIZE).zip(passages.chunks(BATCH_SIZE)) {
            match self.client.score_batch(query, text_batch).await {
                Ok(scores) => {
                    for (chunk, rerank_score) in chunk_batch.iter().zip(scores) {
                        let final_score = RERANK_WEIGHT * rerank_score + ORIGINAL_WEIGHT * chunk.score;
                        reranked.push(ScoredChunk { score: final_score, ..chunk.clone() });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cross-encoder unavailable, falling back to original ranking");
                    scores_ok = false;
                    break;
                }
            }
        }

        if !scores_ok {
            let mut fallback: Vec<ScoredChunk> = to_rerank.into_iter().chain(remainder).collect();
            fallback.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            return fallback.into_iter().take(top_k).collect();
        }

        for chunk in remainder {
            let penalized_score = chunk.score * NON_RERANKED_PENALTY;
            reranked.push(ScoredChunk { score: penalized_score, ..chunk });
        }

        reranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        reranked.truncate(top_k);
        reranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rag_core::types::ChunkId;

    fn chunk(id: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk_id: ChunkId { doc_id: "d".to_string(), chunk_index: 0 },
            text: format!("text for {id}"),
            score,
            doc_id: "d".to_string(),
            file_name: "f.txt".to_string(),
            chunk_index: 0,
            uploaded_by: "u".to_string(),
            embedding: None,
            uploaded_at: None,
        }
    }

    #[tokio::test]
    async fn skips_when_too_few_candidates() {
        let client = RerankClient::new("http://unused.invalid");
        let reranker = Reranker::new(client);
        let candidates = vec![chunk("a", 0.9), chunk("b", 0.5)];
        let result = reranker.rerank("q", candidates.clone(), 2).await;
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].text, candidates[0].text);
    }

    #[tokio::test]
    async fn skips_when_over_100_candidates() {
        let client = RerankClient::new("http://unused.invalid");
        let reranker = Reranker::new(client);
        let candidates: Vec<ScoredChunk> = (0..101).map(|i| chunk(&i.to_string(), 1.0 - i as f32 * 0.001)).collect();
        let result = reranker.rerank("q", candidates, 5).await;
        assert_eq!(result.len(), 5);
    }
}
