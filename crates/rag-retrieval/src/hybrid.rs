//! Hybrid Retrieval — orchestrates query expansion, optional rewrite,
//! multi-query retrieval, dense+lexical fusion (via [`StoreFacade`]),
//! temporal reweighting, and MMR diversification. No single source file
//! matches the whole pipeline; each step is grounded individually (see
//! module docs on `expansion`, and this module's per-step comments).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rag_analyzer::Complexity;
use rag_completion::{CompletionClient, Message, Role};
use rag_core::types::{ChunkId, ScoredChunk};
use rag_embedding::EmbeddingClient;
use rag_store::{SearchFilters, StoreFacade};
use tracing::{debug, warn};

use crate::expansion::expand;

const MAX_EXPANSIONS: usize = 3;
const MIN_TOKENS_FOR_REWRITE: usize = 4;
const MIN_TOKENS_FOR_MULTI_QUERY: usize = 5;
const MAX_PARAPHRASES: usize = 3;
const RECENT_DOC_BOOST: f32 = 1.05;
const RECENT_DOC_WINDOW_HOURS: i64 = 24;

pub struct HybridRetriever {
    store: Arc<dyn StoreFacade>,
    embedder: Arc<EmbeddingClient>,
    completion: Arc<CompletionClient>,
    mmr_lambda: f32,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<dyn StoreFacade>,
        embedder: Arc<EmbeddingClient>,
        completion: Arc<CompletionClient>,
        mmr_lambda: f32,
    ) -> Self {
        Self { store, embedder, completion, mmr_lambda }
    }

    /// Run the full hybrid-retrieval pipeline. `k` is the caller's desired
    /// result size before re-ranking (which runs afterward, in
    /// `rag-orchestrator`).
    pub async fn retrieve(
        &self,
        query: &str,
        complexity: Complexity,
        k: usize,
        filters: &SearchFilters,
        use_query_expansion: bool,
        use_temporal_weighting: bool,
    ) -> Vec<ScoredChunk> {
        // Step 1: query expansion.
        let search_text = if use_query_expansion { expand(query, MAX_EXPANSIONS) } else { query.to_string() };

        // Step 2: query rewrite — only for moderate+ complexity, long
        // enough queries, and best-effort (a failed rewrite just means we
        // search on the expanded original).
        let token_count = query.split_whitespace().count();
        let rewritten = if complexity != Complexity::Simple && token_count >= MIN_TOKENS_FOR_REWRITE {
            self.rewrite_query(&search_text).await
        } else {
            None
        };
        let effective_query = rewritten.as_deref().unwrap_or(&search_text);

        let query_vec = match self.embedder.embed(effective_query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "hybrid retrieval: query embedding failed, returning no candidates");
                return Vec::new();
            }
        };

        // Step 4: dense + lexical fusion.
        let mut candidates = self.store.hybrid_search(effective_query, &query_vec, k, filters, 0.5, 0.5).await;

        // Step 3: multi-query retrieval — only when complex, under-filled,
        // and the query has enough tokens to paraphrase meaningfully.
        if complexity == Complexity::Complex && candidates.len() < 2 * k && token_count >= MIN_TOKENS_FOR_MULTI_QUERY {
            let extra = self.multi_query_retrieve(effective_query, k, filters).await;
            merge_best_by_id(&mut candidates, extra);
        }

        // Step 5: temporal reweighting.
        if use_temporal_weighting {
            apply_recency_boost(&mut candidates, Utc::now());
        }

        // Step 6: MMR diversification.
        mmr_select(candidates, k, self.mmr_lambda)
    }

    async fn rewrite_query(&self, query: &str) -> Option<String> {
        let messages = vec![
            Message {
                role: Role::System,
                content: "Rewrite the user's question to be maximally clear and specific for document search. Reply with only the rewritten question.".to_string(),
            },
            Message { role: Role::User, content: query.to_string() },
        ];
        match self.completion.complete(&messages, 0.2, 80).await {
            Ok(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            Err(e) => {
                debug!(error = %e, "query rewrite failed, proceeding with expanded original");
                None
            }
        }
    }

    async fn multi_query_retrieve(&self, query: &str, k: usize, filters: &SearchFilters) -> Vec<ScoredChunk> {
        let paraphrases = self.generate_paraphrases(query).await;
        let mut merged = Vec::new();
        for p in paraphrases {
            let vec = match self.embedder.embed(&p).await {
                Ok(v) => v,
                Err(_) => continue,
            };
            let results = self.store.hybrid_search(&p, &vec, 2 * k, filters, 0.5, 0.5).await;
            merged.extend(results);
        }
        merged
    }

    async fn generate_paraphrases(&self, query: &str) -> Vec<String> {
        let messages = vec![
            Message {
                role: Role::System,
                content: format!("Generate up to {MAX_PARAPHRASES} alternate phrasings of the user's question, one per line, no numbering."),
            },
            Message { role: Role::User, content: query.to_string() },
        ];
        match self.completion.complete(&messages, 0.5, 150).await {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .take(MAX_PARAPHRASES)
                .map(str::to_string)
                .collect(),
            Err(e) => {
                debug!(error = %e, "paraphrase generation failed, skipping multi-query retrieval");
                Vec::new()
            }
        }
    }
}

/// Merge `extra` into `base`, keeping the best score per `chunk_id` and
/// never introducing a duplicate (spec §4.6: "Must never include
/// duplicates by chunk_id").
fn merge_best_by_id(base: &mut Vec<ScoredChunk>, extra: Vec<ScoredChunk>) {
    let mut by_id: std::collections::HashMap<ChunkId, ScoredChunk> =
        base.drain(..).map(|c| (c.chunk_id.clone(), c)).collect();
    for c in extra {
        by_id
            .entry(c.chunk_id.clone())
            .and_modify(|existing| {
                if c.score > existing.score {
                    *existing = c.clone();
                }
            })
            .or_insert(c);
    }
    base.extend(by_id.into_values());
    base.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

/// Documents uploaded within the last 24h get a flat boost (spec §4.6.5,
/// resolved per the open-question decision: flat `1.05`, not a decay
/// curve — documents don't carry the same "staleness" semantics memories
/// do).
fn apply_recency_boost(candidates: &mut [ScoredChunk], now: DateTime<Utc>) {
    for c in candidates.iter_mut() {
        if let Some(uploaded_at) = c.uploaded_at {
            let age_hours = now.signed_duration_since(uploaded_at).num_hours();
            if age_hours >= 0 && age_hours < RECENT_DOC_WINDOW_HOURS {
                c.score *= RECENT_DOC_BOOST;
            }
        }
    }
}

/// Maximal marginal relevance selection (spec §4.6.6): greedily pick the
/// highest `λ·score - (1-λ)·max_sim_to_selected` candidate, capped so no
/// more than `k/2` come from one document until every other document has
/// been considered at least once. Falls back to text-token-overlap
/// similarity when a candidate has no embedding.
fn mmr_select(candidates: Vec<ScoredChunk>, k: usize, lambda: f32) -> Vec<ScoredChunk> {
    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }

    let mut pool = candidates;
    pool.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let per_doc_cap = (k / 2).max(1);
    let mut selected: Vec<ScoredChunk> = Vec::with_capacity(k);
    let mut per_doc_count: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let docs_seen_total: std::collections::HashSet<&str> = pool.iter().map(|c| c.doc_id.as_str()).collect();

    while selected.len() < k && !pool.is_empty() {
        let mut best_idx = None;
        let mut best_mmr = f32::MIN;

        let docs_represented = per_doc_count.len();
        let all_docs_represented = docs_represented >= docs_seen_total.len();

        for (idx, cand) in pool.iter().enumerate() {
            let count = per_doc_count.get(&cand.doc_id).copied().unwrap_or(0);
            // Until every document has at least one pick, a document that
            // already has one is not eligible — this reserves a slot for
            // each not-yet-represented document instead of letting two
            // early documents jointly exhaust the whole budget. Only once
            // every document is represented does the per-document ceiling
            // take over.
            if !all_docs_represented {
                if count >= 1 {
                    continue;
                }
            } else if count >= per_doc_cap {
                continue;
            }

            let max_sim = selected
                .iter()
                .map(|s| similarity(cand, s))
                .fold(0.0f32, f32::max);
            let mmr = lambda * cand.score - (1.0 - lambda) * max_sim;
            if mmr > best_mmr {
                best_mmr = mmr;
                best_idx = Some(idx);
            }
        }

        let Some(idx) = best_idx else { break };
        let chosen = pool.remove(idx);
        *per_doc_count.entry(chosen.doc_id.clone()).or_insert(0) += 1;
        selected.push(chosen);
    }

    selected
}

fn similarity(a: &ScoredChunk, b: &ScoredChunk) -> f32 {
    match (&a.embedding, &b.embedding) {
        (Some(va), Some(vb)) if va.len() == vb.len() => cosine(va, vb),
        _ => token_overlap(&a.text, &b.text),
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn token_overlap(a: &str, b: &str) -> f32 {
    let sa: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let sb: std::collections::HashSet<&str> = b.split_whitespace().collect();
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let intersection = sa.intersection(&sb).count() as f32;
    let union = sa.union(&sb).count() as f32;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn chunk(doc: &str, idx: u32, score: f32, uploaded_at: Option<DateTime<Utc>>) -> ScoredChunk {
        ScoredChunk {
            chunk_id: ChunkId { doc_id: doc.to_string(), chunk_index: idx },
            text: format!("chunk {doc} {idx}"),
            score,
            doc_id: doc.to_string(),
            file_name: format!("{doc}.txt"),
            chunk_index: idx,
            uploaded_by: "u".to_string(),
            embedding: None,
            uploaded_at,
        }
    }

    #[test]
    fn recency_boost_applies_only_within_window() {
        let now = Utc::now();
        let mut candidates = vec![
            chunk("a", 0, 1.0, Some(now - Duration::hours(1))),
            chunk("b", 0, 1.0, Some(now - Duration::days(10))),
        ];
        apply_recency_boost(&mut candidates, now);
        assert!(candidates[0].score > 1.0);
        assert_eq!(candidates[1].score, 1.0);
    }

    #[test]
    fn merge_best_by_id_keeps_higher_score_and_dedupes() {
        let mut base = vec![chunk("a", 0, 0.5, None)];
        let extra = vec![chunk("a", 0, 0.9, None), chunk("b", 0, 0.3, None)];
        merge_best_by_id(&mut base, extra);
        assert_eq!(base.len(), 2);
        let a = base.iter().find(|c| c.doc_id == "a").unwrap();
        assert_eq!(a.score, 0.9);
    }

    #[test]
    fn mmr_select_never_duplicates_chunk_id() {
        let candidates = vec![
            chunk("a", 0, 0.9, None),
            chunk("a", 1, 0.8, None),
            chunk("b", 0, 0.7, None),
        ];
        let out = mmr_select(candidates, 3, 0.5);
        let ids: std::collections::HashSet<_> = out.iter().map(|c| c.chunk_id.clone()).collect();
        assert_eq!(ids.len(), out.len());
    }

    #[test]
    fn mmr_select_respects_k() {
        let candidates: Vec<ScoredChunk> = (0..10).map(|i| chunk("a", i, 1.0 - i as f32 * 0.01, None)).collect();
        let out = mmr_select(candidates, 4, 0.5);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn mmr_select_caps_single_document_dominance() {
        let mut candidates: Vec<ScoredChunk> = (0..6).map(|i| chunk("dominant", i, 1.0 - i as f32 * 0.01, None)).collect();
        candidates.push(chunk("other", 0, 0.5, None));
        let out = mmr_select(candidates, 4, 0.5);
        let from_dominant = out.iter().filter(|c| c.doc_id == "dominant").count();
        assert!(from_dominant < 4, "dominant doc should not fill every slot when another doc is available");
    }

    #[test]
    fn mmr_select_covers_every_document_with_equal_scores() {
        let docs = ["a", "b", "c", "d"];
        let candidates: Vec<ScoredChunk> =
            docs.iter().flat_map(|doc| (0..5).map(move |i| chunk(doc, i, 0.8, None))).collect();
        let out = mmr_select(candidates, 8, 0.5);
        assert_eq!(out.len(), 8);
        for doc in docs {
            assert!(out.iter().any(|c| c.doc_id == doc), "expected at least one chunk from document {doc}");
        }
    }
}
