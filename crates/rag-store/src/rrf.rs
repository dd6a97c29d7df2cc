//! Reciprocal rank fusion — merges two independently-ranked lists without
//! needing commensurate raw scores (spec §4.1, GLOSSARY "RRF").
//!
//! `score = Σ 1/(k + rank_i)`, k=60, summed over every list the id appears
//! in (rank is 1-based). Used by [`StoreFacade::hybrid_search`] when the
//! preferred backend has no licensed RRF primitive of its own.

use std::collections::HashMap;
use std::hash::Hash;

const RRF_K: f32 = 60.0;

/// Fuse ranked lists of `(id, native_score)` into one RRF-scored ranking,
/// then blend in a normalized weighted combination of the native scores
/// per `semantic_weight`/`lexical_weight` (spec §4.1). `lists` is indexed
/// `[dense, lexical]` conceptually but generalizes to any number of
/// ranked lists with matching weights.
pub fn fuse<Id: Eq + Hash + Clone>(
    lists: &[(Vec<(Id, f32)>, f32)],
) -> Vec<(Id, f32)> {
    let mut rrf_scores: HashMap<Id, f32> = HashMap::new();
    let mut blended: HashMap<Id, f32> = HashMap::new();

    for (list, weight) in lists {
        let max_score = list
            .iter()
            .map(|(_, s)| *s)
            .fold(f32::MIN, f32::max)
            .max(f32::EPSILON);

        for (rank, (id, score)) in list.iter().enumerate() {
            let rrf = 1.0 / (RRF_K + (rank + 1) as f32);
            *rrf_scores.entry(id.clone()).or_insert(0.0) += rrf;

            let normalized = if max_score > 0.0 { score / max_score } else { 0.0 };
            *blended.entry(id.clone()).or_insert(0.0) += normalized * weight;
        }
    }

    let mut merged: Vec<(Id, f32)> = rrf_scores
        .into_iter()
        .map(|(id, rrf)| {
            let blend = blended.get(&id).copied().unwrap_or(0.0);
            (id, rrf + blend)
        })
        .collect();

    merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fusion_favors_items_ranked_well_in_both_lists() {
        let dense = vec![("a".to_string(), 0.9), ("b".to_string(), 0.8), ("c".to_string(), 0.1)];
        let lexical = vec![("b".to_string(), 5.0), ("a".to_string(), 1.0), ("c".to_string(), 4.0)];
        let merged = fuse(&[(dense, 0.6), (lexical, 0.4)]);
        let order: Vec<&str> = merged.iter().map(|(id, _)| id.as_str()).collect();
        // "a" and "b" both rank top-2 in one list and present in the other;
        // "c" is worst-ranked in dense — it should not lead.
        assert_ne!(order[0], "c");
    }

    #[test]
    fn single_list_preserves_its_own_order() {
        let dense = vec![("x".to_string(), 0.9), ("y".to_string(), 0.5)];
        let merged = fuse(&[(dense, 1.0)]);
        assert_eq!(merged[0].0, "x");
        assert_eq!(merged[1].0, "y");
    }
}
