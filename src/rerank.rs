//! Second-pass scoring of store candidates against the original query.
//!
//! The store ranks by its hybrid score for the resolved search string; the
//! reranker re-scores against an embedding of the query the user actually
//! typed. Cosine similarity is mapped onto [0,1] so chunks without a
//! stored vector can fall back to the store's relevance score on the same
//! scale instead of mixing two scales directly.

use crate::embedding::{cosine_similarity, cosine_to_unit};
use crate::models::Chunk;

/// Re-score and reorder candidates, keeping the top `top_k`.
///
/// Every returned chunk has `rerank_score` populated. Ordering is fully
/// deterministic: score descending, then original candidate rank
/// ascending, then id ascending.
pub fn rerank(query_vector: Option<&[f32]>, candidates: Vec<Chunk>, top_k: usize) -> Vec<Chunk> {
    let mut scored: Vec<(usize, Chunk)> = candidates
        .into_iter()
        .enumerate()
        .map(|(rank, mut chunk)| {
            let score = match (query_vector, chunk.vector.as_deref()) {
                (Some(q), Some(v)) => cosine_to_unit(cosine_similarity(q, v)),
                // No vector to compare: the store's [0,1] hybrid score is
                // already on the target scale.
                _ => chunk.relevance_score,
            };
            chunk.rerank_score = Some(score);
            (rank, chunk)
        })
        .collect();

    scored.sort_by(|(rank_a, a), (rank_b, b)| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| rank_a.cmp(rank_b))
            .then_with(|| a.id.cmp(&b.id))
    });

    scored
        .into_iter()
        .take(top_k)
        .map(|(_, chunk)| chunk)
        .collect()
}
