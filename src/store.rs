//! Chunk store adapter: read-only hybrid retrieval over the chunk index.
//!
//! [`ChunkStore`] is the seam the pipeline consumes; [`SqliteChunkStore`]
//! implements it over SQLite with an FTS5 keyword channel and a vector
//! channel merged by alpha-weighted scoring. The merge produces the
//! store-native `relevance_score`; reranking happens downstream.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::warn;

use crate::config::{EmbeddingConfig, RetrievalConfig};
use crate::embedding;
use crate::error::{Error, Result};
use crate::models::{Chunk, ChunkKind};

/// Optional retrieval filters.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub document_name: Option<String>,
    pub tag: Option<String>,
}

/// Read-only interface over a vector+keyword chunk index.
///
/// Returns candidates ordered by the store's native relevance score
/// descending. Store unavailability surfaces as
/// [`Error::RetrievalUnavailable`]; callers degrade rather than fail the
/// turn.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: Option<&FilterSpec>,
    ) -> Result<Vec<Chunk>>;
}

/// SQLite-backed hybrid chunk store (FTS5 + stored vectors).
pub struct SqliteChunkStore {
    pool: SqlitePool,
    retrieval: RetrievalConfig,
    embedding_config: EmbeddingConfig,
}

impl SqliteChunkStore {
    pub fn new(
        pool: SqlitePool,
        retrieval: RetrievalConfig,
        embedding_config: EmbeddingConfig,
    ) -> Self {
        Self {
            pool,
            retrieval,
            embedding_config,
        }
    }

    async fn fetch_keyword_candidates(&self, query: &str) -> Result<Vec<ScoredId>> {
        let match_query = sanitize_match_query(query);
        if match_query.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&match_query)
        .bind(self.retrieval.candidate_k_keyword)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::RetrievalUnavailable(e.to_string()))?;

        let candidates = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ScoredId {
                    chunk_id: row.get("chunk_id"),
                    raw_score: -rank, // negate so higher = better
                }
            })
            .collect();

        Ok(candidates)
    }

    async fn fetch_vector_candidates(&self, query: &str) -> Result<Vec<ScoredId>> {
        if !self.embedding_config.is_enabled() {
            return Ok(Vec::new());
        }

        // A failed query embedding degrades to keyword-only retrieval.
        let provider = match embedding::create_provider(&self.embedding_config) {
            Ok(p) => p,
            Err(e) => {
                warn!("embedding provider unavailable, keyword-only search: {e:#}");
                return Ok(Vec::new());
            }
        };
        let query_vec = match embedding::embed_query(provider.as_ref(), query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("query embedding failed, keyword-only search: {e:#}");
                return Ok(Vec::new());
            }
        };

        let rows = sqlx::query("SELECT chunk_id, embedding FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::RetrievalUnavailable(e.to_string()))?;

        let mut candidates: Vec<ScoredId> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = embedding::blob_to_vec(&blob);
                ScoredId {
                    chunk_id: row.get("chunk_id"),
                    raw_score: embedding::cosine_similarity(&query_vec, &vec) as f64,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(self.retrieval.candidate_k_vector as usize);

        Ok(candidates)
    }

    async fn load_chunk(&self, chunk_id: &str, relevance_score: f64) -> Result<Option<Chunk>> {
        let row = sqlx::query(
            r#"
            SELECT c.id, c.text, c.kind, c.document_name, c.page, c.section,
                   c.tags_json, c.context_note, cv.embedding
            FROM chunks c
            LEFT JOIN chunk_vectors cv ON cv.chunk_id = c.id
            WHERE c.id = ?
            "#,
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::RetrievalUnavailable(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let kind: String = row.get("kind");
        let tags_json: String = row.get("tags_json");
        let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
        let page: i64 = row.get("page");
        let vector: Option<Vec<u8>> = row.get("embedding");

        Ok(Some(Chunk {
            id: row.get("id"),
            text: row.get("text"),
            kind: ChunkKind::from_str_lossy(&kind),
            document_name: row.get("document_name"),
            page: page.max(0) as u32,
            section: row.get("section"),
            tags,
            context_note: row.get("context_note"),
            relevance_score,
            rerank_score: None,
            vector: vector.as_deref().map(embedding::blob_to_vec),
        }))
    }
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: Option<&FilterSpec>,
    ) -> Result<Vec<Chunk>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let keyword_candidates = self.fetch_keyword_candidates(query).await?;
        let vector_candidates = self.fetch_vector_candidates(query).await?;

        if keyword_candidates.is_empty() && vector_candidates.is_empty() {
            return Ok(Vec::new());
        }

        let norm_keyword = normalize_scores(&keyword_candidates);
        let norm_vector = normalize_scores(&vector_candidates);

        let kw_map: HashMap<&str, f64> = norm_keyword
            .iter()
            .map(|(c, s)| (c.chunk_id.as_str(), *s))
            .collect();
        let vec_map: HashMap<&str, f64> = norm_vector
            .iter()
            .map(|(c, s)| (c.chunk_id.as_str(), *s))
            .collect();

        // When one channel produced nothing, score entirely from the other
        // so candidates are not half-penalized.
        let alpha = if vector_candidates.is_empty() {
            0.0
        } else if keyword_candidates.is_empty() {
            1.0
        } else {
            self.retrieval.hybrid_alpha
        };

        let mut merged_ids: Vec<&str> = Vec::new();
        for c in keyword_candidates.iter().chain(vector_candidates.iter()) {
            if !merged_ids.contains(&c.chunk_id.as_str()) {
                merged_ids.push(c.chunk_id.as_str());
            }
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        for chunk_id in merged_ids {
            let k = kw_map.get(chunk_id).copied().unwrap_or(0.0);
            let v = vec_map.get(chunk_id).copied().unwrap_or(0.0);
            let hybrid = (1.0 - alpha) * k + alpha * v;

            if let Some(chunk) = self.load_chunk(chunk_id, hybrid).await? {
                if let Some(f) = filters {
                    if let Some(ref doc) = f.document_name {
                        if &chunk.document_name != doc {
                            continue;
                        }
                    }
                    if let Some(ref tag) = f.tag {
                        if !chunk.tags.iter().any(|t| t == tag) {
                            continue;
                        }
                    }
                }
                chunks.push(chunk);
            }
        }

        // Deterministic: score desc, id asc
        chunks.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        chunks.truncate(limit);

        Ok(chunks)
    }
}

// ============ Candidate types ============

#[derive(Debug, Clone)]
struct ScoredId {
    chunk_id: String,
    raw_score: f64,
}

/// Reduce a free-text query to a safe FTS5 MATCH expression: bare terms
/// joined by spaces (implicit AND), punctuation stripped.
fn sanitize_match_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

// ============ Score normalization ============

/// Min-max normalize scores to [0, 1].
fn normalize_scores(candidates: &[ScoredId]) -> Vec<(&ScoredId, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candidate(chunk_id: &str, score: f64) -> ScoredId {
        ScoredId {
            chunk_id: chunk_id.to_string(),
            raw_score: score,
        }
    }

    #[test]
    fn test_normalize_empty() {
        let result = normalize_scores(&[]);
        assert!(result.is_empty());
    }

    #[test]
    fn test_normalize_single() {
        let candidates = vec![make_candidate("c1", 5.0)];
        let result = normalize_scores(&candidates);
        assert_eq!(result.len(), 1);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate("c1", 10.0),
            make_candidate("c2", 5.0),
            make_candidate("c3", 0.0),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal() {
        let candidates = vec![make_candidate("c1", 3.0), make_candidate("c2", 3.0)];
        let result = normalize_scores(&candidates);
        for (_, score) in &result {
            assert!((*score - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_scores_always_in_unit() {
        let candidates = vec![
            make_candidate("c1", -5.0),
            make_candidate("c2", 100.0),
            make_candidate("c3", 42.0),
        ];
        let result = normalize_scores(&candidates);
        for (_, score) in &result {
            assert!(
                *score >= 0.0 && *score <= 1.0,
                "Score out of range: {}",
                score
            );
        }
    }

    #[test]
    fn test_sanitize_match_query_strips_punctuation() {
        assert_eq!(
            sanitize_match_query("what about it in algae?"),
            "what about it in algae"
        );
        assert_eq!(sanitize_match_query("KPI: \"Q3 revenue\""), "KPI Q3 revenue");
        assert_eq!(sanitize_match_query("???"), "");
    }
}
