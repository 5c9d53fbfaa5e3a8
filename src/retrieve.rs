//! Hybrid retrieval: lexical + vector search, merged and re-ranked.
//!
//! # Scoring
//!
//! 1. Fetch `candidate_k` lexical candidates (BM25 rank) and `candidate_k`
//!    vector candidates (cosine similarity), both tenant-filtered inside
//!    the index.
//! 2. Min-max normalize each candidate set to `[0, 1]`.
//! 3. Union and dedup by chunk id.
//! 4. Combine: `score = (1 - α) × lexical + α × vector`.
//! 5. Sort by score (desc), document recency (desc), chunk id (asc).
//! 6. Truncate to `top_k`; fewer candidates are returned as-is, never
//!    padded.

use std::collections::HashMap;
use std::sync::Arc;

use crate::embedding::Embedder;
use crate::error::Result;
use crate::index::{IndexHit, SearchIndex};
use crate::models::{RetrievalHit, RetrievalResult, TenantId};

/// Retrieval tuning parameters.
#[derive(Debug, Clone)]
pub struct RetrievalParams {
    /// Weight of the vector channel: `score = (1-α)·lexical + α·vector`.
    pub hybrid_alpha: f64,
    /// Candidates fetched per channel before merging.
    pub candidate_k: i64,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            hybrid_alpha: 0.5,
            candidate_k: 80,
        }
    }
}

pub struct Retriever {
    index: Arc<dyn SearchIndex>,
    embedder: Embedder,
    params: RetrievalParams,
}

impl Retriever {
    pub fn new(index: Arc<dyn SearchIndex>, embedder: Embedder, params: RetrievalParams) -> Self {
        Self {
            index,
            embedder,
            params,
        }
    }

    /// Run a hybrid search for `query` within `tenant`.
    ///
    /// The query is embedded with the same embedder used at ingestion so the
    /// two vector spaces agree. Index errors propagate as degraded-service
    /// errors; they are never flattened into an empty result.
    pub async fn retrieve(
        &self,
        tenant: &TenantId,
        query: &str,
        top_k: usize,
    ) -> Result<RetrievalResult> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(RetrievalResult::default());
        }

        let query_vec = self.embedder.embed_query(query).await?;

        let keyword_candidates = self
            .index
            .keyword_search(tenant, query, self.params.candidate_k)
            .await?;
        let vector_candidates = self
            .index
            .vector_search(tenant, &query_vec, self.params.candidate_k)
            .await?;

        if keyword_candidates.is_empty() && vector_candidates.is_empty() {
            return Ok(RetrievalResult::default());
        }

        let hits = merge_candidates(
            &keyword_candidates,
            &vector_candidates,
            self.params.hybrid_alpha,
            top_k,
        );

        tracing::debug!(
            tenant = %tenant,
            keyword = keyword_candidates.len(),
            vector = vector_candidates.len(),
            returned = hits.len(),
            "retrieval complete"
        );

        Ok(RetrievalResult { hits })
    }
}

/// Merge the two candidate channels into a ranked, deduplicated hit list.
fn merge_candidates(
    keyword: &[IndexHit],
    vector: &[IndexHit],
    alpha: f64,
    top_k: usize,
) -> Vec<RetrievalHit> {
    let norm_keyword = normalize_scores(keyword);
    let norm_vector = normalize_scores(vector);

    let kw_map: HashMap<&str, f64> = norm_keyword
        .iter()
        .map(|(c, s)| (c.chunk_id.as_str(), *s))
        .collect();
    let vec_map: HashMap<&str, f64> = norm_vector
        .iter()
        .map(|(c, s)| (c.chunk_id.as_str(), *s))
        .collect();

    let mut all_chunks: HashMap<&str, &IndexHit> = HashMap::new();
    for c in keyword {
        all_chunks.entry(c.chunk_id.as_str()).or_insert(c);
    }
    for c in vector {
        all_chunks.entry(c.chunk_id.as_str()).or_insert(c);
    }

    struct Scored<'a> {
        hit: &'a IndexHit,
        score: f64,
    }

    let mut scored: Vec<Scored> = all_chunks
        .values()
        .map(|&hit| {
            let k = kw_map.get(hit.chunk_id.as_str()).copied().unwrap_or(0.0);
            let v = vec_map.get(hit.chunk_id.as_str()).copied().unwrap_or(0.0);
            Scored {
                hit,
                score: (1.0 - alpha) * k + alpha * v,
            }
        })
        .collect();

    // Score desc, then document recency desc, then chunk id asc: ties are
    // reproducible across runs.
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.hit.ingested_at.cmp(&a.hit.ingested_at))
            .then(a.hit.chunk_id.cmp(&b.hit.chunk_id))
    });
    scored.truncate(top_k);

    scored
        .into_iter()
        .map(|s| RetrievalHit {
            chunk_id: s.hit.chunk_id.clone(),
            document_id: s.hit.document_id.clone(),
            chunk_index: s.hit.chunk_index,
            filename: s.hit.filename.clone(),
            text: s.hit.text.clone(),
            score: s.score,
        })
        .collect()
}

/// Min-max normalize raw scores to `[0.0, 1.0]`. If all scores are equal,
/// they normalize to `1.0`.
fn normalize_scores(candidates: &[IndexHit]) -> Vec<(&IndexHit, f64)> {
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
