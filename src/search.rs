//! Hybrid retrieval: vector similarity + BM25, merged and re-ranked.
//!
//! For each target collection the retriever over-fetches
//! `top_k * overfetch_factor` candidates from both the vector channel and
//! the keyword channel, scores the union with BM25, min-max normalizes the
//! semantic and lexical distributions independently, and combines them:
//!
//! ```text
//! score = alpha * semantic + (1 - alpha) * lexical + recency
//! recency = recency_weight * 0.5 ^ (age_days / half_life_days)
//! ```
//!
//! Candidates that only the keyword channel returned get a semantic score
//! of 0. The vector channel only compares against entries embedded under
//! the provider's cache namespace. When the query embedding fails, or no
//! matching entry was embedded by the current model, the vector channel is
//! skipped, `alpha` is treated as 0 and the result is flagged `degraded`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::Result;
use crate::lexical;
use crate::models::{Collection, Platform, StoredEntry};
use crate::store::{Hit, MetadataFilter, VectorIndex};

const SECS_PER_DAY: f64 = 86_400.0;

/// Per-signal contributions to a result's final score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Normalized semantic score; `None` when the vector channel did not
    /// return this entry (or was unavailable).
    pub semantic: Option<f64>,
    pub lexical: f64,
    pub recency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub entry: StoredEntry,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Retrieval {
    pub results: Vec<RetrievedChunk>,
    /// True when the semantic channel was skipped because the query could
    /// not be embedded.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

pub struct HybridRetriever {
    index: Arc<dyn VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    params: RetrievalConfig,
    now: Option<i64>,
}

impl HybridRetriever {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        params: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            provider,
            params,
            now: None,
        }
    }

    /// Pin the reference time used by the recency boost (Unix seconds).
    pub fn at_time(mut self, now: i64) -> Self {
        self.now = Some(now);
        self
    }

    pub fn params(&self) -> &RetrievalConfig {
        &self.params
    }

    /// Retrieve from the configured collections.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        platform: Option<Platform>,
    ) -> Result<Retrieval> {
        let collections = self.params.collections.clone();
        self.retrieve_in(query, top_k, platform, &collections).await
    }

    /// Retrieve from an explicit set of collections, one index query each.
    pub async fn retrieve_in(
        &self,
        query: &str,
        top_k: usize,
        platform: Option<Platform>,
        collections: &[Collection],
    ) -> Result<Retrieval> {
        self.retrieve_filtered(query, top_k, &MetadataFilter::platform(platform), collections)
            .await
    }

    /// Search the `code` collection, optionally restricted to one fence
    /// language (case-insensitive).
    pub async fn search_code(
        &self,
        query: &str,
        top_k: usize,
        language: Option<&str>,
        platform: Option<Platform>,
    ) -> Result<Retrieval> {
        let filter = MetadataFilter::platform(platform).with_language(language);
        self.retrieve_filtered(query, top_k, &filter, &[Collection::Code])
            .await
    }

    async fn retrieve_filtered(
        &self,
        query: &str,
        top_k: usize,
        filter: &MetadataFilter,
        collections: &[Collection],
    ) -> Result<Retrieval> {
        if query.trim().is_empty() || top_k == 0 || collections.is_empty() {
            return Ok(Retrieval::default());
        }

        let mut indexed = 0u64;
        for c in collections {
            indexed += self.index.stats(*c).await?.count;
        }
        if indexed == 0 {
            debug!("index is empty; nothing to retrieve");
            return Ok(Retrieval::default());
        }

        let (query_vec, mut degraded_reason) = match embed_query(self.provider.as_ref(), query).await {
            Ok(v) => (Some(v), None),
            Err(e) => {
                warn!(error = %e, "query embedding failed; falling back to lexical retrieval");
                (None, Some(e.to_string()))
            }
        };

        let fetch_k = top_k.saturating_mul(self.params.overfetch_factor.max(1));
        let namespace = self.provider.cache_namespace();

        let mut vector_hits: Vec<Hit> = Vec::new();
        let mut keyword_hits: Vec<Hit> = Vec::new();
        for c in collections {
            if let Some(ref v) = query_vec {
                vector_hits.extend(self.index.query(*c, v, &namespace, fetch_k, filter).await?);
            }
            keyword_hits.extend(
                self.index
                    .keyword_candidates(*c, query, fetch_k, filter)
                    .await?,
            );
        }
        debug!(
            vector = vector_hits.len(),
            keyword = keyword_hits.len(),
            "retrieval candidates"
        );

        // Entries exist but none carry a vector from this model.
        if query_vec.is_some() && vector_hits.is_empty() && !keyword_hits.is_empty() {
            warn!(model = %namespace, "no entries embedded with the current model; using keyword matching");
            degraded_reason = Some(format!(
                "no indexed entries were embedded with {}; re-ingest to enable semantic search",
                namespace
            ));
        }

        let alpha = if degraded_reason.is_none() {
            self.params.hybrid_alpha
        } else {
            0.0
        };
        let now = self.now.unwrap_or_else(|| chrono::Utc::now().timestamp());

        let mut results = self.rerank(query, vector_hits, keyword_hits, alpha, now);
        results.truncate(top_k);

        Ok(Retrieval {
            results,
            degraded: degraded_reason.is_some(),
            degraded_reason,
        })
    }

    fn rerank(
        &self,
        query: &str,
        vector_hits: Vec<Hit>,
        keyword_hits: Vec<Hit>,
        alpha: f64,
        now: i64,
    ) -> Vec<RetrievedChunk> {
        let vector_norm = normalize_scores(&vector_hits.iter().map(|h| h.score).collect::<Vec<_>>());

        // Union keyed by entry identity; the vector channel wins on overlap.
        let mut order: Vec<CandidateKey> = Vec::new();
        let mut pool: HashMap<CandidateKey, (StoredEntry, Option<f64>)> = HashMap::new();
        for (hit, norm) in vector_hits.into_iter().zip(vector_norm) {
            let key = candidate_key(&hit.entry);
            if !pool.contains_key(&key) {
                order.push(key.clone());
                pool.insert(key, (hit.entry, Some(norm)));
            }
        }
        for hit in keyword_hits {
            let key = candidate_key(&hit.entry);
            if !pool.contains_key(&key) {
                order.push(key.clone());
                pool.insert(key, (hit.entry, None));
            }
        }

        let candidates: Vec<(StoredEntry, Option<f64>)> =
            order.iter().filter_map(|k| pool.remove(k)).collect();

        let texts: Vec<&str> = candidates.iter().map(|(e, _)| e.text.as_str()).collect();
        let lexical_norm = normalize_scores(&lexical::bm25_scores(query, &texts));

        let mut results: Vec<RetrievedChunk> = candidates
            .into_iter()
            .zip(lexical_norm)
            .map(|((entry, semantic), lexical)| {
                let recency = self.recency_boost(entry.metadata.timestamp, now);
                let score = alpha * semantic.unwrap_or(0.0) + (1.0 - alpha) * lexical + recency;
                RetrievedChunk {
                    entry,
                    score,
                    breakdown: ScoreBreakdown {
                        semantic,
                        lexical,
                        recency,
                    },
                }
            })
            .collect();

        results.sort_by(compare_results);
        results
    }

    /// Exponential decay in `[0, recency_weight]`; future timestamps count
    /// as age zero.
    fn recency_boost(&self, timestamp: i64, now: i64) -> f64 {
        if self.params.recency_weight <= 0.0 {
            return 0.0;
        }
        let age_days = (now - timestamp).max(0) as f64 / SECS_PER_DAY;
        self.params.recency_weight * 0.5f64.powf(age_days / self.params.recency_half_life_days)
    }
}

type CandidateKey = (Collection, Platform, String, String);

fn candidate_key(entry: &StoredEntry) -> CandidateKey {
    (
        entry.metadata.collection,
        entry.metadata.platform,
        entry.metadata.conversation_id.clone(),
        entry.content_hash.clone(),
    )
}

fn compare_results(a: &RetrievedChunk, b: &RetrievedChunk) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(b.entry.metadata.timestamp.cmp(&a.entry.metadata.timestamp))
        .then(a.entry.content_hash.cmp(&b.entry.content_hash))
        .then(a.entry.metadata.platform.cmp(&b.entry.metadata.platform))
        .then(
            a.entry
                .metadata
                .conversation_id
                .cmp(&b.entry.metadata.conversation_id),
        )
}

/// Min-max normalize to `[0, 1]`. A distribution with no spread maps to 1.0.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }

    let s_min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    scores
        .iter()
        .map(|s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}
