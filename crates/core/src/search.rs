//! Hybrid search: BM25 and vector retrieval, min-max score fusion, optional
//! reranking, and source-context attachment.
//!
//! Determinism contract: identical inputs against identical store state give
//! identical results. Every sort is stable and ties fall back to the
//! original candidate ordering (vector list first, then BM25).

use crate::embed::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::rerank::RerankProvider;
use crate::store::{SearchFilters, Store};
use crate::types::{CancelToken, Chunk};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Request / result shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Vector,
    Bm25,
    Hybrid,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector" => Some(SearchMode::Vector),
            "bm25" => Some(SearchMode::Bm25),
            "hybrid" => Some(SearchMode::Hybrid),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Bm25 => "bm25",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query_text: String,
    /// Supplied by callers that already hold an embedding; otherwise the
    /// engine embeds `query_text`.
    pub query_vector: Option<Vec<f32>>,
    pub limit: usize,
    pub mode: SearchMode,
    pub vector_weight: f32,
    pub bm25_weight: f32,
    pub filters: SearchFilters,
    pub use_reranker: bool,
    pub rerank_candidates: usize,
    pub include_context: bool,
    pub context_lines: usize,
}

impl SearchRequest {
    /// A request seeded with the configured defaults.
    pub fn from_config(config: &crate::config::Config, query: &str) -> Self {
        SearchRequest {
            query_text: query.to_string(),
            query_vector: None,
            limit: config.search.default_limit,
            mode: SearchMode::parse(&config.search.mode).unwrap_or(SearchMode::Hybrid),
            vector_weight: config.search.vector_weight,
            bm25_weight: config.search.bm25_weight,
            filters: SearchFilters::default(),
            use_reranker: config.reranker.enabled,
            rerank_candidates: config.reranker.candidates,
            include_context: false,
            context_lines: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    /// Final ranking score (fused, then rerank-blended when active).
    pub score: f32,
    pub vector_score: Option<f32>,
    pub bm25_score: Option<f32>,
    pub rerank_score: Option<f32>,
    /// Source lines preceding/following the chunk, when requested.
    pub context_before: Option<String>,
    pub context_after: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SearchEngine {
    project_root: PathBuf,
    store: Arc<Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn RerankProvider>>,
}

/// Weight of the rerank score when blended with the fused retrieval score.
const RERANK_BLEND: f32 = 0.7;

struct Candidate {
    chunk: Chunk,
    vector_raw: Option<f32>,
    bm25_raw: Option<f32>,
}

impl SearchEngine {
    pub fn new(
        project_root: &Path,
        store: Arc<Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        reranker: Option<Arc<dyn RerankProvider>>,
    ) -> Self {
        SearchEngine { project_root: project_root.to_path_buf(), store, embedder, reranker }
    }

    pub fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        if request.limit == 0 || request.query_text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let k = request
            .limit
            .max(if request.use_reranker { request.rerank_candidates } else { 0 });

        // 1. Query embedding (vector and hybrid modes). Embedder failure fails
        //    the query; there is no silent degradation on this side.
        let query_vector = if request.mode != SearchMode::Bm25 {
            match &request.query_vector {
                Some(v) => Some(v.clone()),
                None => {
                    let cancel = CancelToken::new();
                    let mut vecs = self.embedder.embed(&[request.query_text.clone()], &cancel)?;
                    Some(vecs.pop().ok_or_else(|| {
                        Error::Embedding("no vector returned for query".into())
                    })?)
                }
            }
        } else {
            None
        };

        // 2. Retrieval.
        let vector_hits = match (&query_vector, request.mode) {
            (Some(qv), SearchMode::Vector | SearchMode::Hybrid) => {
                self.store.vector_search(qv, k, &request.filters)?
            }
            _ => Vec::new(),
        };
        let bm25_hits = match request.mode {
            SearchMode::Bm25 | SearchMode::Hybrid => {
                self.store.bm25_search(&request.query_text, k, &request.filters)?
            }
            _ => Vec::new(),
        };

        // 3. Fusion over the candidate union, vector-list order first.
        let vector_scores: Vec<f32> = vector_hits.iter().map(|(_, s)| *s).collect();
        let bm25_scores: Vec<f32> = bm25_hits.iter().map(|(_, s)| *s).collect();
        let vector_norm = min_max_normalize(vector_scores.into_iter());
        let bm25_norm = min_max_normalize(bm25_scores.into_iter());

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();
        for (chunk, raw) in vector_hits {
            by_id.insert(chunk.id.clone(), candidates.len());
            candidates.push(Candidate { chunk, vector_raw: Some(raw), bm25_raw: None });
        }
        for (chunk, raw) in bm25_hits {
            match by_id.get(&chunk.id) {
                Some(&idx) => candidates[idx].bm25_raw = Some(raw),
                None => {
                    by_id.insert(chunk.id.clone(), candidates.len());
                    candidates.push(Candidate { chunk, vector_raw: None, bm25_raw: Some(raw) });
                }
            }
        }

        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            .map(|c| {
                let v = c.vector_raw.map(|s| vector_norm(s));
                let b = c.bm25_raw.map(|s| bm25_norm(s));
                let fused = match request.mode {
                    SearchMode::Vector => v.unwrap_or(0.0),
                    SearchMode::Bm25 => b.unwrap_or(0.0),
                    SearchMode::Hybrid => {
                        request.vector_weight * v.unwrap_or(0.0)
                            + request.bm25_weight * b.unwrap_or(0.0)
                    }
                };
                SearchResult {
                    chunk: c.chunk,
                    score: fused,
                    vector_score: c.vector_raw,
                    bm25_score: c.bm25_raw,
                    rerank_score: None,
                    context_before: None,
                    context_after: None,
                }
            })
            .collect();

        // Stable: equal fused scores keep candidate-union order.
        results.sort_by(|a, b| {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
        });

        // 4. Optional rerank; failure logs and keeps the pre-rerank ordering.
        if request.use_reranker && !results.is_empty() {
            if let Some(reranker) = &self.reranker {
                match self.apply_rerank(reranker.as_ref(), &request.query_text, &mut results) {
                    Ok(()) => {}
                    Err(e) => warn!(error = %e, "reranker failed, keeping retrieval order"),
                }
            }
        }

        // 5. Truncate.
        results.truncate(request.limit);

        // 6. Context attachment.
        if request.include_context {
            for result in &mut results {
                self.attach_context(result, request.context_lines);
            }
        }

        debug!(results = results.len(), mode = request.mode.label(), "search complete");
        Ok(results)
    }

    fn apply_rerank(
        &self,
        reranker: &dyn RerankProvider,
        query: &str,
        results: &mut [SearchResult],
    ) -> Result<()> {
        let documents: Vec<String> = results.iter().map(|r| r.chunk.content.clone()).collect();
        let scores = reranker.rerank(query, &documents)?;

        let norm = min_max_normalize(scores.iter().map(|s| s.score));
        for s in &scores {
            if let Some(result) = results.get_mut(s.index) {
                result.rerank_score = Some(s.score);
                result.score = (1.0 - RERANK_BLEND) * result.score + RERANK_BLEND * norm(s.score);
            }
        }
        results.sort_by(|a, b| {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(())
    }

    fn attach_context(&self, result: &mut SearchResult, context_lines: usize) {
        let path = self.project_root.join(&result.chunk.file_path);
        let Ok(content) = std::fs::read_to_string(&path) else {
            return;
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = result.chunk.start_line.saturating_sub(1); // 0-based
        let end = result.chunk.end_line.min(lines.len()); // exclusive

        let before_start = start.saturating_sub(context_lines);
        if before_start < start {
            result.context_before = Some(lines[before_start..start].join("\n"));
        }
        let after_end = (end + context_lines).min(lines.len());
        if end < after_end {
            result.context_after = Some(lines[end..after_end].join("\n"));
        }
    }
}

/// Min-max normalization into [0,1] across a candidate list. Degenerate lists
/// (one candidate, or all scores equal) normalize to 1.0.
fn min_max_normalize(scores: impl Iterator<Item = f32>) -> impl Fn(f32) -> f32 {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    let mut any = false;
    for s in scores {
        any = true;
        min = min.min(s);
        max = max.max(s);
    }
    move |s: f32| {
        if !any {
            return 0.0;
        }
        if (max - min).abs() < f32::EPSILON {
            1.0
        } else {
            (s - min) / (max - min)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_maps_range_to_unit_interval() {
        let norm = min_max_normalize([2.0f32, 4.0, 6.0].into_iter());
        assert_eq!(norm(2.0), 0.0);
        assert_eq!(norm(6.0), 1.0);
        assert!((norm(4.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn min_max_degenerate_list_is_one() {
        let norm = min_max_normalize([3.0f32].into_iter());
        assert_eq!(norm(3.0), 1.0);
        let empty = min_max_normalize(std::iter::empty::<f32>());
        assert_eq!(empty(1.0), 0.0);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(SearchMode::parse("hybrid"), Some(SearchMode::Hybrid));
        assert_eq!(SearchMode::parse("bm25"), Some(SearchMode::Bm25));
        assert_eq!(SearchMode::parse("vector"), Some(SearchMode::Vector));
        assert_eq!(SearchMode::parse("keyword"), None);
    }
}
