//! Reranker client: second-stage cross-encoder scoring of a search shortlist.
//!
//! Optional component: when unconfigured, the search engine skips reranking
//! with no contract change, and any reranker failure degrades silently back
//! to the pre-rerank ordering.

use crate::config::Config;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Per-document relevance score, preserving the caller's document index.
#[derive(Debug, Clone, Copy)]
pub struct RerankScore {
    pub index: usize,
    pub score: f32,
}

pub trait RerankProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    /// Score `documents` against `query`. Output order is unspecified;
    /// `index` ties each score back to its input document.
    fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<RerankScore>>;
}

/// Build the configured provider, or `None` when reranking is disabled.
pub fn create_reranker(config: &Config) -> Result<Option<Arc<dyn RerankProvider>>> {
    if !config.reranker.enabled {
        return Ok(None);
    }
    match config.reranker.provider.as_str() {
        "http" => Ok(Some(Arc::new(HttpReranker::new(config)?))),
        other => Err(Error::Config(format!("unknown reranker provider '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

/// Documents per request; larger shortlists are scored in slices.
const MAX_DOCS_PER_REQUEST: usize = 32;
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Deserialize)]
struct RerankResponseItem {
    index: usize,
    relevance_score: f32,
}

#[derive(Deserialize)]
struct RerankResponse {
    #[serde(default)]
    results: Vec<RerankResponseItem>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpReranker {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
}

impl HttpReranker {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Embedding(e.to_string()))?;
        Ok(HttpReranker {
            client,
            endpoint: config.reranker.endpoint.clone(),
            model: config.reranker.model.clone(),
        })
    }
}

impl RerankProvider for HttpReranker {
    fn name(&self) -> &str {
        "http"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<RerankScore>> {
        let mut scores = Vec::with_capacity(documents.len());
        for (slice_idx, slice) in documents.chunks(MAX_DOCS_PER_REQUEST).enumerate() {
            let body = serde_json::json!({
                "model": self.model,
                "query": query,
                "documents": slice,
            });
            let resp = self
                .client
                .post(&self.endpoint)
                .json(&body)
                .send()
                .map_err(|e| Error::Embedding(format!("reranker: {e}")))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(Error::Embedding(format!("reranker HTTP {status}")));
            }
            let parsed: RerankResponse =
                resp.json().map_err(|e| Error::Embedding(format!("reranker: {e}")))?;
            if let Some(msg) = parsed.error {
                return Err(Error::Embedding(format!("reranker: {msg}")));
            }
            let offset = slice_idx * MAX_DOCS_PER_REQUEST;
            for item in parsed.results {
                if item.index < slice.len() {
                    scores.push(RerankScore { index: offset + item.index, score: item.relevance_score });
                }
            }
        }
        Ok(scores)
    }
}
