//! Embedding providers: batched vectorization of chunk text.
//!
//! The `http` provider speaks the external endpoint contract
//! (`POST {model, input}` → `{embeddings}`), splitting oversized inputs into
//! provider-sized batches and running a bounded number of requests in
//! parallel. The `hash` provider is a deterministic local feature-hash
//! embedder used for offline smoke runs and tests.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::CancelToken;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

/// A polymorphic embedding capability: implementations are chosen at startup
/// from configuration.
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    /// Preflight check; must be correct as a no-op.
    fn warmup(&self) -> Result<()> {
        Ok(())
    }

    /// Embed `texts`, preserving input order. Every returned vector has the
    /// same length; the first successful call fixes that length for the store.
    fn embed(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>>;
}

/// Build the configured provider.
pub fn create_embedder(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.embedding.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(256, config.embedding.model.clone()))),
        "http" => Ok(Arc::new(HttpEmbedder::new(config)?)),
        other => Err(Error::Config(format!("unknown embedding provider '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

const MAX_ATTEMPTS: u32 = 4;
const BACKOFF_BASE_MS: u64 = 500;
const REQUEST_TIMEOUT_SECS: u64 = 120;
/// Concurrent in-flight batches.
const CONCURRENT_BATCHES: usize = 4;

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    batch_size: usize,
}

impl HttpEmbedder {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Embedding(e.to_string()))?;
        Ok(HttpEmbedder {
            client,
            endpoint: config.embedding.endpoint.clone(),
            model: config.embedding.model.clone(),
            api_key: config.embedding.api_key.clone(),
            batch_size: config.embedding.batch_size.max(1),
        })
    }

    /// One request with retry on transient failures (network, 429, 5xx).
    fn request_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });

        let mut last_err = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = BACKOFF_BASE_MS * (1 << (attempt - 1));
                debug!(attempt, backoff_ms = backoff, "retrying embedding batch");
                std::thread::sleep(Duration::from_millis(backoff));
            }

            let mut req = self.client.post(&self.endpoint).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            let resp = match req.send() {
                Ok(r) => r,
                Err(e) => {
                    last_err = e.to_string();
                    continue; // network errors are transient
                }
            };

            let status = resp.status();
            if status.is_server_error() || status.as_u16() == 429 {
                last_err = format!("HTTP {status}");
                continue;
            }
            if !status.is_success() {
                // auth failures, model-not-found: surface immediately
                let detail = resp.text().unwrap_or_default();
                return Err(Error::Embedding(format!("HTTP {status}: {detail}")));
            }

            let parsed: EmbedResponse =
                resp.json().map_err(|e| Error::Embedding(format!("bad response: {e}")))?;
            if let Some(msg) = parsed.error {
                return Err(Error::Embedding(msg));
            }
            if parsed.embeddings.len() != texts.len() {
                return Err(Error::Embedding(format!(
                    "endpoint returned {} vectors for {} inputs",
                    parsed.embeddings.len(),
                    texts.len()
                )));
            }
            if let Some(first) = parsed.embeddings.first() {
                let dim = first.len();
                if dim == 0 || parsed.embeddings.iter().any(|v| v.len() != dim) {
                    return Err(Error::Embedding("endpoint returned ragged vectors".into()));
                }
            }
            return Ok(parsed.embeddings);
        }

        Err(Error::Embedding(format!("gave up after {MAX_ATTEMPTS} attempts: {last_err}")))
    }
}

impl EmbeddingProvider for HttpEmbedder {
    fn name(&self) -> &str {
        "http"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn warmup(&self) -> Result<()> {
        // A single empty-input probe; endpoints that reject empty input still
        // prove reachability, so only connection-level failures surface.
        let probe = self.request_batch(&["warmup".to_string()]);
        match probe {
            Ok(_) => Ok(()),
            Err(Error::Embedding(msg)) if msg.starts_with("gave up") => {
                Err(Error::Embedding(format!("endpoint unreachable: {msg}")))
            }
            Err(_) => Ok(()),
        }
    }

    fn embed(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<&[String]> = texts.chunks(self.batch_size).collect();
        let mut results: Vec<Option<Vec<Vec<f32>>>> = vec![None; batches.len()];

        // Bounded fan-out: waves of up to CONCURRENT_BATCHES requests, with a
        // cancel check between waves (in-flight requests are simply dropped).
        for (wave_idx, wave) in batches.chunks(CONCURRENT_BATCHES).enumerate() {
            if cancel.is_canceled() {
                return Err(Error::Canceled);
            }
            let wave_results: Vec<(usize, Result<Vec<Vec<f32>>>)> = std::thread::scope(|s| {
                let handles: Vec<_> = wave
                    .iter()
                    .enumerate()
                    .map(|(i, batch)| {
                        let idx = wave_idx * CONCURRENT_BATCHES + i;
                        s.spawn(move || (idx, self.request_batch(batch)))
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().expect("embed worker panicked")).collect()
            });
            for (idx, result) in wave_results {
                results[idx] = Some(result?);
            }
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in results.into_iter().flatten() {
            vectors.extend(batch);
        }

        // Cross-batch dimension agreement
        if let Some(first) = vectors.first() {
            let dim = first.len();
            if vectors.iter().any(|v| v.len() != dim) {
                return Err(Error::Embedding("batches returned differing dimensions".into()));
            }
        }
        if vectors.len() != texts.len() {
            warn!(got = vectors.len(), want = texts.len(), "embedding count mismatch");
            return Err(Error::Embedding("endpoint dropped inputs".into()));
        }
        Ok(vectors)
    }
}

// ---------------------------------------------------------------------------
// Deterministic hash provider
// ---------------------------------------------------------------------------

/// Feature-hash embedder: identifier tokens and their character trigrams are
/// hashed into a fixed number of buckets, then L2-normalized. No network, no
/// model files, identical output on every run.
pub struct HashEmbedder {
    dimensions: usize,
    model: String,
}

impl HashEmbedder {
    pub fn new(dimensions: usize, model: String) -> Self {
        HashEmbedder { dimensions, model }
    }

    fn bucket(&self, feature: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        feature.hash(&mut hasher);
        (hasher.finish() as usize) % self.dimensions
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0f32; self.dimensions];
        for token in tokenize_identifiers(text) {
            vec[self.bucket(&token)] += 2.0;
            let bytes = token.as_bytes();
            if bytes.len() > 3 {
                for gram in bytes.windows(3) {
                    if let Ok(g) = std::str::from_utf8(gram) {
                        vec[self.bucket(g)] += 1.0;
                    }
                }
            }
        }
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn name(&self) -> &str {
        "hash"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn embed(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>> {
        if cancel.is_canceled() {
            return Err(Error::Canceled);
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Lowercased identifier tokens, split on non-identifier characters, minimum
/// length 2. The store's inverted index uses the same rule.
pub fn tokenize_identifiers(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() || c == '_' {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            if current.len() >= 2 {
                tokens.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.len() >= 2 {
        tokens.push(current);
    }
    tokens
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_lowercases_and_drops_short_tokens() {
        let tokens = tokenize_identifiers("fmt.Println(\"Hi\") + x");
        assert_eq!(tokens, vec!["fmt", "println", "hi"]);
    }

    #[test]
    fn hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(64, "test".into());
        let cancel = CancelToken::new();
        let a = e.embed(&["fn main() { greet() }".into()], &cancel).unwrap();
        let b = e.embed(&["fn main() { greet() }".into()], &cancel).unwrap();
        assert_eq!(a, b);
        let norm: f32 = a[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_embedder_ranks_related_text_higher() {
        let e = HashEmbedder::new(256, "test".into());
        let cancel = CancelToken::new();
        let vecs = e
            .embed(
                &[
                    "print greeting".into(),
                    "func greet() { fmt.Println(\"hi\") }".into(),
                    "func parse(tokens []Token) error".into(),
                ],
                &cancel,
            )
            .unwrap();
        let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        let to_greet = dot(&vecs[0], &vecs[1]);
        let to_parse = dot(&vecs[0], &vecs[2]);
        assert!(to_greet > to_parse, "greet {to_greet} should beat parse {to_parse}");
    }

    #[test]
    fn canceled_embed_returns_canceled() {
        let e = HashEmbedder::new(16, "test".into());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(e.embed(&["x".into()], &cancel), Err(Error::Canceled)));
    }
}
