//! Shared fixtures for integration tests: temp projects wired to the
//! deterministic hash embedder, so every test runs hermetically.
#![allow(dead_code)]

use codequarry_core::chunker::create_chunker;
use codequarry_core::embed::{EmbeddingProvider, HashEmbedder};
use codequarry_core::error::Result;
use codequarry_core::tokenizer::create_tokenizer;
use codequarry_core::types::CancelToken;
use codequarry_core::{Config, Engine, Indexer, Store};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct TestProject {
    pub dir: tempfile::TempDir,
}

impl TestProject {
    /// A fresh project with a hash-provider config so no network is needed.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config_dir = dir.path().join(".codequarry");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.yaml"),
            "embedding:\n  provider: hash\n  model: feature-hash\nindex:\n  use_ignore_file: false\n",
        )
        .unwrap();
        TestProject { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn engine(&self) -> Engine {
        Engine::open(self.root()).expect("engine opens")
    }

    /// Run a full non-forced index with a fresh cancel token.
    pub fn index(&self) -> codequarry_core::IndexReport {
        let engine = self.engine();
        engine.indexer.index(false, &CancelToken::new(), None).expect("index run")
    }
}

/// Embedding provider that counts calls, for cache-reuse assertions.
pub struct CountingEmbedder {
    inner: HashEmbedder,
    pub calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        CountingEmbedder {
            inner: HashEmbedder::new(dimensions, "feature-hash".into()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl EmbeddingProvider for CountingEmbedder {
    fn name(&self) -> &str {
        "hash"
    }
    fn model(&self) -> &str {
        self.inner.model()
    }
    fn embed(&self, texts: &[String], cancel: &CancelToken) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.embed(texts, cancel)
    }
}

/// Assemble an indexer around an explicit embedder (dimension-mismatch and
/// call-counting tests need to swap it out).
pub fn indexer_with_embedder(
    root: &Path,
    config: &Config,
    store: Arc<Store>,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Indexer {
    let chunker = create_chunker(config, create_tokenizer("bytes-estimate"));
    Indexer::new(root, config.clone(), store, chunker, embedder)
}

pub fn hash_config() -> Config {
    let mut config = Config::default();
    config.embedding.provider = "hash".into();
    config.embedding.model = "feature-hash".into();
    config.index.use_ignore_file = false;
    config
}
