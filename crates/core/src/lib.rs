//! CodeQuarry core — project-scoped semantic code search and analysis.
//!
//! The pipeline: the scanner walks the project under include/exclude filters,
//! the chunker splits files into code-aware chunks with symbols and
//! references, the embedding client vectorizes chunk text, and the store
//! persists everything into one SQLite index. The search engine answers
//! hybrid BM25+vector queries over that store; the graph service answers
//! callers/callees, entry-point, and fuzzy-lookup questions from the same
//! rows.

pub mod chunker;
pub mod config;
pub mod embed;
pub mod error;
pub mod fuzzy;
pub mod graph;
pub mod index;
pub mod rerank;
pub mod scan;
pub mod search;
pub mod store;
pub mod tokenizer;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use index::{IndexReport, Indexer, ProgressEvent};
pub use search::{SearchEngine, SearchMode, SearchRequest, SearchResult};
pub use store::{SearchFilters, Store};
pub use types::{CancelToken, Chunk, ChunkType, IndexStats, RefKind, Reference, Symbol, SymbolKind};

use std::path::Path;
use std::sync::Arc;

/// Assembled engine handles for one project: everything the CLI (or another
/// front end) needs to index and query.
pub struct Engine {
    pub config: Config,
    pub store: Arc<Store>,
    pub indexer: Indexer,
    pub search: SearchEngine,
    pub graph: graph::GraphService,
}

impl Engine {
    /// Load configuration, open (or rebuild) the store, and wire the
    /// components. Schema-mismatched stores are rebuilt; the first index run
    /// then repopulates them from scratch.
    pub fn open(project_root: &Path) -> Result<Engine> {
        let config = Config::load(project_root)?;
        std::fs::create_dir_all(config::cache_dir(project_root))?;
        let (store, rebuilt) = Indexer::open_store(&config::db_path(project_root))?;
        if rebuilt {
            tracing::info!("index store was rebuilt; next run performs a full reindex");
        }
        let store = Arc::new(store);

        let tokenizer = tokenizer::create_tokenizer("bytes-estimate");
        let chunker = chunker::create_chunker(&config, tokenizer);
        let embedder = embed::create_embedder(&config)?;
        let reranker = rerank::create_reranker(&config)?;

        let indexer = Indexer::new(
            project_root,
            config.clone(),
            store.clone(),
            chunker,
            embedder.clone(),
        );
        let search = SearchEngine::new(project_root, store.clone(), embedder, reranker);
        let graph = graph::GraphService::new(store.clone());

        Ok(Engine { config, store, indexer, search, graph })
    }
}
