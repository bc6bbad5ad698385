//! Configuration loaded from `.codequarry/config.yaml`.
//!
//! Every section has serde defaults so a missing or partial file still yields
//! a working engine. Validation happens once at load; anything invalid is a
//! fatal configuration error surfaced before any indexing starts.

use crate::error::{Error, Result};
use crate::types::sha256_hex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory name under the project root holding config, index, and cache.
pub const DATA_DIR: &str = ".codequarry";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DB_FILE: &str = "index.db";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// "http" (external endpoint) or "hash" (deterministic local fallback).
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    /// Max texts per request; larger inputs are split.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            provider: "http".into(),
            model: "nomic-embed-text".into(),
            endpoint: "http://127.0.0.1:8080/embed".into(),
            api_key: None,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// "ast" (default) or "lines".
    pub strategy: String,
    /// Token budget per chunk.
    pub max_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig { strategy: "ast".into(), max_chunk_size: 512 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerConfig {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    /// Candidate pool fetched before reranking.
    pub candidates: usize,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        RerankerConfig {
            enabled: false,
            provider: "http".into(),
            model: String::new(),
            endpoint: String::new(),
            candidates: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// "vector", "bm25", or "hybrid".
    pub mode: String,
    pub vector_weight: f32,
    pub bm25_weight: f32,
    pub default_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig { mode: "hybrid".into(), vector_weight: 0.7, bm25_weight: 0.3, default_limit: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexFilterConfig {
    /// Include globs; a file must match at least one.
    pub include: Vec<String>,
    /// Exclude globs; matched paths are skipped entirely.
    pub exclude: Vec<String>,
    /// Respect project ignore files (.gitignore semantics).
    pub use_ignore_file: bool,
}

impl Default for IndexFilterConfig {
    fn default() -> Self {
        IndexFilterConfig {
            include: vec!["**/*".into()],
            exclude: vec![
                "**/.git/**".into(),
                "**/node_modules/**".into(),
                "**/target/**".into(),
                "**/dist/**".into(),
                "**/build/**".into(),
                "**/__pycache__/**".into(),
                "**/vendor/**".into(),
                format!("**/{}/**", DATA_DIR),
            ],
            use_ignore_file: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Bytes; larger files are skipped with a warning.
    pub max_file_size: u64,
    /// Scan cutoff; the scan reports truncation past this count.
    pub max_files: usize,
    /// Hard clamp on the per-chunk token budget.
    pub max_chunk_tokens: usize,
    /// Overall indexing timeout in seconds; 0 disables it.
    pub timeout: u64,
    /// Chunking workers; 0 means one per core.
    pub workers: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_file_size: 1024 * 1024,
            max_files: 50_000,
            max_chunk_tokens: 2048,
            timeout: 0,
            workers: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub extract_symbols: bool,
    pub extract_references: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig { extract_symbols: true, extract_references: true }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub reranker: RerankerConfig,
    pub search: SearchConfig,
    pub index: IndexFilterConfig,
    pub limits: LimitsConfig,
    pub analysis: AnalysisConfig,
}

impl Config {
    /// Load from `<root>/.codequarry/config.yaml`, falling back to defaults
    /// when the file is absent. A present-but-invalid file is fatal.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join(DATA_DIR).join(CONFIG_FILE);
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match self.embedding.provider.as_str() {
            "http" => {
                if self.embedding.endpoint.is_empty() {
                    return Err(Error::Config("embedding.endpoint is required for the http provider".into()));
                }
            }
            "hash" => {}
            other => return Err(Error::Config(format!("unknown embedding provider '{other}'"))),
        }
        match self.chunking.strategy.as_str() {
            "ast" | "lines" => {}
            other => return Err(Error::Config(format!("unknown chunking strategy '{other}'"))),
        }
        match self.search.mode.as_str() {
            "vector" | "bm25" | "hybrid" => {}
            other => return Err(Error::Config(format!("unknown search mode '{other}'"))),
        }
        if self.search.vector_weight < 0.0 || self.search.bm25_weight < 0.0 {
            return Err(Error::Config("search weights must be non-negative".into()));
        }
        if self.search.vector_weight + self.search.bm25_weight <= 0.0 {
            return Err(Error::Config("search weights must not both be zero".into()));
        }
        if self.chunking.max_chunk_size == 0 {
            return Err(Error::Config("chunking.max_chunk_size must be positive".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(Error::Config("embedding.batch_size must be positive".into()));
        }
        if self.reranker.enabled && self.reranker.endpoint.is_empty() {
            return Err(Error::Config("reranker.endpoint is required when the reranker is enabled".into()));
        }
        Ok(())
    }

    /// Effective per-chunk token budget: the chunking setting clamped by limits.
    pub fn chunk_token_budget(&self) -> usize {
        self.chunking.max_chunk_size.min(self.limits.max_chunk_tokens)
    }

    /// Chunking worker count (0 = one per core).
    pub fn worker_count(&self) -> usize {
        if self.limits.workers > 0 {
            self.limits.workers
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        }
    }

    /// Hash of the fields that materially affect stored data. A change
    /// invalidates every file-cache row.
    pub fn config_hash(&self) -> String {
        let material = format!(
            "{}|{}|{}|{}",
            self.embedding.provider,
            self.embedding.model,
            self.chunking.strategy,
            self.chunk_token_budget(),
        );
        sha256_hex(material.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// On-disk layout helpers
// ---------------------------------------------------------------------------

pub fn data_dir(project_root: &Path) -> PathBuf {
    project_root.join(DATA_DIR)
}

pub fn db_path(project_root: &Path) -> PathBuf {
    data_dir(project_root).join(DB_FILE)
}

pub fn cache_dir(project_root: &Path) -> PathBuf {
    data_dir(project_root).join("cache")
}

/// Write a commented default config, creating `.codequarry/` as needed.
/// Refuses to clobber an existing file.
pub fn write_default_config(project_root: &Path) -> Result<PathBuf> {
    let dir = data_dir(project_root);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(CONFIG_FILE);
    if path.exists() {
        return Err(Error::Config(format!("{} already exists", path.display())));
    }
    let defaults = serde_yaml::to_string(&Config::default())?;
    let body = format!(
        "# CodeQuarry configuration. Every key is optional; these are the defaults.\n{}",
        defaults
    );
    std::fs::write(&path, body)?;
    Ok(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults must be valid");
    }

    #[test]
    fn bad_provider_is_fatal() {
        let mut c = Config::default();
        c.embedding.provider = "carrier-pigeon".into();
        assert!(matches!(c.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_weights_are_fatal() {
        let mut c = Config::default();
        c.search.vector_weight = 0.0;
        c.search.bm25_weight = 0.0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn config_hash_tracks_material_fields_only() {
        let base = Config::default();
        let mut same = Config::default();
        same.search.default_limit = 99;
        assert_eq!(base.config_hash(), same.config_hash());

        let mut changed = Config::default();
        changed.embedding.model = "other-model".into();
        assert_ne!(base.config_hash(), changed.config_hash());

        let mut strategy = Config::default();
        strategy.chunking.strategy = "lines".into();
        assert_ne!(base.config_hash(), strategy.config_hash());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let raw = "search:\n  mode: bm25\n";
        let c: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(c.search.mode, "bm25");
        assert_eq!(c.embedding.batch_size, 32);
        assert!(c.index.use_ignore_file);
    }

    #[test]
    fn write_default_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_default_config(dir.path()).unwrap();
        assert!(first.exists());
        assert!(write_default_config(dir.path()).is_err());
        // The written file must load back cleanly.
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.search.mode, "hybrid");
    }
}
