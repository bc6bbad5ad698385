//! The incremental indexing pipeline: scan → chunk → embed → store.
//!
//! Three stages connected by bounded queues. A single producer reads and
//! hashes files, `W` workers chunk them, and a batcher embeds chunk texts and
//! commits one file per transaction. Bounded capacities mean a slow embedder
//! throttles the upstream stages instead of buffering the whole project.
//!
//! Cancellation is cooperative: the token is consulted at every queue
//! boundary, before each embedding batch, and before each store transaction,
//! so an interrupted run leaves the store consistent and resumable.

use crate::chunker::{Chunker, SourceFile};
use crate::config::Config;
use crate::embed::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::scan::Scanner;
use crate::store::Store;
use crate::types::{
    sha256_hex, unix_now, CancelToken, FileBundle, IndexMetadata, SCHEMA_VERSION, TOOL_VERSION,
};
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPhase {
    Scanning,
    Indexing,
    Resolving,
    Done,
}

impl IndexPhase {
    pub fn label(&self) -> &'static str {
        match self {
            IndexPhase::Scanning => "scanning",
            IndexPhase::Indexing => "indexing",
            IndexPhase::Resolving => "resolving",
            IndexPhase::Done => "done",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub phase: IndexPhase,
    pub total_files: usize,
    pub processed_files: usize,
    pub total_chunks: usize,
    pub processed_chunks: usize,
    pub current_file: Option<String>,
    pub error: Option<String>,
}

pub type ProgressCallback = dyn Fn(&ProgressEvent) + Send + Sync;

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct IndexReport {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_cached: usize,
    pub files_deleted: usize,
    pub files_failed: usize,
    pub chunks_indexed: usize,
    pub references_resolved: usize,
    /// Per-file problems; these never fail the run.
    pub warnings: Vec<String>,
    /// Scan hit the `max_files` cutoff.
    pub truncated: bool,
    /// Canceled or timed out; rerun to resume.
    pub interrupted: bool,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Pipeline messages
// ---------------------------------------------------------------------------

struct ChunkTask {
    rel_path: String,
    ext: String,
    content_hash: String,
    content: String,
}

enum BundleMsg {
    Bundle(FileBundle),
    Failed { rel_path: String, reason: String },
}

/// Flush the embed batcher this often even when under the batch size.
const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

pub struct Indexer {
    project_root: PathBuf,
    config: Config,
    store: Arc<Store>,
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Indexer {
    pub fn new(
        project_root: &Path,
        config: Config,
        store: Arc<Store>,
        chunker: Arc<dyn Chunker>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Indexer { project_root: project_root.to_path_buf(), config, store, chunker, embedder }
    }

    /// Open the store, rebuilding from scratch on a schema-version mismatch.
    /// Returns the store and whether a rebuild happened (forcing a full pass).
    pub fn open_store(db_path: &Path) -> Result<(Store, bool)> {
        match Store::open(db_path) {
            Ok(store) => Ok((store, false)),
            Err(Error::SchemaMismatch { found, expected }) => {
                warn!(found, expected, "schema mismatch, rebuilding index");
                Ok((Store::rebuild(db_path)?, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Ingest the project. With `force`, every file is re-chunked and
    /// re-embedded regardless of cache state.
    pub fn index(
        &self,
        force: bool,
        cancel: &CancelToken,
        progress: Option<&ProgressCallback>,
    ) -> Result<IndexReport> {
        let start = Instant::now();
        let deadline = if self.config.limits.timeout > 0 {
            Some(start + Duration::from_secs(self.config.limits.timeout))
        } else {
            None
        };
        let config_hash = self.config.config_hash();
        let mut report = IndexReport::default();

        let emit = |event: ProgressEvent| {
            if let Some(cb) = progress {
                cb(&event);
            }
        };

        // -- scan -------------------------------------------------------------
        emit(ProgressEvent {
            phase: IndexPhase::Scanning,
            total_files: 0,
            processed_files: 0,
            total_chunks: 0,
            processed_chunks: 0,
            current_file: None,
            error: None,
        });
        let scan = Scanner::new(&self.project_root, &self.config).scan()?;
        report.files_scanned = scan.files.len();
        report.truncated = scan.truncated;
        if scan.truncated {
            report
                .warnings
                .push(format!("scan truncated at {} files", self.config.limits.max_files));
        }

        // -- deletions ----------------------------------------------------------
        // Files that vanished (or fell out of the filters) lose all their rows.
        // Skipped when the scan is truncated: absence proves nothing then.
        let cache = self.store.get_all_file_hashes()?;
        if !scan.truncated {
            let scanned: std::collections::HashSet<&str> =
                scan.files.iter().map(|f| f.rel_path.as_str()).collect();
            for stale in cache.keys().filter(|k| !scanned.contains(k.as_str())) {
                if cancel.is_canceled() {
                    report.interrupted = true;
                    report.duration_ms = start.elapsed().as_millis() as u64;
                    return Ok(report);
                }
                self.store.delete_file(stale)?;
                report.files_deleted += 1;
            }
        }

        // -- classification -----------------------------------------------------
        // Hash every candidate and split cached files from real work.
        let mut tasks: Vec<(String, String, String)> = Vec::new(); // (rel, ext, hash)
        for file in &scan.files {
            if cancel.is_canceled() || past(deadline) {
                report.interrupted = true;
                report.duration_ms = start.elapsed().as_millis() as u64;
                return Ok(report);
            }
            let bytes = match std::fs::read(&file.abs_path) {
                Ok(b) => b,
                Err(e) => {
                    report.files_failed += 1;
                    report.warnings.push(format!("{}: {e}", file.rel_path));
                    continue;
                }
            };
            let hash = sha256_hex(&bytes);
            let hit = !force
                && cache.get(&file.rel_path).is_some_and(|entry| {
                    entry.content_hash == hash && entry.config_hash == config_hash
                });
            if hit {
                self.store.touch_file_cache(&file.rel_path, &hash, &config_hash)?;
                report.files_cached += 1;
            } else {
                tasks.push((file.rel_path.clone(), file.ext.clone(), hash));
            }
        }

        let total_files = tasks.len();
        info!(
            scanned = report.files_scanned,
            cached = report.files_cached,
            to_index = total_files,
            deleted = report.files_deleted,
            "classification complete"
        );

        if total_files > 0 {
            // Fix (or verify) the vector dimension before any writes, so a
            // model swap aborts with the prior data intact.
            let dims = self.probe_dimensions(force, cancel)?;
            self.run_pipeline(
                tasks,
                dims,
                &config_hash,
                cancel,
                deadline,
                progress,
                &mut report,
            )?;
        }

        // -- reference resolution ----------------------------------------------
        if !report.interrupted {
            emit(ProgressEvent {
                phase: IndexPhase::Resolving,
                total_files,
                processed_files: report.files_indexed,
                total_chunks: report.chunks_indexed,
                processed_chunks: report.chunks_indexed,
                current_file: None,
                error: None,
            });
            report.references_resolved = self.store.resolve_references()?;
            self.finalize_metadata(&config_hash)?;
        }

        emit(ProgressEvent {
            phase: IndexPhase::Done,
            total_files,
            processed_files: report.files_indexed,
            total_chunks: report.chunks_indexed,
            processed_chunks: report.chunks_indexed,
            current_file: None,
            error: None,
        });
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            indexed = report.files_indexed,
            cached = report.files_cached,
            failed = report.files_failed,
            chunks = report.chunks_indexed,
            resolved = report.references_resolved,
            interrupted = report.interrupted,
            duration_ms = report.duration_ms,
            "index run finished"
        );
        Ok(report)
    }

    /// Learn the provider's dimension from a probe call and reconcile it with
    /// the stored metadata. A changed dimension is fatal on a non-forced run.
    fn probe_dimensions(&self, force: bool, cancel: &CancelToken) -> Result<usize> {
        self.embedder.warmup()?;
        let probe = self.embedder.embed(&["dimension probe".to_string()], cancel)?;
        let dims = probe.first().map(|v| v.len()).unwrap_or(0);
        if dims == 0 {
            return Err(Error::Embedding("provider returned an empty vector".into()));
        }

        let stored = self.store.get_metadata()?.map(|m| m.embedding_dimensions).unwrap_or(0);
        if stored > 0 && stored != dims {
            if !force {
                return Err(Error::DimensionMismatch { expected: stored, actual: dims });
            }
            debug!(old = stored, new = dims, "forced run adopts new embedding dimension");
        }

        if self.store.get_metadata()?.is_none() {
            self.store.set_metadata(&self.fresh_metadata(dims))?;
        } else {
            self.store.set_embedding_dimensions(dims)?;
        }
        Ok(dims)
    }

    fn fresh_metadata(&self, dims: usize) -> IndexMetadata {
        let now = unix_now();
        IndexMetadata {
            schema_version: SCHEMA_VERSION,
            tool_version: TOOL_VERSION.to_string(),
            embedding_provider: self.embedder.name().to_string(),
            embedding_model: self.embedder.model().to_string(),
            embedding_dimensions: dims,
            chunking_strategy: self.chunker.name().to_string(),
            reranker_model: if self.config.reranker.enabled {
                Some(self.config.reranker.model.clone())
            } else {
                None
            },
            config_hash: self.config.config_hash(),
            created_at: now,
            last_updated: now,
        }
    }

    fn finalize_metadata(&self, config_hash: &str) -> Result<()> {
        let mut meta = self
            .store
            .get_metadata()?
            .unwrap_or_else(|| self.fresh_metadata(0));
        meta.tool_version = TOOL_VERSION.to_string();
        meta.embedding_provider = self.embedder.name().to_string();
        meta.embedding_model = self.embedder.model().to_string();
        meta.chunking_strategy = self.chunker.name().to_string();
        meta.reranker_model = if self.config.reranker.enabled {
            Some(self.config.reranker.model.clone())
        } else {
            None
        };
        meta.config_hash = config_hash.to_string();
        meta.last_updated = unix_now();
        self.store.set_metadata(&meta)
    }

    // -- the bounded pipeline -------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn run_pipeline(
        &self,
        tasks: Vec<(String, String, String)>,
        dims: usize,
        config_hash: &str,
        cancel: &CancelToken,
        deadline: Option<Instant>,
        progress: Option<&ProgressCallback>,
        report: &mut IndexReport,
    ) -> Result<()> {
        let workers = self.config.worker_count();
        let queue_cap = workers * 4;
        let total_files = tasks.len();
        let root = self.project_root.clone();

        std::thread::scope(|scope| -> Result<()> {
            let (chunk_tx, chunk_rx) = bounded::<ChunkTask>(queue_cap);
            let (bundle_tx, bundle_rx) = bounded::<BundleMsg>(queue_cap);

            // Stage A: read + decode. Hashes were computed during
            // classification; rereading keeps only the in-flight window in memory.
            let producer_cancel = cancel.clone();
            scope.spawn(move || {
                for (rel_path, ext, content_hash) in tasks {
                    if producer_cancel.is_canceled() || past(deadline) {
                        break;
                    }
                    let abs = root.join(&rel_path);
                    let content = match std::fs::read(&abs) {
                        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                        Err(_) => continue, // vanished between passes; next run catches it
                    };
                    let task = ChunkTask { rel_path, ext, content_hash, content };
                    if chunk_tx.send(task).is_err() {
                        break; // downstream gone (fatal error or cancel)
                    }
                }
            });

            // Stage B: chunk workers.
            for _ in 0..workers {
                let rx = chunk_rx.clone();
                let tx = bundle_tx.clone();
                let chunker = self.chunker.clone();
                let worker_cancel = cancel.clone();
                scope.spawn(move || {
                    while let Ok(task) = rx.recv() {
                        if worker_cancel.is_canceled() {
                            break;
                        }
                        let source = SourceFile {
                            rel_path: task.rel_path.clone(),
                            ext: task.ext.clone(),
                            content: task.content,
                        };
                        let msg = match chunker.chunk(&source) {
                            Ok(output) => BundleMsg::Bundle(FileBundle {
                                file_path: task.rel_path,
                                content_hash: task.content_hash,
                                language: crate::types::language_tag(&task.ext),
                                chunks: output.chunks,
                                symbols: output.symbols,
                                references: output.references,
                            }),
                            Err(e) => BundleMsg::Failed {
                                rel_path: task.rel_path,
                                reason: e.to_string(),
                            },
                        };
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(chunk_rx);
            drop(bundle_tx);

            // Stage C: embed + store batcher (this thread).
            self.run_batcher(
                bundle_rx,
                dims,
                config_hash,
                cancel,
                deadline,
                progress,
                total_files,
                report,
            )
        })
    }

    /// Gather chunk texts across bundles until the batch size is reached or
    /// the flush timer fires, then embed and commit one file per transaction.
    #[allow(clippy::too_many_arguments)]
    fn run_batcher(
        &self,
        bundle_rx: crossbeam_channel::Receiver<BundleMsg>,
        dims: usize,
        config_hash: &str,
        cancel: &CancelToken,
        deadline: Option<Instant>,
        progress: Option<&ProgressCallback>,
        total_files: usize,
        report: &mut IndexReport,
    ) -> Result<()> {
        let batch_size = self.config.embedding.batch_size;
        let mut pending: Vec<FileBundle> = Vec::new();
        let mut pending_chunks = 0usize;
        let mut total_chunks = 0usize;

        let emit = |report: &IndexReport, total_chunks: usize, file: Option<String>, error: Option<String>| {
            if let Some(cb) = progress {
                cb(&ProgressEvent {
                    phase: IndexPhase::Indexing,
                    total_files,
                    processed_files: report.files_indexed + report.files_failed,
                    total_chunks,
                    processed_chunks: report.chunks_indexed,
                    current_file: file,
                    error,
                });
            }
        };

        loop {
            if cancel.is_canceled() || past(deadline) {
                report.interrupted = true;
                return Ok(());
            }
            match bundle_rx.recv_timeout(FLUSH_INTERVAL) {
                Ok(BundleMsg::Bundle(bundle)) => {
                    pending_chunks += bundle.chunks.len();
                    total_chunks += bundle.chunks.len();
                    pending.push(bundle);
                    if pending_chunks >= batch_size {
                        self.flush(&mut pending, &mut pending_chunks, dims, config_hash, cancel, report)?;
                        emit(report, total_chunks, None, None);
                    }
                }
                Ok(BundleMsg::Failed { rel_path, reason }) => {
                    report.files_failed += 1;
                    report.warnings.push(format!("{rel_path}: {reason}"));
                    emit(report, total_chunks, Some(rel_path), Some(reason));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !pending.is_empty() {
                        self.flush(&mut pending, &mut pending_chunks, dims, config_hash, cancel, report)?;
                        emit(report, total_chunks, None, None);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if !pending.is_empty() {
                        self.flush(&mut pending, &mut pending_chunks, dims, config_hash, cancel, report)?;
                        emit(report, total_chunks, None, None);
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Embed every pending chunk, then write each bundle in its own transaction.
    fn flush(
        &self,
        pending: &mut Vec<FileBundle>,
        pending_chunks: &mut usize,
        dims: usize,
        config_hash: &str,
        cancel: &CancelToken,
        report: &mut IndexReport,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        if cancel.is_canceled() {
            report.interrupted = true;
            pending.clear();
            *pending_chunks = 0;
            return Ok(());
        }

        let texts: Vec<String> =
            pending.iter().flat_map(|b| b.chunks.iter().map(|c| c.content.clone())).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            match self.embedder.embed(&texts, cancel) {
                Ok(v) => v,
                Err(Error::Canceled) => {
                    report.interrupted = true;
                    pending.clear();
                    *pending_chunks = 0;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        };
        if let Some(first) = vectors.first() {
            if first.len() != dims {
                return Err(Error::DimensionMismatch { expected: dims, actual: first.len() });
            }
        }

        let mut offset = 0usize;
        for bundle in pending.drain(..) {
            if cancel.is_canceled() {
                // Unwritten bundles are simply lost; the cache misses them next run.
                report.interrupted = true;
                break;
            }
            let n = bundle.chunks.len();
            let slice: Vec<Option<Vec<f32>>> =
                vectors[offset..offset + n].iter().cloned().map(Some).collect();
            offset += n;
            self.store.store_file(&bundle, &slice, config_hash)?;
            report.files_indexed += 1;
            report.chunks_indexed += n;
        }
        pending.clear();
        *pending_chunks = 0;
        Ok(())
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}
