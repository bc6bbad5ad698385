//! The unified on-disk index: chunks, embeddings, inverted index, symbols,
//! references, file cache, and metadata in one SQLite file.
//!
//! WAL mode with a pooled connection gives one writer and concurrent readers;
//! search and graph queries never take write locks. Per-file ingestion is a
//! single transaction, so a crash leaves the file's prior state intact.

use crate::embed::tokenize_identifiers;
use crate::error::{Error, Result};
use crate::types::{
    unix_now, Chunk, ChunkType, FileBundle, IndexMetadata, IndexStats, RefKind, Reference, Symbol,
    SymbolKind, Visibility, SCHEMA_VERSION,
};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rayon::prelude::*;
use rusqlite::{params, OptionalExtension, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Candidate filters applied by both retrieval paths.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub languages: Vec<String>,
    pub chunk_types: Vec<ChunkType>,
    pub file_globs: Vec<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.languages.is_empty() && self.chunk_types.is_empty() && self.file_globs.is_empty()
    }

    fn matches_language(&self, language: &str) -> bool {
        self.languages.is_empty() || self.languages.iter().any(|l| l == language)
    }

    fn matches_chunk_type(&self, chunk_type: ChunkType) -> bool {
        self.chunk_types.is_empty() || self.chunk_types.contains(&chunk_type)
    }

    fn matches_path(&self, path: &str) -> bool {
        if self.file_globs.is_empty() {
            return true;
        }
        self.file_globs.iter().any(|g| {
            glob::Pattern::new(g).map(|p| p.matches(path)).unwrap_or(false)
        })
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.matches_language(&chunk.language)
            && self.matches_chunk_type(chunk.chunk_type)
            && self.matches_path(&chunk.file_path)
    }
}

// ---------------------------------------------------------------------------
// Embedding encoding
// ---------------------------------------------------------------------------

pub fn embedding_to_bytes(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

/// Cache row controlling incremental reuse.
#[derive(Debug, Clone)]
pub struct FileCacheEntry {
    pub content_hash: String,
    pub config_hash: String,
    pub indexed_at: i64,
}

impl Store {
    /// Open (or create) the store at `path`. Refuses to open a store written
    /// by a different schema version.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(std::time::Duration::from_secs(30))?;
            Ok(())
        });
        let pool = Pool::builder().max_size(8).build(manager)?;

        let store = Store { pool, path: path.to_path_buf() };
        store.init_schema()?;
        store.check_schema_version()?;
        Ok(store)
    }

    /// Delete the index file and open a fresh store (schema-mismatch recovery
    /// and `--force` rebuilds).
    pub fn rebuild(path: &Path) -> Result<Self> {
        for suffix in ["", "-wal", "-shm"] {
            let f = PathBuf::from(format!("{}{}", path.display(), suffix));
            if f.exists() {
                std::fs::remove_file(&f)?;
            }
        }
        Self::open(path)
    }

    /// Release the pool. Pending connections close as they are dropped.
    pub fn close(self) {}

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                id                   INTEGER PRIMARY KEY CHECK (id = 1),
                schema_version       INTEGER NOT NULL,
                tool_version         TEXT NOT NULL,
                embedding_provider   TEXT NOT NULL,
                embedding_model      TEXT NOT NULL,
                embedding_dimensions INTEGER NOT NULL,
                chunking_strategy    TEXT NOT NULL,
                reranker_model       TEXT,
                config_hash          TEXT NOT NULL,
                created_at           INTEGER NOT NULL,
                last_updated         INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id           TEXT PRIMARY KEY,
                file_path    TEXT NOT NULL,
                language     TEXT NOT NULL,
                content      TEXT NOT NULL,
                chunk_type   TEXT NOT NULL,
                name         TEXT,
                parent_name  TEXT,
                start_line   INTEGER NOT NULL,
                end_line     INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                embedding    BLOB,
                updated_at   INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_path);

            CREATE VIRTUAL TABLE IF NOT EXISTS chunk_fts USING fts5(
                terms,
                chunk_id UNINDEXED,
                file_path UNINDEXED
            );

            CREATE TABLE IF NOT EXISTS symbols (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                kind        TEXT NOT NULL,
                file_path   TEXT NOT NULL,
                start_line  INTEGER NOT NULL,
                end_line    INTEGER NOT NULL,
                signature   TEXT NOT NULL,
                visibility  TEXT NOT NULL,
                doc_comment TEXT,
                UNIQUE(name, kind, file_path, start_line)
            );
            CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name COLLATE NOCASE, kind);
            CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(file_path);

            CREATE TABLE IF NOT EXISTS refs (
                id          TEXT PRIMARY KEY,
                from_symbol TEXT NOT NULL,
                to_symbol   TEXT NOT NULL,
                kind        TEXT NOT NULL,
                file_path   TEXT NOT NULL,
                line        INTEGER NOT NULL,
                is_external INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_refs_to ON refs(to_symbol);
            CREATE INDEX IF NOT EXISTS idx_refs_from ON refs(from_symbol);
            CREATE INDEX IF NOT EXISTS idx_refs_kind ON refs(kind);
            CREATE INDEX IF NOT EXISTS idx_refs_file ON refs(file_path);

            CREATE TABLE IF NOT EXISTS file_cache (
                file_path    TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                config_hash  TEXT NOT NULL,
                indexed_at   INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn check_schema_version(&self) -> Result<()> {
        if let Some(meta) = self.get_metadata()? {
            if meta.schema_version != SCHEMA_VERSION {
                return Err(Error::SchemaMismatch {
                    found: meta.schema_version,
                    expected: SCHEMA_VERSION,
                });
            }
        }
        Ok(())
    }

    // -- metadata -------------------------------------------------------------

    pub fn get_metadata(&self) -> Result<Option<IndexMetadata>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT schema_version, tool_version, embedding_provider, embedding_model,
                        embedding_dimensions, chunking_strategy, reranker_model, config_hash,
                        created_at, last_updated
                 FROM metadata WHERE id = 1",
                [],
                |row| {
                    Ok(IndexMetadata {
                        schema_version: row.get(0)?,
                        tool_version: row.get(1)?,
                        embedding_provider: row.get(2)?,
                        embedding_model: row.get(3)?,
                        embedding_dimensions: row.get::<_, i64>(4)? as usize,
                        chunking_strategy: row.get(5)?,
                        reranker_model: row.get(6)?,
                        config_hash: row.get(7)?,
                        created_at: row.get(8)?,
                        last_updated: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn set_metadata(&self, meta: &IndexMetadata) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metadata (id, schema_version, tool_version, embedding_provider,
                                   embedding_model, embedding_dimensions, chunking_strategy,
                                   reranker_model, config_hash, created_at, last_updated)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 schema_version = excluded.schema_version,
                 tool_version = excluded.tool_version,
                 embedding_provider = excluded.embedding_provider,
                 embedding_model = excluded.embedding_model,
                 embedding_dimensions = excluded.embedding_dimensions,
                 chunking_strategy = excluded.chunking_strategy,
                 reranker_model = excluded.reranker_model,
                 config_hash = excluded.config_hash,
                 last_updated = excluded.last_updated",
            params![
                meta.schema_version,
                meta.tool_version,
                meta.embedding_provider,
                meta.embedding_model,
                meta.embedding_dimensions as i64,
                meta.chunking_strategy,
                meta.reranker_model,
                meta.config_hash,
                meta.created_at,
                meta.last_updated,
            ],
        )?;
        Ok(())
    }

    /// Record the vector dimension fixed by the first successful embedding call.
    pub fn set_embedding_dimensions(&self, dims: usize) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE metadata SET embedding_dimensions = ?1, last_updated = ?2 WHERE id = 1",
            params![dims as i64, unix_now()],
        )?;
        Ok(())
    }

    // -- per-file ingestion ---------------------------------------------------

    /// Commit one file's chunks (paired with vectors), symbols, references,
    /// and cache row in a single transaction, replacing any prior rows.
    pub fn store_file(
        &self,
        bundle: &FileBundle,
        vectors: &[Option<Vec<f32>>],
        config_hash: &str,
    ) -> Result<()> {
        debug_assert_eq!(bundle.chunks.len(), vectors.len());
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        Self::delete_file_rows(&tx, &bundle.file_path)?;
        Self::insert_chunks(&tx, &bundle.chunks, vectors)?;
        Self::insert_symbols(&tx, &bundle.symbols)?;
        Self::insert_references(&tx, &bundle.references)?;
        tx.execute(
            "INSERT INTO file_cache (file_path, content_hash, config_hash, indexed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(file_path) DO UPDATE SET
                 content_hash = excluded.content_hash,
                 config_hash = excluded.config_hash,
                 indexed_at = excluded.indexed_at",
            params![bundle.file_path, bundle.content_hash, config_hash, unix_now()],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn delete_file_rows(tx: &Transaction, file_path: &str) -> Result<()> {
        tx.execute("DELETE FROM chunk_fts WHERE file_path = ?1", params![file_path])?;
        tx.execute("DELETE FROM chunks WHERE file_path = ?1", params![file_path])?;
        tx.execute("DELETE FROM symbols WHERE file_path = ?1", params![file_path])?;
        tx.execute("DELETE FROM refs WHERE file_path = ?1", params![file_path])?;
        Ok(())
    }

    fn insert_chunks(tx: &Transaction, chunks: &[Chunk], vectors: &[Option<Vec<f32>>]) -> Result<()> {
        let now = unix_now();
        let mut chunk_stmt = tx.prepare_cached(
            "INSERT OR REPLACE INTO chunks
             (id, file_path, language, content, chunk_type, name, parent_name,
              start_line, end_line, content_hash, embedding, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        let mut fts_stmt = tx.prepare_cached(
            "INSERT INTO chunk_fts (terms, chunk_id, file_path) VALUES (?1, ?2, ?3)",
        )?;

        for (chunk, vector) in chunks.iter().zip(vectors) {
            let blob = vector.as_ref().map(|v| embedding_to_bytes(v));
            chunk_stmt.execute(params![
                chunk.id,
                chunk.file_path,
                chunk.language,
                chunk.content,
                chunk.chunk_type.label(),
                chunk.name,
                chunk.parent_name,
                chunk.start_line as i64,
                chunk.end_line as i64,
                chunk.content_hash,
                blob,
                now,
            ])?;
            let terms = tokenize_identifiers(&chunk.content).join(" ");
            fts_stmt.execute(params![terms, chunk.id, chunk.file_path])?;
        }
        Ok(())
    }

    fn insert_symbols(tx: &Transaction, symbols: &[Symbol]) -> Result<()> {
        let mut stmt = tx.prepare_cached(
            "INSERT OR REPLACE INTO symbols
             (id, name, kind, file_path, start_line, end_line, signature, visibility, doc_comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for s in symbols {
            stmt.execute(params![
                s.id,
                s.name,
                s.kind.label(),
                s.file_path,
                s.start_line as i64,
                s.end_line as i64,
                s.signature,
                s.visibility.label(),
                s.doc_comment,
            ])?;
        }
        Ok(())
    }

    fn insert_references(tx: &Transaction, references: &[Reference]) -> Result<()> {
        let mut stmt = tx.prepare_cached(
            "INSERT OR REPLACE INTO refs
             (id, from_symbol, to_symbol, kind, file_path, line, is_external)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for r in references {
            stmt.execute(params![
                r.id,
                r.from_symbol,
                r.to_symbol,
                r.kind.label(),
                r.file_path,
                r.line as i64,
                r.is_external as i64,
            ])?;
        }
        Ok(())
    }

    /// Remove every row belonging to a file, cache row included, atomically.
    pub fn delete_file(&self, file_path: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::delete_file_rows(&tx, file_path)?;
        tx.execute("DELETE FROM file_cache WHERE file_path = ?1", params![file_path])?;
        tx.commit()?;
        Ok(())
    }

    /// Drop just the cache row so the next run re-processes the file.
    pub fn delete_file_cache(&self, file_path: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM file_cache WHERE file_path = ?1", params![file_path])?;
        Ok(())
    }

    /// Refresh a cache row without touching chunk rows (unchanged file).
    pub fn touch_file_cache(&self, file_path: &str, content_hash: &str, config_hash: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO file_cache (file_path, content_hash, config_hash, indexed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(file_path) DO UPDATE SET indexed_at = excluded.indexed_at",
            params![file_path, content_hash, config_hash, unix_now()],
        )?;
        Ok(())
    }

    // -- chunk reads ----------------------------------------------------------

    pub fn get_chunk(&self, id: &str) -> Result<Option<Chunk>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, file_path, language, content, chunk_type, name, parent_name,
                        start_line, end_line, content_hash
                 FROM chunks WHERE id = ?1",
                params![id],
                row_to_chunk,
            )
            .optional()?;
        Ok(row)
    }

    /// Snapshot of every cache row, keyed by file path.
    pub fn get_all_file_hashes(&self) -> Result<HashMap<String, FileCacheEntry>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT file_path, content_hash, config_hash, indexed_at FROM file_cache")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                FileCacheEntry {
                    content_hash: row.get(1)?,
                    config_hash: row.get(2)?,
                    indexed_at: row.get(3)?,
                },
            ))
        })?;
        let mut map = HashMap::new();
        for row in rows {
            let (path, entry) = row?;
            map.insert(path, entry);
        }
        Ok(map)
    }

    // -- retrieval ------------------------------------------------------------

    /// BM25 over the inverted index; results ordered best-first.
    pub fn bm25_search(
        &self,
        query_text: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<(Chunk, f32)>> {
        let tokens = tokenize_identifiers(query_text);
        if tokens.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let match_expr =
            tokens.iter().map(|t| format!("\"{}\"", t)).collect::<Vec<_>>().join(" OR ");

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT c.id, c.file_path, c.language, c.content, c.chunk_type, c.name,
                    c.parent_name, c.start_line, c.end_line, c.content_hash,
                    bm25(chunk_fts) AS rank
             FROM chunk_fts
             JOIN chunks c ON c.id = chunk_fts.chunk_id
             WHERE chunk_fts MATCH ?1
             ORDER BY rank",
        )?;

        let mut results = Vec::new();
        let mut rows = stmt.query(params![match_expr])?;
        while let Some(row) = rows.next()? {
            let chunk = row_to_chunk(row)?;
            // bm25() is lower-is-better; negate into a descending score.
            let score: f64 = row.get("rank")?;
            if !filters.matches(&chunk) {
                continue;
            }
            results.push((chunk, -score as f32));
            if results.len() >= k {
                break;
            }
        }
        Ok(results)
    }

    /// Top-K by cosine similarity over stored vectors; results ordered
    /// best-first. Rows whose blob length disagrees with `dims` are rejected.
    pub fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<(Chunk, f32)>> {
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;

        // Scoring phase: id + vector only, filter columns for cheap rejection.
        let mut stmt = conn.prepare_cached(
            "SELECT id, file_path, language, chunk_type, embedding
             FROM chunks WHERE embedding IS NOT NULL",
        )?;
        struct Scored {
            id: String,
            file_path: String,
            language: String,
            chunk_type: String,
            blob: Vec<u8>,
        }
        let candidates: Vec<Scored> = stmt
            .query_map([], |row| {
                Ok(Scored {
                    id: row.get(0)?,
                    file_path: row.get(1)?,
                    language: row.get(2)?,
                    chunk_type: row.get(3)?,
                    blob: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        let expected_len = query.len() * 4;
        let query_norm: f32 = query.iter().map(|v| v * v).sum::<f32>().sqrt();
        if query_norm == 0.0 {
            return Ok(Vec::new());
        }

        let mut scores: Vec<(String, f32)> = candidates
            .par_iter()
            .filter_map(|c| {
                if !filters.matches_language(&c.language) || !filters.matches_path(&c.file_path) {
                    return None;
                }
                if let Some(ct) = ChunkType::parse(&c.chunk_type) {
                    if !filters.matches_chunk_type(ct) {
                        return None;
                    }
                }
                if c.blob.len() != expected_len {
                    warn!(chunk = %c.id, "embedding length mismatch, row rejected");
                    return None;
                }
                let vec = bytes_to_embedding(&c.blob);
                let dot: f32 = query.iter().zip(&vec).map(|(a, b)| a * b).sum();
                let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm == 0.0 {
                    return None;
                }
                Some((c.id.clone(), dot / (norm * query_norm)))
            })
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0))
        });
        scores.truncate(k);

        // Hydration phase: fetch full rows for the winners, keep score order.
        let mut results = Vec::with_capacity(scores.len());
        for (id, score) in scores {
            if let Some(chunk) = self.get_chunk(&id)? {
                results.push((chunk, score));
            }
        }
        Ok(results)
    }

    // -- graph queries --------------------------------------------------------

    /// Case-insensitive substring match on symbol names, exact matches first.
    pub fn find_symbols(
        &self,
        query: &str,
        kind: Option<SymbolKind>,
        limit: usize,
    ) -> Result<Vec<Symbol>> {
        let conn = self.conn()?;
        let pattern = format!("%{}%", escape_like(query));
        let mut sql = String::from(
            "SELECT id, name, kind, file_path, start_line, end_line, signature, visibility, doc_comment
             FROM symbols
             WHERE name LIKE ?1 ESCAPE '\\'",
        );
        if kind.is_some() {
            sql.push_str(" AND kind = ?3");
        }
        sql.push_str(
            " ORDER BY (name = ?2 COLLATE NOCASE) DESC, length(name), name, file_path, start_line",
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<Symbol> = match kind {
            Some(k) => stmt
                .query_map(params![pattern, query, k.label()], row_to_symbol)?
                .collect::<std::result::Result<_, _>>()?,
            None => stmt
                .query_map(params![pattern, query], row_to_symbol)?
                .collect::<std::result::Result<_, _>>()?,
        };
        Ok(rows.into_iter().take(limit).collect())
    }

    /// Symbol search with a minimum declaration length and explicit ordering.
    pub fn find_symbols_advanced(
        &self,
        query: &str,
        kind: Option<SymbolKind>,
        min_line_count: usize,
        sort_by: SymbolSort,
        limit: usize,
    ) -> Result<Vec<Symbol>> {
        let conn = self.conn()?;
        let pattern = format!("%{}%", escape_like(query));
        let order = match sort_by {
            SymbolSort::Name => "name, file_path, start_line",
            SymbolSort::LineCount => "(end_line - start_line + 1) DESC, name, file_path, start_line",
            SymbolSort::FilePath => "file_path, start_line",
        };
        let mut sql = String::from(
            "SELECT id, name, kind, file_path, start_line, end_line, signature, visibility, doc_comment
             FROM symbols
             WHERE name LIKE ?1 ESCAPE '\\'
               AND (end_line - start_line + 1) >= ?2",
        );
        if kind.is_some() {
            sql.push_str(" AND kind = ?3");
        }
        sql.push_str(&format!(" ORDER BY {order} LIMIT ?4"));

        let mut stmt = conn.prepare(&sql)?;
        let rows: Vec<Symbol> = match kind {
            Some(k) => stmt
                .query_map(
                    params![pattern, min_line_count as i64, k.label(), limit as i64],
                    row_to_symbol,
                )?
                .collect::<std::result::Result<_, _>>()?,
            None => {
                // Re-bind without the kind placeholder.
                let sql = sql.replace("?4", "?3");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![pattern, min_line_count as i64, limit as i64], row_to_symbol)?
                    .collect::<std::result::Result<_, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Longest function/method declarations, by line span.
    pub fn find_long_functions(&self, min_lines: usize, limit: usize) -> Result<Vec<Symbol>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, kind, file_path, start_line, end_line, signature, visibility, doc_comment
             FROM symbols
             WHERE kind IN ('function', 'method')
               AND (end_line - start_line + 1) >= ?1
             ORDER BY (end_line - start_line + 1) DESC, name, file_path
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![min_lines as i64, limit as i64], row_to_symbol)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    /// References targeting a symbol name (case-sensitive), ordered by location.
    pub fn get_callers(&self, symbol_name: &str, limit: usize) -> Result<Vec<Reference>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, from_symbol, to_symbol, kind, file_path, line, is_external
             FROM refs WHERE to_symbol = ?1
             ORDER BY file_path, line
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![symbol_name, limit as i64], row_to_reference)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    /// References originating from a symbol name.
    pub fn get_callees(&self, symbol_name: &str, limit: usize) -> Result<Vec<Reference>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, from_symbol, to_symbol, kind, file_path, line, is_external
             FROM refs WHERE from_symbol = ?1
             ORDER BY file_path, line
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![symbol_name, limit as i64], row_to_reference)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    pub fn find_references_by_kind(&self, kind: RefKind, limit: usize) -> Result<Vec<Reference>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, from_symbol, to_symbol, kind, file_path, line, is_external
             FROM refs WHERE kind = ?1
             ORDER BY file_path, line
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![kind.label(), limit as i64], row_to_reference)?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    /// All symbols of a kind (entry-point scans, fuzzy candidate pools).
    pub fn symbols_by_kind(&self, kind: Option<SymbolKind>, limit: usize) -> Result<Vec<Symbol>> {
        let conn = self.conn()?;
        let rows = match kind {
            Some(k) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, name, kind, file_path, start_line, end_line, signature, visibility, doc_comment
                     FROM symbols WHERE kind = ?1 ORDER BY name, file_path LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![k.label(), limit as i64], row_to_symbol)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, name, kind, file_path, start_line, end_line, signature, visibility, doc_comment
                     FROM symbols ORDER BY name, file_path LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit as i64], row_to_symbol)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Distinct indexed file paths (fuzzy file search).
    pub fn all_file_paths(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT file_path FROM file_cache ORDER BY file_path")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows)
    }

    /// Post-pass: mark references internal when their target name resolves to
    /// exactly one indexed symbol; ambiguous names stay external.
    pub fn resolve_references(&self) -> Result<usize> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE refs SET is_external = 1
             WHERE is_external = 0
               AND to_symbol NOT IN (SELECT name FROM symbols GROUP BY name HAVING COUNT(*) = 1)",
            [],
        )?;
        let resolved = conn.execute(
            "UPDATE refs SET is_external = 0
             WHERE to_symbol IN (SELECT name FROM symbols GROUP BY name HAVING COUNT(*) = 1)",
            [],
        )?;
        Ok(resolved)
    }

    // -- stats ----------------------------------------------------------------

    pub fn get_stats(&self) -> Result<IndexStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> Result<usize> {
            Ok(conn.query_row(sql, [], |row| row.get::<_, i64>(0))? as usize)
        };
        let last_indexed: Option<i64> =
            conn.query_row("SELECT MAX(indexed_at) FROM file_cache", [], |row| row.get(0))?;
        let db_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        Ok(IndexStats {
            indexed_files: count("SELECT COUNT(*) FROM file_cache")?,
            total_chunks: count("SELECT COUNT(*) FROM chunks")?,
            total_symbols: count("SELECT COUNT(*) FROM symbols")?,
            total_references: count("SELECT COUNT(*) FROM refs")?,
            db_size_bytes,
            last_indexed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSort {
    Name,
    LineCount,
    FilePath,
}

impl SymbolSort {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "name" => Some(SymbolSort::Name),
            "lines" | "line_count" => Some(SymbolSort::LineCount),
            "file" | "file_path" => Some(SymbolSort::FilePath),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn row_to_chunk(row: &rusqlite::Row) -> rusqlite::Result<Chunk> {
    let chunk_type: String = row.get("chunk_type")?;
    Ok(Chunk {
        id: row.get("id")?,
        file_path: row.get("file_path")?,
        language: row.get("language")?,
        content: row.get("content")?,
        chunk_type: ChunkType::parse(&chunk_type).unwrap_or(ChunkType::Block),
        name: row.get("name")?,
        parent_name: row.get("parent_name")?,
        start_line: row.get::<_, i64>("start_line")? as usize,
        end_line: row.get::<_, i64>("end_line")? as usize,
        content_hash: row.get("content_hash")?,
    })
}

fn row_to_symbol(row: &rusqlite::Row) -> rusqlite::Result<Symbol> {
    let kind: String = row.get("kind")?;
    let visibility: String = row.get("visibility")?;
    Ok(Symbol {
        id: row.get("id")?,
        name: row.get("name")?,
        kind: SymbolKind::parse(&kind).unwrap_or(SymbolKind::Function),
        file_path: row.get("file_path")?,
        start_line: row.get::<_, i64>("start_line")? as usize,
        end_line: row.get::<_, i64>("end_line")? as usize,
        signature: row.get("signature")?,
        visibility: Visibility::parse(&visibility).unwrap_or(Visibility::Private),
        doc_comment: row.get("doc_comment")?,
    })
}

fn row_to_reference(row: &rusqlite::Row) -> rusqlite::Result<Reference> {
    let kind: String = row.get("kind")?;
    Ok(Reference {
        id: row.get("id")?,
        from_symbol: row.get("from_symbol")?,
        to_symbol: row.get("to_symbol")?,
        kind: RefKind::parse(&kind).unwrap_or(RefKind::Call),
        file_path: row.get("file_path")?,
        line: row.get::<_, i64>("line")? as usize,
        is_external: row.get::<_, i64>("is_external")? != 0,
    })
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{chunk_id, sha256_hex};

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("index.db")).unwrap();
        (dir, store)
    }

    fn bundle_for(path: &str, content: &str) -> (FileBundle, Vec<Option<Vec<f32>>>) {
        let chunk = Chunk::new(path, "rust", content.to_string(), ChunkType::Function, Some("f".into()), None, 1, 3);
        let symbol = Symbol::new(
            "f".into(),
            SymbolKind::Function,
            path,
            1,
            3,
            "fn f()".into(),
            Visibility::Public,
            None,
        );
        let reference = Reference::new("f".into(), "g".into(), RefKind::Call, path, 2);
        let bundle = FileBundle {
            file_path: path.to_string(),
            content_hash: sha256_hex(content.as_bytes()),
            language: "rust".into(),
            chunks: vec![chunk],
            symbols: vec![symbol],
            references: vec![reference],
        };
        let vectors = vec![Some(vec![1.0, 0.0, 0.0])];
        (bundle, vectors)
    }

    #[test]
    fn store_and_get_chunk() {
        let (_dir, store) = temp_store();
        let (bundle, vectors) = bundle_for("src/a.rs", "fn f() {\n    g();\n}");
        store.store_file(&bundle, &vectors, "cfg").unwrap();

        let id = &bundle.chunks[0].id;
        let chunk = store.get_chunk(id).unwrap().expect("chunk present");
        assert_eq!(chunk.file_path, "src/a.rs");
        assert_eq!(chunk.chunk_type, ChunkType::Function);

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.indexed_files, 1);
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.total_symbols, 1);
        assert_eq!(stats.total_references, 1);
        assert!(stats.last_indexed.is_some());
    }

    #[test]
    fn delete_file_removes_everything() {
        let (_dir, store) = temp_store();
        let (bundle, vectors) = bundle_for("src/a.rs", "fn f() { g(); }");
        store.store_file(&bundle, &vectors, "cfg").unwrap();

        store.delete_file("src/a.rs").unwrap();
        assert!(store.get_chunk(&bundle.chunks[0].id).unwrap().is_none());
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_chunks, 0);
        assert_eq!(stats.total_symbols, 0);
        assert_eq!(stats.total_references, 0);
        assert_eq!(stats.indexed_files, 0);
        // BM25 must not surface deleted rows either.
        let hits = store.bm25_search("f g", 10, &SearchFilters::default()).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn reindex_replaces_rows_atomically() {
        let (_dir, store) = temp_store();
        let (bundle, vectors) = bundle_for("src/a.rs", "fn f() { g(); }");
        store.store_file(&bundle, &vectors, "cfg").unwrap();
        let (bundle2, vectors2) = bundle_for("src/a.rs", "fn f() { h(); }");
        store.store_file(&bundle2, &vectors2, "cfg").unwrap();

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_chunks, 1, "old chunk rows must be replaced");
        assert!(store.get_chunk(&bundle.chunks[0].id).unwrap().is_none());
        assert!(store.get_chunk(&bundle2.chunks[0].id).unwrap().is_some());
    }

    #[test]
    fn bm25_finds_identifier_terms() {
        let (_dir, store) = temp_store();
        let (bundle, vectors) = bundle_for("src/greet.rs", "fn greet() { println(\"hello world\") }");
        store.store_file(&bundle, &vectors, "cfg").unwrap();
        let (other, ov) = bundle_for("src/math.rs", "fn add(a: u32, b: u32) -> u32 { a + b }");
        store.store_file(&other, &ov, "cfg").unwrap();

        let hits = store.bm25_search("hello greeting", 10, &SearchFilters::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.file_path, "src/greet.rs");
        assert!(hits[0].1 > 0.0, "negated bm25 rank should be positive: {}", hits[0].1);
    }

    #[test]
    fn vector_search_orders_by_cosine() {
        let (_dir, store) = temp_store();
        let mk = |path: &str, v: Vec<f32>| {
            let (mut bundle, _) = bundle_for(path, &format!("fn f() {{ /* {path} */ }}"));
            bundle.symbols.clear();
            bundle.references.clear();
            store.store_file(&bundle, &[Some(v)], "cfg").unwrap();
        };
        mk("a.rs", vec![1.0, 0.0, 0.0]);
        mk("b.rs", vec![0.7, 0.7, 0.0]);
        mk("c.rs", vec![0.0, 1.0, 0.0]);

        let hits = store.vector_search(&[1.0, 0.0, 0.0], 2, &SearchFilters::default()).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.file_path, "a.rs");
        assert_eq!(hits[1].0.file_path, "b.rs");
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn vector_search_rejects_wrong_dimension_rows() {
        let (_dir, store) = temp_store();
        let (bundle, _) = bundle_for("a.rs", "fn f() {}");
        store.store_file(&bundle, &[Some(vec![1.0, 0.0])], "cfg").unwrap();
        // 3-dim query against 2-dim row: rejected on read.
        let hits = store.vector_search(&[1.0, 0.0, 0.0], 5, &SearchFilters::default()).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn filters_restrict_candidates() {
        let (_dir, store) = temp_store();
        let (bundle, vectors) = bundle_for("src/a.rs", "fn shared_term() {}");
        store.store_file(&bundle, &vectors, "cfg").unwrap();
        let mut py = bundle_for("lib/b.py", "def shared_term(): pass").0;
        for c in &mut py.chunks {
            *c = Chunk::new("lib/b.py", "python", c.content.clone(), ChunkType::Function, c.name.clone(), None, 1, 1);
        }
        py.language = "python".into();
        py.symbols.clear();
        py.references.clear();
        store.store_file(&py, &[Some(vec![0.5, 0.5, 0.0])], "cfg").unwrap();

        let filters = SearchFilters { languages: vec!["python".into()], ..Default::default() };
        let hits = store.bm25_search("shared_term", 10, &filters).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.language, "python");

        let filters = SearchFilters { file_globs: vec!["src/**".into()], ..Default::default() };
        let hits = store.bm25_search("shared_term", 10, &filters).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.file_path, "src/a.rs");
    }

    #[test]
    fn symbol_queries() {
        let (_dir, store) = temp_store();
        let (mut bundle, vectors) = bundle_for("src/a.rs", "fn handleLogin() {}");
        bundle.symbols = vec![
            Symbol::new("handleLogin".into(), SymbolKind::Function, "src/a.rs", 1, 40, "fn handleLogin()".into(), Visibility::Public, None),
            Symbol::new("Config".into(), SymbolKind::Type, "src/a.rs", 45, 50, "struct Config".into(), Visibility::Public, None),
        ];
        store.store_file(&bundle, &vectors, "cfg").unwrap();

        let hits = store.find_symbols("handlelogin", Some(SymbolKind::Function), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "handleLogin");

        let hits = store.find_symbols("config", None, 10).unwrap();
        assert_eq!(hits.len(), 1);

        let long = store.find_long_functions(30, 10).unwrap();
        assert_eq!(long.len(), 1);
        assert_eq!(long[0].name, "handleLogin");

        let advanced = store
            .find_symbols_advanced("", None, 1, SymbolSort::LineCount, 10)
            .unwrap();
        assert_eq!(advanced.len(), 2);
        assert_eq!(advanced[0].name, "handleLogin", "longest first");
    }

    #[test]
    fn callers_callees_and_resolution() {
        let (_dir, store) = temp_store();
        let (mut bundle, vectors) = bundle_for("main.go", "func main() { greet() }");
        bundle.symbols = vec![
            Symbol::new("main".into(), SymbolKind::Function, "main.go", 1, 3, "func main()".into(), Visibility::Private, None),
            Symbol::new("greet".into(), SymbolKind::Function, "main.go", 5, 7, "func greet()".into(), Visibility::Private, None),
        ];
        bundle.references =
            vec![Reference::new("main".into(), "greet".into(), RefKind::Call, "main.go", 2)];
        store.store_file(&bundle, &vectors, "cfg").unwrap();

        let callers = store.get_callers("greet", 10).unwrap();
        assert_eq!(callers.len(), 1);
        assert_eq!(callers[0].from_symbol, "main");
        assert!(callers[0].is_external, "unresolved until the post-pass");

        store.resolve_references().unwrap();
        let callers = store.get_callers("greet", 10).unwrap();
        assert!(!callers[0].is_external);

        let callees = store.get_callees("main", 10).unwrap();
        assert_eq!(callees.len(), 1);
        assert_eq!(callees[0].to_symbol, "greet");
    }

    #[test]
    fn schema_mismatch_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        {
            let store = Store::open(&path).unwrap();
            let meta = IndexMetadata {
                schema_version: SCHEMA_VERSION + 1,
                tool_version: "test".into(),
                embedding_provider: "hash".into(),
                embedding_model: "m".into(),
                embedding_dimensions: 3,
                chunking_strategy: "ast".into(),
                reranker_model: None,
                config_hash: "cfg".into(),
                created_at: unix_now(),
                last_updated: unix_now(),
            };
            store.set_metadata(&meta).unwrap();
        }
        match Store::open(&path) {
            Err(Error::SchemaMismatch { found, expected }) => {
                assert_eq!(found, SCHEMA_VERSION + 1);
                assert_eq!(expected, SCHEMA_VERSION);
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
        // Rebuild recovers.
        let store = Store::rebuild(&path).unwrap();
        assert!(store.get_metadata().unwrap().is_none());
    }

    #[test]
    fn chunk_id_helper_matches_store_rows() {
        let (_dir, store) = temp_store();
        let content = "fn f() { g(); }";
        let (bundle, vectors) = bundle_for("src/a.rs", content);
        store.store_file(&bundle, &vectors, "cfg").unwrap();
        let expected = chunk_id("src/a.rs", 1, &sha256_hex(content.as_bytes()));
        assert!(store.get_chunk(&expected).unwrap().is_some());
    }

    #[test]
    fn embedding_bytes_round_trip() {
        let v = vec![0.25f32, -1.5, 3.75];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&v)), v);
    }
}
