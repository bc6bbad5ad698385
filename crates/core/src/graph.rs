//! Code-graph services over the stored symbol and reference rows.
//!
//! Callers/callees are indexed lookups, the import graph is an aggregation of
//! import references, and entry points are a heuristic classification of
//! function symbols. No in-memory graph is materialized.

use crate::error::Result;
use crate::fuzzy::{match_name, FuzzyMatch};
use crate::store::Store;
use crate::types::{RefKind, Reference, Symbol, SymbolKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Candidate pool cap for fuzzy scans.
const FUZZY_POOL: usize = 50_000;

pub struct GraphService {
    store: Arc<Store>,
}

// ---------------------------------------------------------------------------
// Import graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ImportEdge {
    pub from_file: String,
    pub to_module: String,
    pub line: usize,
    pub is_external: bool,
}

/// Aggregated import view: edges plus per-module counts and a reverse index.
#[derive(Debug, Default, Serialize)]
pub struct ImportGraph {
    pub edges: Vec<ImportEdge>,
    /// module → number of importing sites
    pub import_counts: BTreeMap<String, usize>,
    /// module → files that import it
    pub imported_by: BTreeMap<String, Vec<String>>,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EntryPoint {
    pub symbol: Symbol,
    /// "main", "init", "test", "handler", or "cli".
    pub category: &'static str,
    pub confidence: f32,
}

fn classify_entry_point(name: &str) -> Option<(&'static str, f32)> {
    if name == "main" {
        return Some(("main", 1.0));
    }
    if name == "init" {
        return Some(("init", 1.0));
    }
    if name.starts_with("Test") {
        return Some(("test", 1.0));
    }
    if ["Handle", "ServeHTTP", "Handler"].iter().any(|p| name.contains(p)) {
        return Some(("handler", 0.8));
    }
    if ["Execute", "Run", "Cmd"].iter().any(|p| name.contains(p)) {
        return Some(("cli", 0.6));
    }
    None
}

// ---------------------------------------------------------------------------
// Fuzzy results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SymbolMatch {
    pub symbol: Symbol,
    #[serde(flatten)]
    pub fuzzy: FuzzyMatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileMatch {
    pub path: String,
    #[serde(flatten)]
    pub fuzzy: FuzzyMatch,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

impl GraphService {
    pub fn new(store: Arc<Store>) -> Self {
        GraphService { store }
    }

    /// References targeting `symbol_name`, ordered by (file, line).
    pub fn get_callers(&self, symbol_name: &str, limit: usize) -> Result<Vec<Reference>> {
        self.store.get_callers(symbol_name, limit)
    }

    /// References originating from `symbol_name`.
    pub fn get_callees(&self, symbol_name: &str, limit: usize) -> Result<Vec<Reference>> {
        self.store.get_callees(symbol_name, limit)
    }

    /// Aggregate import references into a module-level graph.
    pub fn get_import_graph(&self, limit: usize) -> Result<ImportGraph> {
        let refs = self.store.find_references_by_kind(RefKind::Import, limit)?;
        let mut graph = ImportGraph::default();
        for r in refs {
            graph
                .imported_by
                .entry(r.to_symbol.clone())
                .or_default()
                .push(r.file_path.clone());
            *graph.import_counts.entry(r.to_symbol.clone()).or_default() += 1;
            graph.edges.push(ImportEdge {
                from_file: r.file_path,
                to_module: r.to_symbol,
                line: r.line,
                is_external: r.is_external,
            });
        }
        for files in graph.imported_by.values_mut() {
            files.sort();
            files.dedup();
        }
        Ok(graph)
    }

    /// Heuristic entry-point classification over function symbols, ordered by
    /// descending confidence then name.
    pub fn get_entry_points(&self, limit: usize) -> Result<Vec<EntryPoint>> {
        let functions = self.store.symbols_by_kind(Some(SymbolKind::Function), FUZZY_POOL)?;
        let mut points: Vec<EntryPoint> = functions
            .into_iter()
            .filter_map(|symbol| {
                classify_entry_point(&symbol.name)
                    .map(|(category, confidence)| EntryPoint { symbol, category, confidence })
            })
            .collect();
        points.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.name.cmp(&b.symbol.name))
                .then_with(|| a.symbol.file_path.cmp(&b.symbol.file_path))
        });
        points.truncate(limit);
        Ok(points)
    }

    /// Fuzzy symbol lookup; see the scoring ladder in `fuzzy`.
    pub fn fuzzy_search_symbols(
        &self,
        query: &str,
        kind: Option<SymbolKind>,
        limit: usize,
    ) -> Result<Vec<SymbolMatch>> {
        let pool = self.store.symbols_by_kind(kind, FUZZY_POOL)?;
        let mut matches: Vec<SymbolMatch> = pool
            .into_iter()
            .filter_map(|symbol| {
                match_name(query, &symbol.name).map(|fuzzy| SymbolMatch { symbol, fuzzy })
            })
            .collect();
        matches.sort_by(|a, b| {
            b.fuzzy
                .score
                .partial_cmp(&a.fuzzy.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.name.cmp(&b.symbol.name))
                .then_with(|| a.symbol.file_path.cmp(&b.symbol.file_path))
                .then_with(|| a.symbol.start_line.cmp(&b.symbol.start_line))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    /// Fuzzy file lookup. Filename matches outrank path-only matches.
    pub fn fuzzy_search_files(&self, query: &str, limit: usize) -> Result<Vec<FileMatch>> {
        let paths = self.store.all_file_paths()?;
        let mut matches: Vec<FileMatch> = paths
            .into_iter()
            .filter_map(|path| {
                let filename_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
                let filename = &path[filename_start..];

                if let Some(mut fuzzy) = match_name(query, filename) {
                    for idx in &mut fuzzy.indices {
                        *idx += filename_start;
                    }
                    return Some(FileMatch { path, fuzzy });
                }
                match_name(query, &path).map(|mut fuzzy| {
                    fuzzy.score *= 0.8;
                    FileMatch { path, fuzzy }
                })
            })
            .filter(|m| m.fuzzy.score > crate::fuzzy::SCORE_THRESHOLD)
            .collect();
        matches.sort_by(|a, b| {
            b.fuzzy
                .score
                .partial_cmp(&a.fuzzy.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.cmp(&b.path))
        });
        matches.truncate(limit);
        Ok(matches)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
