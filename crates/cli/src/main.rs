//! CodeQuarry CLI — index and query a codebase from the terminal.
//!
//! Exit codes: 0 success, 1 runtime failure, 2 invalid configuration.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use codequarry_core::config::write_default_config;
use codequarry_core::store::SymbolSort;
use codequarry_core::types::CancelToken;
use codequarry_core::{
    ChunkType, Engine, Error, SearchFilters, SearchMode, SearchRequest, SymbolKind,
};

/// CodeQuarry — local semantic code search and analysis.
#[derive(Parser)]
#[command(name = "codequarry", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root (default: current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .codequarry/config.yaml
    Init,
    /// Index (or incrementally re-index) the project
    Index {
        /// Re-chunk and re-embed every file, ignoring the cache
        #[arg(long)]
        force: bool,
    },
    /// Hybrid search over the index
    Search {
        /// Free-text query
        query: String,

        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,

        /// Retrieval mode: vector, bm25, or hybrid
        #[arg(long)]
        mode: Option<String>,

        /// Filter by language (repeatable)
        #[arg(long = "lang")]
        languages: Vec<String>,

        /// Filter by chunk type (repeatable): function, class, method, block, file
        #[arg(long = "chunk-type")]
        chunk_types: Vec<String>,

        /// Filter by file glob (repeatable)
        #[arg(long = "glob")]
        globs: Vec<String>,

        /// Attach N source lines of context around each result
        #[arg(long)]
        context: Option<usize>,

        /// Skip the reranker even when configured
        #[arg(long)]
        no_rerank: bool,
    },
    /// Index statistics
    Stats,
    /// Look up symbols by name
    Symbols {
        query: String,

        /// Restrict to a kind: function, type, variable, constant, interface, method
        #[arg(long)]
        kind: Option<String>,

        /// Use the fuzzy matcher instead of substring lookup
        #[arg(long)]
        fuzzy: bool,

        /// Minimum declaration length in lines
        #[arg(long, default_value = "0")]
        min_lines: usize,

        /// Sort order: name, lines, or file
        #[arg(long)]
        sort: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Find functions longer than a line threshold
    LongFunctions {
        #[arg(long, default_value = "50")]
        min_lines: usize,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// References targeting a symbol
    Callers {
        name: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// References originating from a symbol
    Callees {
        name: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Heuristic entry points (main, init, tests, handlers, CLI verbs)
    EntryPoints {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Module-level import graph
    Imports {
        #[arg(long, default_value = "500")]
        limit: usize,
    },
    /// Fuzzy file lookup
    Files {
        query: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("codequarry=warn".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let root = cli
        .root
        .clone()
        .unwrap_or_else(|| std::env::current_dir().expect("could not determine current directory"));

    std::process::exit(match run(&cli, &root) {
        Ok(()) => 0,
        Err(e @ Error::Config(_)) => {
            eprintln!("error: {e}");
            2
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    });
}

fn run(cli: &Cli, root: &std::path::Path) -> Result<(), Error> {
    match &cli.command {
        Commands::Init => {
            let path = write_default_config(root)?;
            eprintln!("wrote {}", path.display());
            Ok(())
        }

        Commands::Index { force } => {
            let engine = Engine::open(root)?;
            let cancel = CancelToken::new();
            let report = engine.indexer.index(*force, &cancel, None)?;

            if cli.json {
                let out = serde_json::json!({
                    "files_scanned": report.files_scanned,
                    "files_indexed": report.files_indexed,
                    "files_cached": report.files_cached,
                    "files_deleted": report.files_deleted,
                    "files_failed": report.files_failed,
                    "chunks_indexed": report.chunks_indexed,
                    "references_resolved": report.references_resolved,
                    "truncated": report.truncated,
                    "interrupted": report.interrupted,
                    "warnings": report.warnings,
                    "duration_ms": report.duration_ms,
                });
                println!("{}", serde_json::to_string_pretty(&out).unwrap());
            } else {
                println!(
                    "indexed {} file(s) ({} cached, {} deleted, {} failed), {} chunks in {}ms",
                    report.files_indexed,
                    report.files_cached,
                    report.files_deleted,
                    report.files_failed,
                    report.chunks_indexed,
                    report.duration_ms,
                );
                for w in &report.warnings {
                    eprintln!("warning: {w}");
                }
                if report.interrupted {
                    eprintln!("interrupted — rerun to resume");
                }
            }
            Ok(())
        }

        Commands::Search {
            query,
            limit,
            mode,
            languages,
            chunk_types,
            globs,
            context,
            no_rerank,
        } => {
            let engine = Engine::open(root)?;
            let mut request = SearchRequest::from_config(&engine.config, query);
            if let Some(l) = limit {
                request.limit = *l;
            }
            if let Some(m) = mode {
                request.mode = SearchMode::parse(m)
                    .ok_or_else(|| Error::Config(format!("unknown search mode '{m}'")))?;
            }
            let mut parsed_types = Vec::new();
            for ct in chunk_types {
                parsed_types.push(
                    ChunkType::parse(ct)
                        .ok_or_else(|| Error::Config(format!("unknown chunk type '{ct}'")))?,
                );
            }
            request.filters = SearchFilters {
                languages: languages.clone(),
                chunk_types: parsed_types,
                file_globs: globs.clone(),
            };
            if let Some(n) = context {
                request.include_context = true;
                request.context_lines = *n;
            }
            if *no_rerank {
                request.use_reranker = false;
            }

            let results = engine.search.search(&request)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&results).unwrap());
            } else if results.is_empty() {
                eprintln!("no results for '{query}'");
            } else {
                for r in &results {
                    println!(
                        "{:<50} {:>6.3}  {}:{}-{} [{}]",
                        r.chunk.name.as_deref().unwrap_or("(anonymous)"),
                        r.score,
                        r.chunk.file_path,
                        r.chunk.start_line,
                        r.chunk.end_line,
                        r.chunk.chunk_type.label(),
                    );
                    if let Some(before) = &r.context_before {
                        for line in before.lines() {
                            println!("  | {line}");
                        }
                    }
                    for line in r.chunk.content.lines().take(5) {
                        println!("  > {line}");
                    }
                    if let Some(after) = &r.context_after {
                        for line in after.lines() {
                            println!("  | {line}");
                        }
                    }
                }
            }
            Ok(())
        }

        Commands::Stats => {
            let engine = Engine::open(root)?;
            let stats = engine.store.get_stats()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats).unwrap());
            } else {
                println!("Files:      {}", stats.indexed_files);
                println!("Chunks:     {}", stats.total_chunks);
                println!("Symbols:    {}", stats.total_symbols);
                println!("References: {}", stats.total_references);
                println!("DB size:    {} bytes", stats.db_size_bytes);
                match stats.last_indexed {
                    Some(ts) => println!("Last index: {ts} (unix)"),
                    None => println!("Last index: never"),
                }
            }
            Ok(())
        }

        Commands::Symbols { query, kind, fuzzy, min_lines, sort, limit } => {
            let engine = Engine::open(root)?;
            let kind = parse_kind(kind.as_deref())?;

            if *fuzzy {
                let matches = engine.graph.fuzzy_search_symbols(query, kind, *limit)?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&matches).unwrap());
                } else {
                    for m in &matches {
                        println!(
                            "{:<40} {:>5.2} {:<9} {}:{}",
                            m.symbol.name,
                            m.fuzzy.score,
                            m.fuzzy.match_type.label(),
                            m.symbol.file_path,
                            m.symbol.start_line,
                        );
                    }
                }
                return Ok(());
            }

            let sort = match sort.as_deref() {
                Some(s) => SymbolSort::parse(s)
                    .ok_or_else(|| Error::Config(format!("unknown sort order '{s}'")))?,
                None => SymbolSort::Name,
            };
            let symbols = if *min_lines > 0 || sort != SymbolSort::Name {
                engine.store.find_symbols_advanced(query, kind, *min_lines, sort, *limit)?
            } else {
                engine.store.find_symbols(query, kind, *limit)?
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&symbols).unwrap());
            } else {
                for s in &symbols {
                    println!(
                        "{:<40} {:<9} {:<8} {}:{}-{}",
                        s.name,
                        s.kind.label(),
                        s.visibility.label(),
                        s.file_path,
                        s.start_line,
                        s.end_line,
                    );
                }
            }
            Ok(())
        }

        Commands::LongFunctions { min_lines, limit } => {
            let engine = Engine::open(root)?;
            let symbols = engine.store.find_long_functions(*min_lines, *limit)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&symbols).unwrap());
            } else {
                for s in &symbols {
                    println!(
                        "{:<40} {:>5} lines  {}:{}",
                        s.name,
                        s.end_line - s.start_line + 1,
                        s.file_path,
                        s.start_line,
                    );
                }
            }
            Ok(())
        }

        Commands::Callers { name, limit } => {
            let engine = Engine::open(root)?;
            print_references(cli, &engine.graph.get_callers(name, *limit)?)
        }

        Commands::Callees { name, limit } => {
            let engine = Engine::open(root)?;
            print_references(cli, &engine.graph.get_callees(name, *limit)?)
        }

        Commands::EntryPoints { limit } => {
            let engine = Engine::open(root)?;
            let points = engine.graph.get_entry_points(*limit)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&points).unwrap());
            } else {
                for p in &points {
                    println!(
                        "{:<40} {:<8} {:.1}  {}:{}",
                        p.symbol.name, p.category, p.confidence, p.symbol.file_path, p.symbol.start_line,
                    );
                }
            }
            Ok(())
        }

        Commands::Imports { limit } => {
            let engine = Engine::open(root)?;
            let graph = engine.graph.get_import_graph(*limit)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&graph).unwrap());
            } else {
                let mut counts: Vec<(&String, &usize)> = graph.import_counts.iter().collect();
                counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
                for (module, count) in counts {
                    println!("{:<50} imported {} time(s)", module, count);
                }
            }
            Ok(())
        }

        Commands::Files { query, limit } => {
            let engine = Engine::open(root)?;
            let matches = engine.graph.fuzzy_search_files(query, *limit)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&matches).unwrap());
            } else {
                for m in &matches {
                    println!("{:<60} {:>5.2} {}", m.path, m.fuzzy.score, m.fuzzy.match_type.label());
                }
            }
            Ok(())
        }
    }
}

fn parse_kind(kind: Option<&str>) -> Result<Option<SymbolKind>, Error> {
    match kind {
        None => Ok(None),
        Some(k) => SymbolKind::parse(k)
            .map(Some)
            .ok_or_else(|| Error::Config(format!("unknown symbol kind '{k}'"))),
    }
}

fn print_references(cli: &Cli, refs: &[codequarry_core::Reference]) -> Result<(), Error> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(refs).unwrap());
    } else if refs.is_empty() {
        eprintln!("no references");
    } else {
        for r in refs {
            println!(
                "{:<30} -> {:<30} {:<9} {}:{}{}",
                r.from_symbol,
                r.to_symbol,
                r.kind.label(),
                r.file_path,
                r.line,
                if r.is_external { "  (external)" } else { "" },
            );
        }
    }
    Ok(())
}
