use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Schema and tool identity
// ---------------------------------------------------------------------------

/// Bumped whenever the store layout changes. A store written by a different
/// version refuses to open; the indexer rebuilds it from scratch.
pub const SCHEMA_VERSION: i32 = 1;

pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Language detection
// ---------------------------------------------------------------------------

/// Source language, detected from the file extension alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    TypeScript,
    JavaScript,
    Python,
    Go,
    C,
    Cpp,
    Java,
    Html,
    Php,
    Svelte,
}

impl Language {
    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            "rs" => Some(Language::Rust),
            "ts" | "tsx" => Some(Language::TypeScript),
            "js" | "jsx" | "mjs" | "cjs" => Some(Language::JavaScript),
            "py" | "pyi" => Some(Language::Python),
            "go" => Some(Language::Go),
            // Ambiguous ".h" maps to C; C++ headers still parse under the C
            // grammar for declaration boundaries.
            "c" | "h" => Some(Language::C),
            "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx" => Some(Language::Cpp),
            "java" => Some(Language::Java),
            "html" | "htm" | "vue" => Some(Language::Html),
            "php" => Some(Language::Php),
            "svelte" => Some(Language::Svelte),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Python => "python",
            Language::Go => "go",
            Language::C => "c",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Html => "html",
            Language::Php => "php",
            Language::Svelte => "svelte",
        }
    }
}

/// Language tag stored on a chunk: the detected language's label, or the raw
/// extension for files chunked by line windows only.
pub fn language_tag(ext: &str) -> String {
    Language::from_ext(ext).map(|l| l.label().to_string()).unwrap_or_else(|| ext.to_string())
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    Function,
    Class,
    Method,
    Block,
    File,
}

impl ChunkType {
    pub fn label(&self) -> &'static str {
        match self {
            ChunkType::Function => "function",
            ChunkType::Class => "class",
            ChunkType::Method => "method",
            ChunkType::Block => "block",
            ChunkType::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(ChunkType::Function),
            "class" => Some(ChunkType::Class),
            "method" => Some(ChunkType::Method),
            "block" => Some(ChunkType::Block),
            "file" => Some(ChunkType::File),
            _ => None,
        }
    }
}

/// A contiguous region of one file with code-aware boundaries, the unit of
/// embedding and retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    /// Stable id: `{path}:{start_line}:{first_8_hex_of_content_hash}`.
    pub id: String,
    pub file_path: String,
    pub language: String,
    pub content: String,
    pub chunk_type: ChunkType,
    /// Declared identifier, if the chunk covers a named declaration.
    pub name: Option<String>,
    /// Enclosing declaration's name (e.g. a method's class).
    pub parent_name: Option<String>,
    /// 1-indexed, inclusive.
    pub start_line: usize,
    /// 1-indexed, inclusive.
    pub end_line: usize,
    /// SHA-256 hex of `content`.
    pub content_hash: String,
}

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        file_path: &str,
        language: &str,
        content: String,
        chunk_type: ChunkType,
        name: Option<String>,
        parent_name: Option<String>,
        start_line: usize,
        end_line: usize,
    ) -> Self {
        let content_hash = sha256_hex(content.as_bytes());
        let id = chunk_id(file_path, start_line, &content_hash);
        Chunk {
            id,
            file_path: file_path.to_string(),
            language: language.to_string(),
            content,
            chunk_type,
            name,
            parent_name,
            start_line,
            end_line,
            content_hash,
        }
    }
}

/// Build a chunk id from its parts. Stable across reindexes as long as content
/// and start line are unchanged, and constructible by callers requesting a
/// specific chunk.
pub fn chunk_id(file_path: &str, start_line: usize, content_hash: &str) -> String {
    format!("{}:{}:{}", file_path, start_line, &content_hash[..8])
}

/// SHA-256 digest as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Type,
    Variable,
    Constant,
    Interface,
    Method,
}

impl SymbolKind {
    pub fn label(&self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::Type => "type",
            SymbolKind::Variable => "variable",
            SymbolKind::Constant => "constant",
            SymbolKind::Interface => "interface",
            SymbolKind::Method => "method",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(SymbolKind::Function),
            "type" => Some(SymbolKind::Type),
            "variable" => Some(SymbolKind::Variable),
            "constant" => Some(SymbolKind::Constant),
            "interface" => Some(SymbolKind::Interface),
            "method" => Some(SymbolKind::Method),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn label(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Visibility::Public),
            "private" => Some(Visibility::Private),
            _ => None,
        }
    }
}

/// A declaration with its location, signature, and doc comment.
#[derive(Debug, Clone, Serialize)]
pub struct Symbol {
    /// `{file_path}:{start_line}:{name}`, unique per (name, kind, file, line).
    pub id: String,
    pub name: String,
    pub kind: SymbolKind,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    /// One-line display signature, body stripped.
    pub signature: String,
    pub visibility: Visibility,
    pub doc_comment: Option<String>,
}

impl Symbol {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        kind: SymbolKind,
        file_path: &str,
        start_line: usize,
        end_line: usize,
        signature: String,
        visibility: Visibility,
        doc_comment: Option<String>,
    ) -> Self {
        let id = format!("{}:{}:{}", file_path, start_line, name);
        Symbol {
            id,
            name,
            kind,
            file_path: file_path.to_string(),
            start_line,
            end_line,
            signature,
            visibility,
            doc_comment,
        }
    }
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Call,
    TypeUse,
    Import,
    Implement,
}

impl RefKind {
    pub fn label(&self) -> &'static str {
        match self {
            RefKind::Call => "call",
            RefKind::TypeUse => "type_use",
            RefKind::Import => "import",
            RefKind::Implement => "implement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "call" => Some(RefKind::Call),
            "type_use" => Some(RefKind::TypeUse),
            "import" => Some(RefKind::Import),
            "implement" => Some(RefKind::Implement),
            _ => None,
        }
    }
}

/// A directed edge from a declaration site to a name it uses.
///
/// `from_symbol` is the enclosing declaration's name; references outside any
/// declaration (file-scope statements, imports) use the file path instead.
#[derive(Debug, Clone, Serialize)]
pub struct Reference {
    pub id: String,
    pub from_symbol: String,
    pub to_symbol: String,
    pub kind: RefKind,
    pub file_path: String,
    pub line: usize,
    /// True until the post-pass resolves `to_symbol` to a unique indexed symbol.
    pub is_external: bool,
}

impl Reference {
    pub fn new(
        from_symbol: String,
        to_symbol: String,
        kind: RefKind,
        file_path: &str,
        line: usize,
    ) -> Self {
        let id = format!("{}:{}:{}:{}", file_path, line, to_symbol, kind.label());
        Reference {
            id,
            from_symbol,
            to_symbol,
            kind,
            file_path: file_path.to_string(),
            line,
            is_external: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-file bundle flowing through the indexing pipeline
// ---------------------------------------------------------------------------

/// Everything extracted from one file; committed to the store in a single
/// transaction once all its chunks have embeddings.
#[derive(Debug, Clone)]
pub struct FileBundle {
    pub file_path: String,
    pub content_hash: String,
    pub language: String,
    pub chunks: Vec<Chunk>,
    pub symbols: Vec<Symbol>,
    pub references: Vec<Reference>,
}

// ---------------------------------------------------------------------------
// Store metadata and stats
// ---------------------------------------------------------------------------

/// One row per store, governing compatibility checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub schema_version: i32,
    pub tool_version: String,
    pub embedding_provider: String,
    pub embedding_model: String,
    /// Fixed by the first successful embedding call; 0 until then.
    pub embedding_dimensions: usize,
    pub chunking_strategy: String,
    pub reranker_model: Option<String>,
    pub config_hash: String,
    /// Unix seconds.
    pub created_at: i64,
    pub last_updated: i64,
}

/// Derived counts for status reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub indexed_files: usize,
    pub total_chunks: usize,
    pub total_symbols: usize,
    pub total_references: usize,
    pub db_size_bytes: u64,
    /// Unix seconds of the most recent file-cache write, if any.
    pub last_indexed: Option<i64>,
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancel signal, consulted at queue boundaries, before embedding
/// batches, and before store transactions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Unix seconds now.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_stable_for_same_content_and_line() {
        let a = Chunk::new(
            "src/main.rs",
            "rust",
            "fn main() {}".into(),
            ChunkType::Function,
            Some("main".into()),
            None,
            1,
            1,
        );
        let b = Chunk::new(
            "src/main.rs",
            "rust",
            "fn main() {}".into(),
            ChunkType::Function,
            Some("main".into()),
            None,
            1,
            1,
        );
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("src/main.rs:1:"));
        assert_eq!(a.id.rsplit(':').next().unwrap().len(), 8);
    }

    #[test]
    fn chunk_id_changes_with_content() {
        let a = Chunk::new("src/main.rs", "rust", "fn main() {}".into(), ChunkType::Function, None, None, 1, 1);
        let b = Chunk::new("src/main.rs", "rust", "fn main() { run() }".into(), ChunkType::Function, None, None, 1, 1);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn language_detection_by_extension() {
        assert_eq!(Language::from_ext("rs"), Some(Language::Rust));
        assert_eq!(Language::from_ext("tsx"), Some(Language::TypeScript));
        assert_eq!(Language::from_ext("h"), Some(Language::C));
        assert_eq!(Language::from_ext("weird"), None);
        assert_eq!(language_tag("go"), "go");
        assert_eq!(language_tag("lua"), "lua");
    }

    #[test]
    fn kind_labels_round_trip() {
        for k in [
            SymbolKind::Function,
            SymbolKind::Type,
            SymbolKind::Variable,
            SymbolKind::Constant,
            SymbolKind::Interface,
            SymbolKind::Method,
        ] {
            assert_eq!(SymbolKind::parse(k.label()), Some(k));
        }
        for k in [RefKind::Call, RefKind::TypeUse, RefKind::Import, RefKind::Implement] {
            assert_eq!(RefKind::parse(k.label()), Some(k));
        }
    }
}
