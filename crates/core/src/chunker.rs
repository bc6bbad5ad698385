//! Semantic chunking: split a source file into code-aware chunks and extract
//! its symbols and references.
//!
//! The AST strategy parses with tree-sitter and emits one chunk per top-level
//! declaration and per method, subdividing oversized declarations at statement
//! boundaries. Files whose grammar is unavailable (or whose parse fails) fall
//! back to line-aligned token windows. Template files (HTML, PHP, Svelte)
//! have their embedded script regions extracted and re-chunked under the
//! embedded language.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::tokenizer::Tokenizer;
use crate::types::{
    language_tag, Chunk, ChunkType, Language, RefKind, Reference, Symbol, SymbolKind, Visibility,
};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;
use tree_sitter::{Node, Parser};

// ---------------------------------------------------------------------------
// Public contract
// ---------------------------------------------------------------------------

/// A file handed to the chunker: path, extension, decoded content.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub rel_path: String,
    pub ext: String,
    pub content: String,
}

/// Everything a chunker extracts from one file.
#[derive(Debug, Default)]
pub struct ChunkOutput {
    pub chunks: Vec<Chunk>,
    pub symbols: Vec<Symbol>,
    pub references: Vec<Reference>,
}

/// A chunking strategy. Must produce at least one chunk for any non-empty file.
pub trait Chunker: Send + Sync {
    fn name(&self) -> &'static str;
    fn chunk(&self, file: &SourceFile) -> Result<ChunkOutput>;
}

/// Build the configured strategy ("ast" with line fallback, or "lines").
pub fn create_chunker(config: &Config, tokenizer: Arc<dyn Tokenizer>) -> Arc<dyn Chunker> {
    let max_tokens = config.chunk_token_budget();
    match config.chunking.strategy.as_str() {
        "lines" => Arc::new(LineChunker { max_tokens, tokenizer }),
        _ => Arc::new(AstChunker {
            max_tokens,
            tokenizer: tokenizer.clone(),
            extract_symbols: config.analysis.extract_symbols,
            extract_references: config.analysis.extract_references,
            fallback: LineChunker { max_tokens, tokenizer },
        }),
    }
}

// ---------------------------------------------------------------------------
// Line-windowed fallback
// ---------------------------------------------------------------------------

/// Fixed-size token windows aligned to line boundaries, zero overlap.
pub struct LineChunker {
    pub max_tokens: usize,
    pub tokenizer: Arc<dyn Tokenizer>,
}

impl LineChunker {
    /// Window `content` into block chunks, numbering lines from `first_line`.
    fn window(&self, file: &SourceFile, language: &str, content: &str, first_line: usize) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut buf = String::new();
        let mut buf_tokens = 0usize;
        let mut buf_start = first_line;
        let mut line_no = first_line;

        for line in content.lines() {
            let line_tokens = self.tokenizer.count_tokens(line) + 1;
            if buf_tokens > 0 && buf_tokens + line_tokens > self.max_tokens {
                chunks.push(Chunk::new(
                    &file.rel_path,
                    language,
                    std::mem::take(&mut buf),
                    ChunkType::Block,
                    None,
                    None,
                    buf_start,
                    line_no - 1,
                ));
                buf_tokens = 0;
                buf_start = line_no;
            }
            if !buf.is_empty() {
                buf.push('\n');
            }
            buf.push_str(line);
            buf_tokens += line_tokens;
            line_no += 1;
        }

        if !buf.trim().is_empty() {
            chunks.push(Chunk::new(
                &file.rel_path,
                language,
                buf,
                ChunkType::Block,
                None,
                None,
                buf_start,
                line_no.saturating_sub(1).max(buf_start),
            ));
        }
        chunks
    }
}

impl Chunker for LineChunker {
    fn name(&self) -> &'static str {
        "lines"
    }

    fn chunk(&self, file: &SourceFile) -> Result<ChunkOutput> {
        let language = language_tag(&file.ext);
        let chunks = self.window(file, &language, &file.content, 1);
        if chunks.is_empty() && !file.content.trim().is_empty() {
            return Err(Error::data(&file.rel_path, "chunker produced no chunks for non-empty file"));
        }
        Ok(ChunkOutput { chunks, ..Default::default() })
    }
}

// ---------------------------------------------------------------------------
// Grammar resolution
// ---------------------------------------------------------------------------

fn grammar_for(lang: Language) -> Option<tree_sitter::Language> {
    match lang {
        Language::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
        Language::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        Language::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
        Language::Python => Some(tree_sitter_python::LANGUAGE.into()),
        Language::Go => Some(tree_sitter_go::LANGUAGE.into()),
        Language::C => Some(tree_sitter_c::LANGUAGE.into()),
        Language::Cpp => Some(tree_sitter_cpp::LANGUAGE.into()),
        Language::Java => Some(tree_sitter_java::LANGUAGE.into()),
        Language::Html | Language::Php | Language::Svelte => None,
    }
}

// ---------------------------------------------------------------------------
// AST-aware chunker
// ---------------------------------------------------------------------------

pub struct AstChunker {
    pub max_tokens: usize,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub extract_symbols: bool,
    pub extract_references: bool,
    pub fallback: LineChunker,
}

/// What a declaration node contributes: a chunk kind plus a symbol kind.
#[derive(Clone, Copy, PartialEq)]
enum DeclClass {
    Function,
    Method,
    /// Named type carrier (struct/enum/class/type alias).
    Type,
    Interface,
    Constant,
    Variable,
    /// Method container without its own symbol (Rust impl blocks).
    ImplBlock,
}

impl DeclClass {
    fn chunk_type(self) -> ChunkType {
        match self {
            DeclClass::Function => ChunkType::Function,
            DeclClass::Method => ChunkType::Method,
            DeclClass::Type | DeclClass::Interface | DeclClass::ImplBlock => ChunkType::Class,
            DeclClass::Constant | DeclClass::Variable => ChunkType::Block,
        }
    }

    fn symbol_kind(self) -> Option<SymbolKind> {
        match self {
            DeclClass::Function => Some(SymbolKind::Function),
            DeclClass::Method => Some(SymbolKind::Method),
            DeclClass::Type => Some(SymbolKind::Type),
            DeclClass::Interface => Some(SymbolKind::Interface),
            DeclClass::Constant => Some(SymbolKind::Constant),
            DeclClass::Variable => Some(SymbolKind::Variable),
            DeclClass::ImplBlock => None,
        }
    }
}

/// Classify a tree-sitter node kind as a declaration, per language.
fn classify_node(kind: &str, lang: Language) -> Option<DeclClass> {
    match (lang, kind) {
        (Language::Rust, "function_item") => Some(DeclClass::Function),
        (Language::Rust, "struct_item" | "enum_item" | "type_item" | "union_item") => {
            Some(DeclClass::Type)
        }
        (Language::Rust, "trait_item") => Some(DeclClass::Interface),
        (Language::Rust, "impl_item") => Some(DeclClass::ImplBlock),
        (Language::Rust, "const_item" | "static_item") => Some(DeclClass::Constant),

        (Language::TypeScript | Language::JavaScript, "function_declaration") => {
            Some(DeclClass::Function)
        }
        (Language::TypeScript | Language::JavaScript, "class_declaration") => Some(DeclClass::Type),
        (Language::TypeScript, "interface_declaration") => Some(DeclClass::Interface),
        (Language::TypeScript, "type_alias_declaration" | "enum_declaration") => {
            Some(DeclClass::Type)
        }
        (Language::TypeScript | Language::JavaScript, "method_definition") => {
            Some(DeclClass::Method)
        }
        (Language::TypeScript | Language::JavaScript, "lexical_declaration") => {
            Some(DeclClass::Variable)
        }

        (Language::Python, "function_definition") => Some(DeclClass::Function),
        (Language::Python, "class_definition") => Some(DeclClass::Type),

        (Language::Go, "function_declaration") => Some(DeclClass::Function),
        (Language::Go, "method_declaration") => Some(DeclClass::Method),
        (Language::Go, "type_declaration") => Some(DeclClass::Type),
        (Language::Go, "const_declaration") => Some(DeclClass::Constant),
        (Language::Go, "var_declaration") => Some(DeclClass::Variable),

        (Language::C | Language::Cpp, "function_definition") => Some(DeclClass::Function),
        (Language::C | Language::Cpp, "struct_specifier" | "enum_specifier") => {
            Some(DeclClass::Type)
        }
        (Language::Cpp, "class_specifier") => Some(DeclClass::Type),

        (Language::Java, "class_declaration" | "enum_declaration") => Some(DeclClass::Type),
        (Language::Java, "interface_declaration") => Some(DeclClass::Interface),
        (Language::Java, "method_declaration" | "constructor_declaration") => {
            Some(DeclClass::Method)
        }

        _ => None,
    }
}

/// Container kinds whose children hold methods worth chunking separately.
fn is_method_container(kind: &str, lang: Language) -> bool {
    matches!(
        (lang, kind),
        (Language::Rust, "impl_item" | "trait_item")
            | (Language::TypeScript | Language::JavaScript, "class_declaration")
            | (Language::Python, "class_definition")
            | (Language::Java, "class_declaration" | "interface_declaration" | "enum_declaration")
            | (Language::Cpp, "class_specifier" | "struct_specifier")
    )
}

/// Nodes that wrap declarations and should be looked through.
fn is_transparent(kind: &str) -> bool {
    matches!(
        kind,
        "export_statement" | "decorated_definition" | "declaration_list" | "namespace_definition"
    )
}

// -- name / signature / visibility ------------------------------------------

/// Extract the declared identifier using field names, with per-language fallbacks.
fn extract_name(node: &Node, source: &[u8], lang: Language) -> Option<String> {
    if let Some(name_node) = node.child_by_field_name("name") {
        if let Ok(text) = name_node.utf8_text(source) {
            let name = text.trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }

    match (lang, node.kind()) {
        // impl blocks name the type they extend
        (Language::Rust, "impl_item") => node
            .child_by_field_name("type")
            .and_then(|t| t.utf8_text(source).ok())
            .map(|t| t.trim().to_string()),
        // Go wraps the named spec inside the declaration
        (Language::Go, "type_declaration" | "const_declaration" | "var_declaration") => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if matches!(child.kind(), "type_spec" | "const_spec" | "var_spec") {
                    if let Some(n) = child.child_by_field_name("name") {
                        if let Ok(text) = n.utf8_text(source) {
                            return Some(text.trim().to_string());
                        }
                    }
                }
            }
            None
        }
        // C functions bury the identifier in the declarator chain
        (Language::C | Language::Cpp, "function_definition") => {
            let decl = node.child_by_field_name("declarator")?;
            let text = declarator_identifier(&decl, source)?;
            Some(text)
        }
        // const/let bindings name the first declarator
        (Language::TypeScript | Language::JavaScript, "lexical_declaration") => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() == "variable_declarator" {
                    if let Some(n) = child.child_by_field_name("name") {
                        if let Ok(text) = n.utf8_text(source) {
                            return Some(text.trim().to_string());
                        }
                    }
                }
            }
            None
        }
        _ => None,
    }
}

fn declarator_identifier(node: &Node, source: &[u8]) -> Option<String> {
    if node.kind() == "identifier" {
        return node.utf8_text(source).ok().map(|t| t.trim().to_string());
    }
    if let Some(inner) = node.child_by_field_name("declarator") {
        return declarator_identifier(&inner, source);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if let Some(found) = declarator_identifier(&child, source) {
            return Some(found);
        }
    }
    None
}

/// Build a one-line signature from a node, stripping the body.
fn extract_signature(node: &Node, source: &[u8], lang: Language) -> String {
    let text = node.utf8_text(source).unwrap_or("");
    let first_line = text.lines().next().unwrap_or("").trim();

    let sig = if lang == Language::Python {
        match first_line.find(':') {
            Some(colon) => &first_line[..=colon],
            None => first_line,
        }
    } else {
        match first_line.find('{') {
            Some(brace) => first_line[..brace].trim_end(),
            None => first_line,
        }
    };

    if sig.len() > 200 {
        let mut end = 200;
        while end > 0 && !sig.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &sig[..end])
    } else {
        sig.to_string()
    }
}

/// Derive visibility from language rules (exported identifier, pub keyword, …).
fn extract_visibility(node: &Node, source: &[u8], name: &str, lang: Language) -> Visibility {
    match lang {
        Language::Rust => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                if child.kind() == "visibility_modifier" {
                    return Visibility::Public;
                }
            }
            Visibility::Private
        }
        Language::Go => {
            if name.chars().next().map(|c| c.is_uppercase()).unwrap_or(false) {
                Visibility::Public
            } else {
                Visibility::Private
            }
        }
        Language::Python => {
            if name.starts_with('_') {
                Visibility::Private
            } else {
                Visibility::Public
            }
        }
        Language::TypeScript | Language::JavaScript => {
            let mut current = *node;
            while let Some(parent) = current.parent() {
                if parent.kind() == "export_statement" {
                    return Visibility::Public;
                }
                current = parent;
            }
            // class members: private only with an explicit modifier
            let text = node.utf8_text(source).unwrap_or("");
            let head = text.lines().next().unwrap_or("");
            if head.trim_start().starts_with("private ") || name.starts_with('#') {
                Visibility::Private
            } else if node.kind() == "method_definition" {
                Visibility::Public
            } else {
                Visibility::Private
            }
        }
        Language::Java => {
            let text = node.utf8_text(source).unwrap_or("");
            let head = text.lines().next().unwrap_or("");
            if head.contains("public") {
                Visibility::Public
            } else {
                Visibility::Private
            }
        }
        Language::C | Language::Cpp => {
            let text = node.utf8_text(source).unwrap_or("");
            if text.trim_start().starts_with("static ") {
                Visibility::Private
            } else {
                Visibility::Public
            }
        }
        _ => Visibility::Public,
    }
}

/// Collect the doc block immediately preceding a declaration, if any.
fn extract_doc_comment(node: &Node, source: &[u8], lang: Language) -> Option<String> {
    // Python documents below the signature: first statement string in the body.
    if lang == Language::Python {
        let body = node.child_by_field_name("body")?;
        let first = body.named_child(0)?;
        if first.kind() == "expression_statement" {
            let inner = first.named_child(0)?;
            if inner.kind() == "string" {
                let raw = inner.utf8_text(source).ok()?;
                let trimmed = raw
                    .trim_matches(|c| c == '"' || c == '\'')
                    .trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
        return None;
    }

    let mut lines: Vec<String> = Vec::new();
    let mut expected_row = node.start_position().row;
    let mut current = node.prev_sibling();
    while let Some(prev) = current {
        let kind = prev.kind();
        if !(kind == "comment" || kind == "line_comment" || kind == "block_comment") {
            break;
        }
        // Only adjacent comments count as the doc block.
        if prev.end_position().row + 1 < expected_row {
            break;
        }
        if let Ok(text) = prev.utf8_text(source) {
            lines.push(text.trim().to_string());
        }
        expected_row = prev.start_position().row;
        current = prev.prev_sibling();
    }
    if lines.is_empty() {
        return None;
    }
    lines.reverse();
    Some(lines.join("\n"))
}

// -- references --------------------------------------------------------------

/// Extract the callee name from a call expression node, unqualified.
fn extract_callee_name(node: &Node, source: &[u8]) -> Option<String> {
    let func_node = node
        .child_by_field_name("function")
        .or_else(|| node.child_by_field_name("name"))
        .or_else(|| node.child_by_field_name("method"))?;

    let text = func_node.utf8_text(source).ok()?.trim().to_string();
    // "self.process" -> "process", "config::load" -> "load"
    let name = text
        .rsplit_once("::")
        .map(|(_, n)| n)
        .or_else(|| text.rsplit_once('.').map(|(_, n)| n))
        .unwrap_or(&text);

    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(name.to_string())
}

fn is_primitive_type(name: &str) -> bool {
    matches!(
        name,
        "bool" | "i8" | "i16" | "i32" | "i64" | "i128" | "u8" | "u16" | "u32" | "u64" | "u128"
            | "f32" | "f64" | "usize" | "isize" | "str" | "char" | "String" | "Vec" | "Option"
            | "Result" | "Box" | "Arc" | "Rc" | "Self" | "int" | "float" | "double" | "void"
            | "string" | "number" | "boolean" | "any" | "never" | "undefined" | "null" | "object"
            | "None" | "True" | "False" | "error"
    )
}

/// Walk a declaration body, collecting call and type-use references.
fn collect_body_refs(
    node: &Node,
    source: &[u8],
    from_symbol: &str,
    file_path: &str,
    out: &mut Vec<Reference>,
) {
    let kind = node.kind();

    if kind == "call_expression" || kind == "call" || kind == "method_invocation" {
        if let Some(name) = extract_callee_name(node, source) {
            out.push(Reference::new(
                from_symbol.to_string(),
                name,
                RefKind::Call,
                file_path,
                node.start_position().row + 1,
            ));
        }
    } else if kind == "type_identifier" {
        if let Ok(text) = node.utf8_text(source) {
            let name = text.trim();
            if !name.is_empty()
                && !is_primitive_type(name)
                && name.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
            {
                out.push(Reference::new(
                    from_symbol.to_string(),
                    name.to_string(),
                    RefKind::TypeUse,
                    file_path,
                    node.start_position().row + 1,
                ));
            }
        }
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_body_refs(&child, source, from_symbol, file_path, out);
    }
}

/// Node kinds that introduce imports, per language.
fn import_target(node: &Node, source: &[u8], lang: Language) -> Vec<(String, usize)> {
    let line = node.start_position().row + 1;
    let mut out = Vec::new();
    match (lang, node.kind()) {
        (Language::Rust, "use_declaration") => {
            if let Some(arg) = node.child_by_field_name("argument") {
                if let Ok(text) = arg.utf8_text(source) {
                    out.push((text.trim().trim_end_matches(';').to_string(), line));
                }
            }
        }
        (Language::Python, "import_statement" | "import_from_statement")
        | (Language::TypeScript | Language::JavaScript, "import_statement")
        | (Language::Java, "import_declaration") => {
            // Take the module path: the first dotted_name / string child.
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                match child.kind() {
                    "dotted_name" | "string" | "scoped_identifier" | "identifier" => {
                        if let Ok(text) = child.utf8_text(source) {
                            out.push((text.trim_matches(|c| c == '"' || c == '\'').to_string(), line));
                        }
                        break;
                    }
                    _ => {}
                }
            }
        }
        (Language::Go, "import_declaration") => {
            let mut stack = vec![*node];
            while let Some(current) = stack.pop() {
                if current.kind() == "import_spec" {
                    if let Some(path) = current.child_by_field_name("path") {
                        if let Ok(text) = path.utf8_text(source) {
                            out.push((
                                text.trim_matches('"').to_string(),
                                current.start_position().row + 1,
                            ));
                        }
                    }
                    continue;
                }
                let mut cursor = current.walk();
                for child in current.children(&mut cursor) {
                    stack.push(child);
                }
            }
        }
        (Language::C | Language::Cpp, "preproc_include") => {
            if let Some(path) = node.child_by_field_name("path") {
                if let Ok(text) = path.utf8_text(source) {
                    out.push((
                        text.trim_matches(|c| c == '"' || c == '<' || c == '>').to_string(),
                        line,
                    ));
                }
            }
        }
        _ => {}
    }
    out
}

/// Extract implement/extends targets from a declaration node.
fn implement_targets(node: &Node, source: &[u8], lang: Language) -> Vec<(String, usize)> {
    let mut out = Vec::new();
    let line = node.start_position().row + 1;
    match (lang, node.kind()) {
        // impl Trait for Type
        (Language::Rust, "impl_item") => {
            if let Some(trait_node) = node.child_by_field_name("trait") {
                if let Ok(text) = trait_node.utf8_text(source) {
                    out.push((text.trim().to_string(), line));
                }
            }
        }
        // class Foo extends Bar implements Baz
        (Language::TypeScript | Language::JavaScript, "class_declaration")
        | (Language::Java, "class_declaration") => {
            let mut stack = vec![*node];
            while let Some(current) = stack.pop() {
                let k = current.kind();
                if matches!(
                    k,
                    "extends_clause" | "implements_clause" | "class_heritage" | "super_interfaces" | "superclass"
                ) {
                    let mut cursor = current.walk();
                    for child in current.children(&mut cursor) {
                        if matches!(child.kind(), "type_identifier" | "identifier") {
                            if let Ok(text) = child.utf8_text(source) {
                                out.push((text.trim().to_string(), current.start_position().row + 1));
                            }
                        } else {
                            stack.push(child);
                        }
                    }
                    continue;
                }
                if current.id() == node.id() || k == "class_body" {
                    if k == "class_body" {
                        continue;
                    }
                    let mut cursor = current.walk();
                    for child in current.children(&mut cursor) {
                        stack.push(child);
                    }
                }
            }
        }
        // class Foo(Base):
        (Language::Python, "class_definition") => {
            if let Some(supers) = node.child_by_field_name("superclasses") {
                let mut cursor = supers.walk();
                for child in supers.children(&mut cursor) {
                    if matches!(child.kind(), "identifier" | "attribute") {
                        if let Ok(text) = child.utf8_text(source) {
                            let name =
                                text.rsplit_once('.').map(|(_, n)| n).unwrap_or(text).trim();
                            if !name.is_empty() && name != "object" {
                                out.push((name.to_string(), line));
                            }
                        }
                    }
                }
            }
        }
        _ => {}
    }
    out
}

// -- declaration walk --------------------------------------------------------

struct Decl<'a> {
    node: Node<'a>,
    class: DeclClass,
    name: Option<String>,
    parent_name: Option<String>,
}

/// Collect declaration nodes in source order, descending into containers.
fn collect_decls<'a>(
    node: Node<'a>,
    source: &[u8],
    lang: Language,
    parent_name: Option<&str>,
    out: &mut Vec<Decl<'a>>,
) {
    let kind = node.kind();

    if is_transparent(kind) {
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            collect_decls(child, source, lang, parent_name, out);
        }
        return;
    }

    if let Some(mut class) = classify_node(kind, lang) {
        // Functions nested in a container are methods.
        if parent_name.is_some() && class == DeclClass::Function {
            class = DeclClass::Method;
        }
        let name = extract_name(&node, source, lang);
        out.push(Decl {
            node,
            class,
            name: name.clone(),
            parent_name: parent_name.map(|s| s.to_string()),
        });

        if is_method_container(kind, lang) {
            let container = name.unwrap_or_default();
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                collect_decls(child, source, lang, Some(&container), out);
            }
        }
        return;
    }

    // Not a declaration: keep descending at the same scope.
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_decls(child, source, lang, parent_name, out);
    }
}

// -- chunk assembly ----------------------------------------------------------

impl AstChunker {
    /// Emit chunks for one declaration, subdividing at statement boundaries
    /// when the token budget is exceeded.
    fn decl_chunks(
        &self,
        file: &SourceFile,
        language: &str,
        lines: &[&str],
        decl: &Decl,
        skip_body_of_container: bool,
    ) -> Vec<Chunk> {
        let start = decl.node.start_position().row + 1;
        let mut end = decl.node.end_position().row + 1;

        // Containers with separately-chunked methods contribute only their
        // header region (e.g. class fields before the first method).
        if skip_body_of_container {
            let first_method_row = {
                let mut row = None;
                let mut stack = vec![decl.node];
                while let Some(node) = stack.pop() {
                    if node.id() != decl.node.id() {
                        if classify_node(node.kind(), lang_of(language)).is_some() {
                            let r = node.start_position().row + 1;
                            row = Some(row.map_or(r, |cur: usize| cur.min(r)));
                            continue;
                        }
                    }
                    let mut cursor = node.walk();
                    for child in node.children(&mut cursor) {
                        stack.push(child);
                    }
                }
                row
            };
            if let Some(first) = first_method_row {
                end = first.saturating_sub(1);
            }
            if end < start {
                return Vec::new();
            }
        }

        let text = slice_lines(lines, start, end);
        if text.trim().is_empty() {
            return Vec::new();
        }

        if self.tokenizer.count_tokens(&text) <= self.max_tokens {
            return vec![Chunk::new(
                &file.rel_path,
                language,
                text,
                decl.class.chunk_type(),
                decl.name.clone(),
                decl.parent_name.clone(),
                start,
                end,
            )];
        }

        // Oversized: split at statement boundaries within the body.
        let mut split_rows: Vec<usize> = Vec::new();
        if let Some(body) = decl.node.child_by_field_name("body") {
            let mut cursor = body.walk();
            for child in body.named_children(&mut cursor) {
                split_rows.push(child.start_position().row + 1);
            }
        }
        split_rows.retain(|&r| r > start && r <= end);
        split_rows.dedup();

        if split_rows.is_empty() {
            // No statement boundaries to split at (e.g. one giant literal).
            return self
                .fallback
                .window(file, language, &text, start)
                .into_iter()
                .map(|mut c| {
                    c.chunk_type = decl.class.chunk_type();
                    c.name = decl.name.clone();
                    c.parent_name = decl.parent_name.clone();
                    c
                })
                .collect();
        }

        // Greedily group statements until the budget would overflow.
        let mut cut_points: Vec<usize> = Vec::new();
        let mut seg_tokens = 0usize;
        let mut prev_row = start;
        for row in split_rows.iter().copied().chain(std::iter::once(end + 1)) {
            let seg_text = slice_lines(lines, prev_row, row - 1);
            let t = self.tokenizer.count_tokens(&seg_text);
            if seg_tokens > 0 && seg_tokens + t > self.max_tokens {
                cut_points.push(prev_row);
                seg_tokens = 0;
            }
            seg_tokens += t;
            prev_row = row;
        }

        let mut starts = vec![start];
        starts.extend(cut_points);
        starts.dedup();

        let mut chunks = Vec::new();
        for (i, &s) in starts.iter().enumerate() {
            let e = if i + 1 < starts.len() { starts[i + 1] - 1 } else { end };
            let text = slice_lines(lines, s, e);
            if text.trim().is_empty() {
                continue;
            }
            chunks.push(Chunk::new(
                &file.rel_path,
                language,
                text,
                decl.class.chunk_type(),
                decl.name.clone(),
                decl.parent_name.clone(),
                s,
                e,
            ));
        }
        chunks
    }

    fn chunk_parsed(&self, file: &SourceFile, lang: Language) -> Option<ChunkOutput> {
        let grammar = grammar_for(lang)?;
        let mut parser = Parser::new();
        parser.set_language(&grammar).ok()?;
        let tree = parser.parse(&file.content, None)?;
        let root = tree.root_node();
        if root.has_error() && root.named_child_count() == 0 {
            return None;
        }

        let source = file.content.as_bytes();
        let language = lang.label().to_string();
        let lines: Vec<&str> = file.content.lines().collect();

        let mut decls = Vec::new();
        let mut cursor = root.walk();
        for child in root.children(&mut cursor) {
            collect_decls(child, source, lang, None, &mut decls);
        }

        let mut output = ChunkOutput::default();

        // Chunks: one per declaration/method, with container headers reduced.
        let mut covered: Vec<(usize, usize)> = Vec::new();
        for decl in &decls {
            let container = is_method_container(decl.node.kind(), lang);
            let chunks = self.decl_chunks(file, &language, &lines, decl, container);
            for c in &chunks {
                covered.push((c.start_line, c.end_line));
            }
            // Container bodies are covered by their method chunks.
            if container {
                covered.push((
                    decl.node.start_position().row + 1,
                    decl.node.end_position().row + 1,
                ));
            }
            output.chunks.extend(chunks);
        }

        // Interstitial regions (imports, file-scope statements) become blocks.
        for (gap_start, gap_end) in uncovered_ranges(lines.len(), &covered) {
            let text = slice_lines(&lines, gap_start, gap_end);
            if text.trim().is_empty() {
                continue;
            }
            output.chunks.extend(self.fallback.window(file, &language, &text, gap_start));
        }
        output.chunks.sort_by_key(|c| (c.start_line, c.end_line));

        // Symbols
        if self.extract_symbols {
            for decl in &decls {
                let Some(kind) = decl.class.symbol_kind() else { continue };
                let Some(name) = decl.name.clone() else { continue };
                let node = decl.node;
                output.symbols.push(Symbol::new(
                    name.clone(),
                    kind,
                    &file.rel_path,
                    node.start_position().row + 1,
                    node.end_position().row + 1,
                    extract_signature(&node, source, lang),
                    extract_visibility(&node, source, &name, lang),
                    extract_doc_comment(&node, source, lang),
                ));
            }
        }

        // References
        if self.extract_references {
            // Imports and implement edges come from declarations and top level.
            let mut stack = vec![root];
            while let Some(node) = stack.pop() {
                for (target, line) in import_target(&node, source, lang) {
                    output.references.push(Reference::new(
                        file.rel_path.clone(),
                        target,
                        RefKind::Import,
                        &file.rel_path,
                        line,
                    ));
                }
                let mut c = node.walk();
                for child in node.children(&mut c) {
                    stack.push(child);
                }
            }

            for decl in &decls {
                let from = decl.name.clone().unwrap_or_else(|| file.rel_path.clone());
                for (target, line) in implement_targets(&decl.node, source, lang) {
                    output.references.push(Reference::new(
                        from.clone(),
                        target,
                        RefKind::Implement,
                        &file.rel_path,
                        line,
                    ));
                }
                if decl.class == DeclClass::ImplBlock || is_method_container(decl.node.kind(), lang)
                {
                    continue; // bodies handled via their methods
                }
                // The whole declaration, so parameter and return types count too.
                collect_body_refs(&decl.node, source, &from, &file.rel_path, &mut output.references);
            }

            // File-scope calls outside any declaration attribute to the path.
            let decl_ranges: Vec<(usize, usize)> = decls
                .iter()
                .map(|d| (d.node.start_position().row, d.node.end_position().row))
                .collect();
            let mut cursor = root.walk();
            for child in root.children(&mut cursor) {
                let row = child.start_position().row;
                if decl_ranges.iter().any(|&(s, e)| row >= s && row <= e) {
                    continue;
                }
                collect_body_refs(&child, source, &file.rel_path, &file.rel_path, &mut output.references);
            }

            dedup_references(&mut output.references);
        }

        Some(output)
    }

    // -- template handling ----------------------------------------------------

    /// Extract embedded code regions from template files and recurse.
    fn chunk_template(&self, file: &SourceFile, lang: Language) -> Result<ChunkOutput> {
        let (region_re, embedded_ext) = match lang {
            Language::Php => (Regex::new(r"(?s)<\?php(.*?)(\?>|\z)").unwrap(), "php"),
            // <script lang="ts"> is still chunked as TS-compatible JS grammar input
            _ => (Regex::new(r"(?s)<script[^>]*>(.*?)</script>").unwrap(), "js"),
        };

        let mut output = ChunkOutput::default();
        let mut covered: Vec<(usize, usize)> = Vec::new();

        for caps in region_re.captures_iter(&file.content) {
            let m = caps.get(1).unwrap();
            let body = m.as_str();
            if body.trim().is_empty() {
                continue;
            }
            let first_line = file.content[..m.start()].lines().count().max(1);
            let last_line = first_line + body.lines().count().saturating_sub(1);
            covered.push((first_line, last_line));

            let embedded = SourceFile {
                rel_path: file.rel_path.clone(),
                ext: embedded_ext.to_string(),
                content: body.to_string(),
            };
            let mut inner = match Language::from_ext(embedded_ext).and_then(|l| self.chunk_parsed(&embedded, l)) {
                Some(o) => o,
                None => {
                    let chunks = self.fallback.window(&embedded, embedded_ext, body, 1);
                    ChunkOutput { chunks, ..Default::default() }
                }
            };
            // Rebase line numbers into the host file.
            let offset = first_line - 1;
            for c in &mut inner.chunks {
                let rebased = Chunk::new(
                    &file.rel_path,
                    &c.language,
                    c.content.clone(),
                    c.chunk_type,
                    c.name.clone(),
                    c.parent_name.clone(),
                    c.start_line + offset,
                    c.end_line + offset,
                );
                *c = rebased;
            }
            for s in &mut inner.symbols {
                *s = Symbol::new(
                    s.name.clone(),
                    s.kind,
                    &file.rel_path,
                    s.start_line + offset,
                    s.end_line + offset,
                    s.signature.clone(),
                    s.visibility,
                    s.doc_comment.clone(),
                );
            }
            for r in &mut inner.references {
                *r = Reference::new(
                    r.from_symbol.clone(),
                    r.to_symbol.clone(),
                    r.kind,
                    &file.rel_path,
                    r.line + offset,
                );
            }
            output.chunks.extend(inner.chunks);
            output.symbols.extend(inner.symbols);
            output.references.extend(inner.references);
        }

        // Markup outside the embedded regions falls back to line windows.
        let lines: Vec<&str> = file.content.lines().collect();
        let language = language_tag(&file.ext);
        for (gap_start, gap_end) in uncovered_ranges(lines.len(), &covered) {
            let text = slice_lines(&lines, gap_start, gap_end);
            if text.trim().is_empty() {
                continue;
            }
            output.chunks.extend(self.fallback.window(file, &language, &text, gap_start));
        }
        output.chunks.sort_by_key(|c| (c.start_line, c.end_line));

        if output.chunks.is_empty() && !file.content.trim().is_empty() {
            output.chunks = self.fallback.window(file, &language, &file.content, 1);
        }
        Ok(output)
    }
}

fn lang_of(label: &str) -> Language {
    match label {
        "rust" => Language::Rust,
        "typescript" => Language::TypeScript,
        "javascript" => Language::JavaScript,
        "python" => Language::Python,
        "go" => Language::Go,
        "c" => Language::C,
        "cpp" => Language::Cpp,
        "java" => Language::Java,
        "html" => Language::Html,
        "php" => Language::Php,
        "svelte" => Language::Svelte,
        _ => Language::C,
    }
}

impl Chunker for AstChunker {
    fn name(&self) -> &'static str {
        "ast"
    }

    fn chunk(&self, file: &SourceFile) -> Result<ChunkOutput> {
        if file.content.trim().is_empty() {
            return Ok(ChunkOutput::default());
        }

        let lang = Language::from_ext(&file.ext);

        let output = match lang {
            Some(l @ (Language::Html | Language::Php | Language::Svelte)) => {
                Some(self.chunk_template(file, l)?)
            }
            Some(l) => self.chunk_parsed(file, l),
            None => None,
        };

        let output = match output {
            Some(o) if !o.chunks.is_empty() => o,
            _ => {
                if lang.is_some() {
                    debug!(path = %file.rel_path, "AST chunking yielded nothing, using line windows");
                }
                self.fallback.chunk(file)?
            }
        };

        if output.chunks.is_empty() {
            return Err(Error::data(&file.rel_path, "chunker produced no chunks for non-empty file"));
        }
        Ok(output)
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Join `lines[start..=end]` (1-indexed, clamped).
fn slice_lines(lines: &[&str], start: usize, end: usize) -> String {
    if lines.is_empty() || start > lines.len() || end < start {
        return String::new();
    }
    let s = start.saturating_sub(1);
    let e = end.min(lines.len());
    lines[s..e].join("\n")
}

/// Line ranges (1-indexed, inclusive) not covered by any of `covered`.
fn uncovered_ranges(total_lines: usize, covered: &[(usize, usize)]) -> Vec<(usize, usize)> {
    let mut sorted: Vec<(usize, usize)> = covered.to_vec();
    sorted.sort_unstable();
    let mut gaps = Vec::new();
    let mut cursor = 1usize;
    for &(s, e) in &sorted {
        if s > cursor {
            gaps.push((cursor, s - 1));
        }
        cursor = cursor.max(e + 1);
    }
    if cursor <= total_lines {
        gaps.push((cursor, total_lines));
    }
    gaps
}

/// Drop self-edges (a declaration's own name shows up as a type identifier)
/// and duplicate (from, to, kind, line) edges produced by nested walks.
fn dedup_references(refs: &mut Vec<Reference>) {
    let mut seen = std::collections::HashSet::new();
    refs.retain(|r| {
        r.from_symbol != r.to_symbol
            && seen.insert((r.from_symbol.clone(), r.to_symbol.clone(), r.kind, r.line))
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::create_tokenizer;

    fn ast_chunker(max_tokens: usize) -> AstChunker {
        let tok = create_tokenizer("bytes-estimate");
        AstChunker {
            max_tokens,
            tokenizer: tok.clone(),
            extract_symbols: true,
            extract_references: true,
            fallback: LineChunker { max_tokens, tokenizer: tok },
        }
    }

    fn source(path: &str, content: &str) -> SourceFile {
        let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("").to_string();
        SourceFile { rel_path: path.to_string(), ext, content: content.to_string() }
    }

    #[test]
    fn rust_functions_become_chunks_and_symbols() {
        let src = "/// Greets the user.\npub fn greet(name: &str) -> String {\n    format!(\"hi {name}\")\n}\n\nfn helper() {\n    greet(\"x\");\n}\n";
        let out = ast_chunker(512).chunk(&source("src/lib.rs", src)).unwrap();

        let fns: Vec<&Chunk> =
            out.chunks.iter().filter(|c| c.chunk_type == ChunkType::Function).collect();
        assert_eq!(fns.len(), 2, "chunks: {:?}", out.chunks.iter().map(|c| (&c.name, c.chunk_type)).collect::<Vec<_>>());
        assert_eq!(fns[0].name.as_deref(), Some("greet"));
        assert_eq!(fns[0].start_line, 2);

        let greet = out.symbols.iter().find(|s| s.name == "greet").unwrap();
        assert_eq!(greet.kind, SymbolKind::Function);
        assert_eq!(greet.visibility, Visibility::Public);
        assert!(greet.doc_comment.as_deref().unwrap_or("").contains("Greets"));
        assert!(greet.signature.contains("pub fn greet"));
        assert!(!greet.signature.contains('{'));

        let helper = out.symbols.iter().find(|s| s.name == "helper").unwrap();
        assert_eq!(helper.visibility, Visibility::Private);

        let call = out
            .references
            .iter()
            .find(|r| r.kind == RefKind::Call && r.to_symbol == "greet")
            .expect("helper should reference greet");
        assert_eq!(call.from_symbol, "helper");
        assert!(call.is_external);
    }

    #[test]
    fn go_main_and_callers_scenario() {
        let src = "package main\n\nimport \"fmt\"\n\nfunc main() {\n\tgreet()\n}\n\nfunc greet() {\n\tfmt.Println(\"hi\")\n}\n";
        let out = ast_chunker(512).chunk(&source("main.go", src)).unwrap();

        let main_sym = out.symbols.iter().find(|s| s.name == "main").unwrap();
        assert_eq!(main_sym.start_line, 5);
        assert_eq!(main_sym.kind, SymbolKind::Function);

        let call = out
            .references
            .iter()
            .find(|r| r.kind == RefKind::Call && r.to_symbol == "greet")
            .unwrap();
        assert_eq!(call.from_symbol, "main");
        assert_eq!(call.line, 6);

        let import = out
            .references
            .iter()
            .find(|r| r.kind == RefKind::Import)
            .unwrap();
        assert_eq!(import.to_symbol, "fmt");
        assert_eq!(import.from_symbol, "main.go");
    }

    #[test]
    fn python_methods_carry_parent_name() {
        let src = "class Config:\n    \"\"\"Holds settings.\"\"\"\n\n    def load(self):\n        return parse(self.path)\n\n    def _seal(self):\n        pass\n";
        let out = ast_chunker(512).chunk(&source("config.py", src)).unwrap();

        let load = out.chunks.iter().find(|c| c.name.as_deref() == Some("load")).unwrap();
        assert_eq!(load.chunk_type, ChunkType::Method);
        assert_eq!(load.parent_name.as_deref(), Some("Config"));

        let config = out.symbols.iter().find(|s| s.name == "Config").unwrap();
        assert_eq!(config.kind, SymbolKind::Type);
        assert!(config.doc_comment.as_deref().unwrap_or("").contains("Holds settings"));

        let seal = out.symbols.iter().find(|s| s.name == "_seal").unwrap();
        assert_eq!(seal.visibility, Visibility::Private);
        assert_eq!(seal.kind, SymbolKind::Method);
    }

    #[test]
    fn typescript_exports_are_public() {
        let src = "export function formatName(name: string): string {\n  return name.trim();\n}\n\nfunction internal(): void {}\n\nexport interface AppConfig {\n  title: string;\n}\n";
        let out = ast_chunker(512).chunk(&source("app.ts", src)).unwrap();

        let fmt = out.symbols.iter().find(|s| s.name == "formatName").unwrap();
        assert_eq!(fmt.visibility, Visibility::Public);
        let internal = out.symbols.iter().find(|s| s.name == "internal").unwrap();
        assert_eq!(internal.visibility, Visibility::Private);
        let iface = out.symbols.iter().find(|s| s.name == "AppConfig").unwrap();
        assert_eq!(iface.kind, SymbolKind::Interface);
    }

    #[test]
    fn rust_impl_produces_methods_and_implement_edge() {
        let src = "struct Engine;\n\ntrait Runner {\n    fn run(&self);\n}\n\nimpl Runner for Engine {\n    fn run(&self) {\n        start();\n    }\n}\n";
        let out = ast_chunker(512).chunk(&source("engine.rs", src)).unwrap();

        let runs: Vec<_> = out
            .symbols
            .iter()
            .filter(|s| s.name == "run" && s.kind == SymbolKind::Method)
            .collect();
        assert!(!runs.is_empty(), "impl methods should be symbols");
        assert!(
            runs.iter().any(|s| s.start_line >= 8),
            "the impl's run (not just the trait's) must be extracted: {runs:?}"
        );

        let imp = out
            .references
            .iter()
            .find(|r| r.kind == RefKind::Implement)
            .unwrap();
        assert_eq!(imp.to_symbol, "Runner");
        assert_eq!(imp.from_symbol, "Engine");
    }

    #[test]
    fn oversized_function_splits_at_statement_boundaries() {
        let mut body = String::new();
        for i in 0..120 {
            body.push_str(&format!("    let v{i} = compute_something_fairly_long({i});\n"));
        }
        let src = format!("fn big() {{\n{body}}}\n");
        let out = ast_chunker(120).chunk(&source("big.rs", &src)).unwrap();

        let parts: Vec<&Chunk> =
            out.chunks.iter().filter(|c| c.name.as_deref() == Some("big")).collect();
        assert!(parts.len() > 1, "expected subdivision, got {} chunk(s)", parts.len());
        for c in &parts {
            assert!(c.start_line <= c.end_line);
        }
        // Parts must not overlap and must stay in order.
        for pair in parts.windows(2) {
            assert!(pair[0].end_line < pair[1].start_line);
        }
    }

    #[test]
    fn unknown_extension_falls_back_to_line_windows() {
        let src = "some config text\nanother line\n";
        let out = ast_chunker(512).chunk(&source("notes.cfg", src)).unwrap();
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.chunks[0].chunk_type, ChunkType::Block);
        assert_eq!(out.chunks[0].language, "cfg");
        assert!(out.symbols.is_empty());
    }

    #[test]
    fn line_chunker_respects_token_budget() {
        let tok = create_tokenizer("bytes-estimate");
        let chunker = LineChunker { max_tokens: 20, tokenizer: tok };
        let content = (0..30).map(|i| format!("line number {i}")).collect::<Vec<_>>().join("\n");
        let out = chunker.chunk(&source("data.txt", &content)).unwrap();
        assert!(out.chunks.len() > 1);
        // Windows are contiguous and line-aligned.
        let mut expected_start = 1;
        for c in &out.chunks {
            assert_eq!(c.start_line, expected_start);
            expected_start = c.end_line + 1;
        }
    }

    #[test]
    fn empty_file_yields_no_chunks() {
        let out = ast_chunker(512).chunk(&source("empty.rs", "")).unwrap();
        assert!(out.chunks.is_empty());
    }

    #[test]
    fn html_script_regions_are_extracted() {
        let src = "<html>\n<body>\n<script>\nfunction boot() {\n  init();\n}\n</script>\n</body>\n</html>\n";
        let out = ast_chunker(512).chunk(&source("page.html", src)).unwrap();

        let boot = out.symbols.iter().find(|s| s.name == "boot").expect("embedded JS symbol");
        assert_eq!(boot.start_line, 4, "line numbers must be rebased into the host file");
        assert!(out.chunks.iter().any(|c| c.language == "javascript"));
        assert!(out.references.iter().any(|r| r.to_symbol == "init" && r.kind == RefKind::Call));
    }

    #[test]
    fn imports_resolve_from_file_scope() {
        let src = "use std::collections::HashMap;\n\npub fn build() -> HashMap<String, u32> {\n    HashMap::new()\n}\n";
        let out = ast_chunker(512).chunk(&source("maps.rs", src)).unwrap();
        let import = out.references.iter().find(|r| r.kind == RefKind::Import).unwrap();
        assert_eq!(import.from_symbol, "maps.rs");
        assert!(import.to_symbol.contains("HashMap"));
    }
}
