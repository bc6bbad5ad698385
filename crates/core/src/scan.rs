//! File discovery: walk the project tree under include/exclude globs and
//! ignore-file rules, enforcing size and count limits.
//!
//! Globs match the path relative to the project root with `/` separators on
//! all platforms; `**` crosses segments, `*` stays within one.

use crate::config::Config;
use crate::error::{Error, Result};
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Candidate files
// ---------------------------------------------------------------------------

/// A file that passed every scan filter.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    /// Path relative to the project root, `/`-separated.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub ext: String,
}

/// Result of a scan: candidates in walk order, plus whether the `max_files`
/// cutoff truncated the listing.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub files: Vec<CandidateFile>,
    pub truncated: bool,
}

// ---------------------------------------------------------------------------
// Binary file detection
// ---------------------------------------------------------------------------

/// Check if a file appears to be text by reading the first 8KB and looking for null bytes.
pub fn is_text_file(path: &Path) -> bool {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let mut buf = [0u8; 8192];
    let n = match std::io::Read::read(&mut file, &mut buf) {
        Ok(n) => n,
        Err(_) => return false,
    };
    !buf[..n].contains(&0)
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct Scanner {
    root: PathBuf,
    include: Vec<String>,
    exclude: Vec<String>,
    use_ignore_file: bool,
    max_file_size: u64,
    max_files: usize,
}

impl Scanner {
    pub fn new(project_root: &Path, config: &Config) -> Self {
        Scanner {
            root: project_root.to_path_buf(),
            include: config.index.include.clone(),
            exclude: config.index.exclude.clone(),
            use_ignore_file: config.index.use_ignore_file,
            max_file_size: config.limits.max_file_size,
            max_files: config.limits.max_files,
        }
    }

    /// Walk the project and collect candidates. Unreadable directories are
    /// logged and skipped; only a bad glob set fails the scan.
    pub fn scan(&self) -> Result<ScanOutcome> {
        let mut overrides = OverrideBuilder::new(&self.root);
        for pattern in &self.include {
            overrides
                .add(pattern)
                .map_err(|e| Error::Config(format!("bad include glob '{pattern}': {e}")))?;
        }
        for pattern in &self.exclude {
            // Overrides are a whitelist; a leading '!' turns the glob into an
            // exclusion, which wins over any include match.
            overrides
                .add(&format!("!{pattern}"))
                .map_err(|e| Error::Config(format!("bad exclude glob '{pattern}': {e}")))?;
        }
        let overrides =
            overrides.build().map_err(|e| Error::Config(format!("glob set: {e}")))?;

        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .overrides(overrides)
            .git_ignore(self.use_ignore_file)
            .git_global(false)
            .git_exclude(self.use_ignore_file)
            .ignore(self.use_ignore_file)
            .parents(self.use_ignore_file)
            .require_git(false)
            .max_filesize(Some(self.max_file_size))
            .follow_links(false)
            .build();

        let mut outcome = ScanOutcome::default();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }

            let abs_path = entry.path().to_path_buf();
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            // max_filesize covers the walker, but metadata failures fall back here
            if size > self.max_file_size {
                continue;
            }
            if !is_text_file(&abs_path) {
                continue;
            }

            if outcome.files.len() >= self.max_files {
                outcome.truncated = true;
                break;
            }

            let rel_path = abs_path
                .strip_prefix(&self.root)
                .unwrap_or(&abs_path)
                .to_string_lossy()
                .replace('\\', "/");
            let ext =
                abs_path.extension().and_then(|e| e.to_str()).unwrap_or("").to_string();

            outcome.files.push(CandidateFile { rel_path, abs_path, size, ext });
        }

        debug!(files = outcome.files.len(), truncated = outcome.truncated, "scan complete");
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn include_and_exclude_globs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.rs", "fn main() {}");
        write(dir.path(), "src/util.py", "x = 1");
        write(dir.path(), "target/out.rs", "fn gen() {}");

        let mut config = Config::default();
        config.index.include = vec!["**/*.rs".into()];
        config.index.use_ignore_file = false;

        let outcome = Scanner::new(dir.path(), &config).scan().unwrap();
        let paths: Vec<&str> = outcome.files.iter().map(|f| f.rel_path.as_str()).collect();
        assert!(paths.contains(&"src/main.rs"));
        assert!(!paths.contains(&"src/util.py"), "include glob must filter: {paths:?}");
        assert!(!paths.contains(&"target/out.rs"), "exclude glob must win: {paths:?}");
    }

    #[test]
    fn max_files_truncates() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write(dir.path(), &format!("f{i}.rs"), "fn x() {}");
        }
        let mut config = Config::default();
        config.limits.max_files = 3;
        config.index.use_ignore_file = false;

        let outcome = Scanner::new(dir.path(), &config).scan().unwrap();
        assert_eq!(outcome.files.len(), 3);
        assert!(outcome.truncated);
    }

    #[test]
    fn oversized_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.rs", &"x".repeat(4096));
        write(dir.path(), "small.rs", "fn x() {}");

        let mut config = Config::default();
        config.limits.max_file_size = 1024;
        config.index.use_ignore_file = false;

        let outcome = Scanner::new(dir.path(), &config).scan().unwrap();
        let paths: Vec<&str> = outcome.files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["small.rs"]);
    }

    #[test]
    fn binary_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "code.rs", "fn x() {}");
        fs::write(dir.path().join("blob.rs"), [0u8, 159, 146, 150]).unwrap();

        let mut config = Config::default();
        config.index.use_ignore_file = false;
        let outcome = Scanner::new(dir.path(), &config).scan().unwrap();
        let paths: Vec<&str> = outcome.files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["code.rs"]);
    }

    #[test]
    fn gitignore_rules_respected_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".gitignore", "generated.rs\n!kept.rs\n");
        write(dir.path(), "generated.rs", "fn g() {}");
        write(dir.path(), "kept.rs", "fn k() {}");
        write(dir.path(), "normal.rs", "fn n() {}");

        let config = Config::default();
        let outcome = Scanner::new(dir.path(), &config).scan().unwrap();
        let paths: Vec<&str> = outcome.files.iter().map(|f| f.rel_path.as_str()).collect();
        assert!(!paths.contains(&"generated.rs"));
        assert!(paths.contains(&"kept.rs"), "negation must re-include: {paths:?}");
        assert!(paths.contains(&"normal.rs"));
    }
}
