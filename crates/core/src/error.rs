//! Error taxonomy for the indexing and search engine.
//!
//! Fatal kinds (`Config`, `Schema`, `Embedding` after its retry budget) abort a
//! run; `Data` errors are collected as per-file warnings and never fail a run.
//! `Canceled` is the non-error outcome of an interrupted run.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("embedding endpoint error: {0}")]
    Embedding(String),

    #[error("embedding dimension mismatch: index has {expected}-dim vectors, provider returned {actual}. Run 'codequarry index --force' to rebuild.")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index schema mismatch: store is v{found}, this build expects v{expected}. Run 'codequarry index --force' to rebuild.")]
    SchemaMismatch { found: i32, expected: i32 },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("store pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("{path}: {reason}")]
    Data { path: String, reason: String },

    #[error("interrupted — rerun to resume")]
    Canceled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    /// Fatal errors abort an indexing run; everything else is a per-file warning.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Data { .. })
    }

    pub(crate) fn data(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Data { path: path.into(), reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_errors_are_not_fatal() {
        assert!(!Error::data("src/a.rs", "unreadable").is_fatal());
        assert!(Error::Config("bad weights".into()).is_fatal());
        assert!(Error::DimensionMismatch { expected: 384, actual: 768 }.is_fatal());
        assert!(Error::Canceled.is_fatal());
    }

    #[test]
    fn messages_name_the_recovery_path() {
        let e = Error::SchemaMismatch { found: 2, expected: 1 };
        assert!(e.to_string().contains("--force"));
        let e = Error::DimensionMismatch { expected: 384, actual: 768 };
        assert!(e.to_string().contains("dimension mismatch"));
    }

    #[test]
    fn io_and_yaml_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(Error::from(io), Error::Io(_)));
        let yaml = serde_yaml::from_str::<usize>("not a number").unwrap_err();
        assert!(matches!(Error::from(yaml), Error::Config(_)));
    }
}
