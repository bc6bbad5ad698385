//! Token counting for chunk-size budgeting.
//!
//! Chunk boundaries only need a consistent estimate, not an exact BPE count,
//! so the default is a fast bytes/3 heuristic.

use std::sync::Arc;

pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
    fn name(&self) -> &str;
}

/// Default: bytes/3 estimation (fast, no dependencies)
pub struct BytesEstimateTokenizer;

impl Tokenizer for BytesEstimateTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.len().div_ceil(3)
    }
    fn name(&self) -> &str {
        "bytes-estimate"
    }
}

/// Create a tokenizer by name. Falls back to bytes-estimate for unknown names.
pub fn create_tokenizer(_name: &str) -> Arc<dyn Tokenizer> {
    Arc::new(BytesEstimateTokenizer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_estimate_rounds_up() {
        let tok = BytesEstimateTokenizer;
        assert_eq!(tok.count_tokens(""), 0);
        assert_eq!(tok.count_tokens("ab"), 1);
        assert_eq!(tok.count_tokens("abcd"), 2);
    }
}
