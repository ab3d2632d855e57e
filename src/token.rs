//! Byte-pair tokenizer adapter.
//!
//! Wraps the cl100k_base encoding and is the sole ruler for every token
//! budget in the system: node subdivision, chunking, outline prompt
//! windows, and the retrieval context budget.

use crate::error::{IndexError, Result};
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base};

/// Deterministic token counter and segmenter.
#[derive(Clone)]
pub struct Tokenizer {
    bpe: Arc<CoreBPE>,
}

impl Tokenizer {
    /// Load the cl100k_base encoding.
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base()
            .map_err(|e| IndexError::Config(format!("Failed to load tokenizer: {}", e)))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }

    /// Count tokens in a text.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }

    /// Encode text to token ids.
    pub fn encode(&self, text: &str) -> Vec<usize> {
        self.bpe.encode_ordinary(text)
    }

    /// Decode token ids back to text.
    pub fn decode(&self, tokens: &[usize]) -> Result<String> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|e| IndexError::Serialization(format!("Token decode failed: {}", e)))
    }

    /// Group consecutive pages into windows whose total token count stays
    /// within `budget`. Returns inclusive (start, end) indices into `pages`.
    ///
    /// A single page larger than the budget still gets its own window, so
    /// every page lands in exactly one window.
    pub fn page_windows(&self, pages: &[String], budget: usize) -> Vec<(usize, usize)> {
        let mut windows = Vec::new();
        if pages.is_empty() {
            return windows;
        }

        let mut start = 0;
        let mut used = 0;

        for (i, page) in pages.iter().enumerate() {
            let tokens = self.count(page);
            if i > start && used + tokens > budget {
                windows.push((start, i - 1));
                start = i;
                used = 0;
            }
            used += tokens;
        }
        windows.push((start, pages.len() - 1));

        windows
    }
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer").field("encoding", &"cl100k_base").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_and_roundtrip() {
        let tok = Tokenizer::new().unwrap();
        let text = "Revenue increased 12% year over year.";

        let tokens = tok.encode(text);
        assert_eq!(tokens.len(), tok.count(text));
        assert_eq!(tok.decode(&tokens).unwrap(), text);
    }

    #[test]
    fn test_count_is_deterministic() {
        let tok = Tokenizer::new().unwrap();
        let text = "Consolidated statements of operations";
        assert_eq!(tok.count(text), tok.count(text));
    }

    #[test]
    fn test_page_windows_respect_budget() {
        let tok = Tokenizer::new().unwrap();
        let pages: Vec<String> = (0..6)
            .map(|i| format!("page {} {}", i, "filler text ".repeat(20)))
            .collect();
        let per_page = tok.count(&pages[0]);

        // Budget for roughly two pages per window
        let windows = tok.page_windows(&pages, per_page * 2 + 1);

        // Windows cover all pages contiguously, in order
        assert_eq!(windows.first().unwrap().0, 0);
        assert_eq!(windows.last().unwrap().1, pages.len() - 1);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
        // No window (other than a forced single page) exceeds the budget
        for &(start, end) in &windows {
            if end > start {
                let total: usize = pages[start..=end].iter().map(|p| tok.count(p)).sum();
                assert!(total <= per_page * 2 + 1);
            }
        }
    }

    #[test]
    fn test_page_windows_oversized_single_page() {
        let tok = Tokenizer::new().unwrap();
        let pages = vec!["a very long page ".repeat(100), "short".to_string()];

        let windows = tok.page_windows(&pages, 10);

        // The oversized page still occupies its own window
        assert_eq!(windows, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_page_windows_empty() {
        let tok = Tokenizer::new().unwrap();
        assert!(tok.page_windows(&[], 100).is_empty());
    }
}
