//! Token-bounded overlapping chunker.
//!
//! Splits each node's own text into embedding-ready fragments. Chunk
//! boundaries are measured in byte-pair tokens, never characters, so the
//! same text with the same parameters always yields the same chunks.

use crate::config::ChunkingConfig;
use crate::error::Result;
use crate::token::Tokenizer;
use crate::tree::NodeMap;
use serde::{Deserialize, Serialize};

/// An embedding-ready text fragment of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Owning node.
    pub node_id: String,
    /// 0-based index within the node.
    pub chunk_index: usize,
    /// Chunk text.
    pub content: String,
    /// Token count of `content`.
    pub token_count: usize,
    /// First page of the owning node (best effort; chunks inherit the
    /// node's page range rather than tracking exact per-chunk pages).
    pub start_page: usize,
    /// Last page of the owning node.
    pub end_page: usize,
}

/// Splits node text into overlapping token windows.
#[derive(Clone)]
pub struct Chunker {
    tokenizer: Tokenizer,
    config: ChunkingConfig,
}

impl Chunker {
    /// Create a new chunker.
    pub fn new(tokenizer: Tokenizer, config: ChunkingConfig) -> Self {
        Self { tokenizer, config }
    }

    /// Chunk a single node's text.
    pub fn chunk_text(
        &self,
        node_id: &str,
        text: &str,
        start_page: usize,
        end_page: usize,
    ) -> Result<Vec<Chunk>> {
        let tokens = self.tokenizer.encode(text);
        if tokens.len() < self.config.min_tokens {
            return Ok(Vec::new());
        }

        let step = self
            .config
            .max_tokens
            .saturating_sub(self.config.overlap_tokens)
            .max(1);
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut chunk_index = 0;

        while start < tokens.len() {
            let end = (start + self.config.max_tokens).min(tokens.len());
            let window = &tokens[start..end];

            if window.len() >= self.config.min_tokens {
                let content = self.tokenizer.decode(window)?;
                chunks.push(Chunk {
                    node_id: node_id.to_string(),
                    chunk_index,
                    content,
                    token_count: window.len(),
                    start_page,
                    end_page,
                });
                chunk_index += 1;
            }

            if end == tokens.len() {
                break;
            }
            start += step;
        }

        Ok(chunks)
    }

    /// Chunk every node in a document's node map, in node-id order.
    pub fn chunk_node_map(&self, node_map: &NodeMap) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        for (node_id, node) in node_map {
            if let Some(text) = &node.text {
                chunks.extend(self.chunk_text(
                    node_id,
                    text,
                    node.start_index,
                    node.end_index,
                )?);
            }
        }
        Ok(chunks)
    }
}
