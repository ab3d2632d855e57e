//! Value search: embedding-cosine scoring aggregated from chunks to nodes.
//!
//! Every chunk belongs to exactly one node. A node's score is the sum of
//! its chunk similarities damped by `1/sqrt(N+1)`, which rewards nodes
//! with several matching chunks without letting long sections win on
//! chunk count alone.

use crate::embedding::{EmbeddingClient, cosine_similarity};
use crate::error::Result;
use crate::store::ChunkEmbedding;
use crate::tree::NodeMap;
use std::collections::BTreeMap;

/// A node ranked by value search.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeScore {
    pub node_id: String,
    pub score: f32,
}

/// Aggregate chunk similarities into ranked node scores.
///
/// Ordering is score-descending with ties broken by the node's lower
/// `start_index`; the result is truncated to `top_k`.
pub fn score_nodes(
    query_embedding: &[f32],
    chunks: &[ChunkEmbedding],
    node_map: &NodeMap,
    top_k: usize,
) -> Vec<NodeScore> {
    let mut per_node: BTreeMap<&str, (f32, usize)> = BTreeMap::new();

    for chunk in chunks {
        let similarity = cosine_similarity(query_embedding, &chunk.embedding);
        let entry = per_node.entry(chunk.node_id.as_str()).or_insert((0.0, 0));
        entry.0 += similarity;
        entry.1 += 1;
    }

    let mut scored: Vec<NodeScore> = per_node
        .into_iter()
        .map(|(node_id, (sum, count))| NodeScore {
            node_id: node_id.to_string(),
            score: sum / ((count as f32) + 1.0).sqrt(),
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| start_index_of(node_map, &a.node_id).cmp(&start_index_of(node_map, &b.node_id)))
    });

    scored.truncate(top_k);
    scored
}

fn start_index_of(node_map: &NodeMap, node_id: &str) -> usize {
    node_map
        .get(node_id)
        .map(|n| n.start_index)
        .unwrap_or(usize::MAX)
}

/// Value-search engine for one (sub-question, document) pair.
pub struct ValueSearch {
    embedder: EmbeddingClient,
    top_k: usize,
}

impl ValueSearch {
    /// Create a new value-search engine.
    pub fn new(embedder: EmbeddingClient, top_k: usize) -> Self {
        Self { embedder, top_k }
    }

    /// Embed the sub-question and rank the document's nodes.
    pub async fn search(
        &self,
        query: &str,
        chunks: &[ChunkEmbedding],
        node_map: &NodeMap,
    ) -> Result<Vec<NodeScore>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let query_embedding = self.embedder.embed_one(query).await?;
        Ok(score_nodes(&query_embedding, chunks, node_map, self.top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::FlatNode;

    fn flat(node_id: &str, start: usize) -> FlatNode {
        FlatNode {
            node_id: node_id.to_string(),
            title: format!("section {}", node_id),
            path: format!("section {}", node_id),
            start_index: start,
            end_index: start + 5,
            summary: None,
            text: None,
        }
    }

    fn map_of(entries: &[(&str, usize)]) -> NodeMap {
        entries
            .iter()
            .map(|(id, start)| (id.to_string(), flat(id, *start)))
            .collect()
    }

    fn chunk(node_id: &str, index: usize, embedding: Vec<f32>) -> ChunkEmbedding {
        ChunkEmbedding {
            node_id: node_id.to_string(),
            chunk_index: index,
            embedding,
        }
    }

    #[test]
    fn test_exact_match_ranks_first() {
        let node_map = map_of(&[("0001", 1), ("0002", 10), ("0003", 20)]);
        let query = vec![1.0, 0.0, 0.0];
        let chunks = vec![
            chunk("0001", 0, vec![0.0, 1.0, 0.0]),
            chunk("0002", 0, vec![1.0, 0.0, 0.0]), // identical to query
            chunk("0003", 0, vec![0.5, 0.5, 0.0]),
        ];

        let scored = score_nodes(&query, &chunks, &node_map, 20);
        assert_eq!(scored[0].node_id, "0002");
    }

    #[test]
    fn test_damping_rewards_multiple_matches_moderately() {
        let node_map = map_of(&[("0001", 1), ("0002", 10)]);
        let query = vec![1.0, 0.0];

        // One node with a single perfect chunk, one with three
        let chunks = vec![
            chunk("0001", 0, vec![1.0, 0.0]),
            chunk("0002", 0, vec![1.0, 0.0]),
            chunk("0002", 1, vec![1.0, 0.0]),
            chunk("0002", 2, vec![1.0, 0.0]),
        ];

        let scored = score_nodes(&query, &chunks, &node_map, 20);
        // Three matches beat one...
        assert_eq!(scored[0].node_id, "0002");
        // ...but damping keeps the score sublinear: 3/sqrt(4) = 1.5, not 3.
        assert!((scored[0].score - 1.5).abs() < 1e-5);
        // Single chunk: 1/sqrt(2)
        assert!((scored[1].score - 1.0 / 2.0f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_ties_break_by_lower_start_index() {
        let node_map = map_of(&[("0005", 40), ("0009", 3)]);
        let query = vec![1.0, 0.0];
        let chunks = vec![
            chunk("0005", 0, vec![1.0, 0.0]),
            chunk("0009", 0, vec![1.0, 0.0]),
        ];

        let scored = score_nodes(&query, &chunks, &node_map, 20);
        assert_eq!(scored[0].node_id, "0009"); // starts on page 3
        assert_eq!(scored[1].node_id, "0005");
    }

    #[test]
    fn test_top_k_truncation() {
        let node_map = map_of(&[("0001", 1), ("0002", 10), ("0003", 20)]);
        let query = vec![1.0, 0.0];
        let chunks = vec![
            chunk("0001", 0, vec![1.0, 0.0]),
            chunk("0002", 0, vec![0.9, 0.1]),
            chunk("0003", 0, vec![0.8, 0.2]),
        ];

        let scored = score_nodes(&query, &chunks, &node_map, 2);
        assert_eq!(scored.len(), 2);
    }
}
