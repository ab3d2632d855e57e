//! LLM tree search: reasoning over the text-stripped tree.
//!
//! The model sees node ids, titles, and summaries only, and names the
//! nodes likely to contain the answer. Its output is untrusted: unknown
//! ids are dropped with a warning, duplicates collapse preserving order,
//! and a persistent parse failure degrades to an empty list so value
//! search still carries the query.

use crate::error::{IndexError, Result};
use crate::llm::{LlmClient, Prompts};
use crate::tree::{NoTextTree, NodeMap};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct TreeSearchResponse {
    #[serde(default)]
    #[allow(dead_code)]
    thinking: Option<String>,
    node_list: Vec<String>,
}

/// LLM-search engine for one (sub-question, document) pair.
pub struct LlmTreeSearch {
    client: LlmClient,
}

impl LlmTreeSearch {
    /// Create a new tree searcher.
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    /// Return node ids the LLM considers relevant, most relevant first.
    /// Degrades to an empty list when the response never parses.
    pub async fn search(
        &self,
        query: &str,
        tree_no_text: &NoTextTree,
        node_map: &NodeMap,
    ) -> Vec<String> {
        match self.search_inner(query, tree_no_text).await {
            Ok(ids) => sanitize_node_list(ids, node_map),
            Err(e) => {
                warn!("LLM tree search degraded to empty result: {}", e);
                Vec::new()
            }
        }
    }

    async fn search_inner(&self, query: &str, tree_no_text: &NoTextTree) -> Result<Vec<String>> {
        let tree_json = serde_json::to_string(tree_no_text)
            .map_err(|e| IndexError::Serialization(e.to_string()))?;

        let prompt = Prompts::tree_search()
            .replace("{tree}", &tree_json)
            .replace("{query}", query);

        let response: TreeSearchResponse = self
            .client
            .complete_json(Some(Prompts::system_document_analyzer()), &prompt)
            .await?;

        Ok(response.node_list)
    }
}

/// Drop ids the document does not have and collapse duplicates,
/// preserving the model's ordering.
pub fn sanitize_node_list(ids: Vec<String>, node_map: &NodeMap) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();

    for id in ids {
        if !node_map.contains_key(&id) {
            warn!("LLM tree search returned unknown node id '{}', dropping", id);
            continue;
        }
        if seen.insert(id.clone()) {
            out.push(id);
        }
    }

    out
}
