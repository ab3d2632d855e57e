//! Node enricher: attaches text and summaries to a built tree.
//!
//! Text attachment follows the prefix rule: a node with children keeps
//! only the pages from its own start up to the first child's start, so
//! no page's text appears twice in the tree. Summaries are generated
//! bottom-up; internal nodes summarize their children's summaries to cap
//! cost.

use crate::document::Document;
use crate::llm::{LlmClient, Prompts};
use crate::tree::{DocumentTree, TreeNode};
use futures::future::BoxFuture;
use tracing::warn;

/// Attempts per node before the summary defaults to the node title.
const SUMMARY_ATTEMPTS: usize = 3;

/// Attaches node text and LLM summaries.
pub struct NodeEnricher {
    client: LlmClient,
}

impl NodeEnricher {
    /// Create a new enricher.
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    /// Attach text and summaries to every node, then a whole-document
    /// description. Summary failures degrade to the node title; the
    /// enrichment itself never fails an ingest.
    pub async fn enrich(&self, tree: &mut DocumentTree, document: &Document) {
        for node in &mut tree.nodes {
            attach_text(node, document);
        }

        for node in &mut tree.nodes {
            self.summarize(node).await;
        }

        let root_summaries = tree
            .nodes
            .iter()
            .filter_map(|n| n.summary.clone())
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = Prompts::document_description().replace("{summaries}", &root_summaries);
        match self.client.complete(None, &prompt).await {
            Ok(description) if is_content_bearing(&description, &tree.name) => {
                tree.description = Some(description.trim().to_string());
            }
            Ok(_) => warn!("document description was empty, skipping"),
            Err(e) => warn!("document description failed, skipping: {}", e),
        }
    }

    /// Post-order summary generation: children first, then the node itself
    /// from either its text (leaves) or its children's summaries.
    fn summarize<'a>(&'a self, node: &'a mut TreeNode) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for child in &mut node.nodes {
                self.summarize(child).await;
            }

            let content = if node.has_children() {
                node.nodes
                    .iter()
                    .filter_map(|c| c.summary.as_deref())
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                node.text.clone().unwrap_or_default()
            };

            if content.trim().is_empty() {
                node.summary = Some(node.title.clone());
                return;
            }

            let prompt = Prompts::node_summary()
                .replace("{title}", &node.title)
                .replace("{content}", &content);

            for attempt in 1..=SUMMARY_ATTEMPTS {
                match self.client.complete(None, &prompt).await {
                    Ok(summary) if is_content_bearing(&summary, &node.title) => {
                        node.summary = Some(summary.trim().to_string());
                        return;
                    }
                    Ok(_) => {
                        warn!(
                            attempt,
                            "summary for '{}' was empty or boilerplate, retrying", node.title
                        );
                    }
                    Err(e) => {
                        warn!(attempt, "summary for '{}' failed: {}", node.title, e);
                    }
                }
            }

            warn!(
                "summary for '{}' defaulted to the node title after {} attempts",
                node.title, SUMMARY_ATTEMPTS
            );
            node.summary = Some(node.title.clone());
        })
    }
}

/// Populate `text` for a subtree. Leaves take their full page range; a
/// parent keeps only the prefix span before its first child.
fn attach_text(node: &mut TreeNode, document: &Document) {
    if let Some(first_child_start) = node.nodes.first().map(|c| c.start_index) {
        if first_child_start > node.start_index {
            node.text = Some(document.raw_range(node.start_index, first_child_start - 1));
        } else {
            node.text = None;
        }
        for child in &mut node.nodes {
            attach_text(child, document);
        }
    } else {
        node.text = Some(document.raw_range(node.start_index, node.end_index));
    }
}

/// A summary must say something: non-empty, not a trivial echo of the
/// title, and long enough to carry content.
fn is_content_bearing(summary: &str, title: &str) -> bool {
    let trimmed = summary.trim();
    if trimmed.len() < 10 {
        return false;
    }
    trimmed.to_lowercase() != title.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::from_page_texts(
            "f",
            (1..=10).map(|i| format!("page {} text", i)).collect(),
        )
    }

    #[test]
    fn test_attach_text_leaf_full_range() {
        let mut node = TreeNode::new("leaf", 3, 5);
        attach_text(&mut node, &doc());

        let text = node.text.unwrap();
        assert!(text.contains("page 3 text"));
        assert!(text.contains("page 5 text"));
        assert!(!text.contains("page 6 text"));
    }

    #[test]
    fn test_attach_text_parent_keeps_prefix_only() {
        let mut parent = TreeNode::new("parent", 1, 10);
        parent.add_child(TreeNode::new("child a", 3, 6));
        parent.add_child(TreeNode::new("child b", 7, 10));

        attach_text(&mut parent, &doc());

        // Parent keeps pages 1-2 only
        let parent_text = parent.text.as_deref().unwrap();
        assert!(parent_text.contains("page 1 text"));
        assert!(parent_text.contains("page 2 text"));
        assert!(!parent_text.contains("page 3 text"));

        // Children own their full ranges
        assert!(parent.nodes[0].text.as_deref().unwrap().contains("page 3 text"));
        assert!(parent.nodes[1].text.as_deref().unwrap().contains("page 10 text"));
    }

    #[test]
    fn test_attach_text_parent_without_prefix() {
        let mut parent = TreeNode::new("parent", 3, 6);
        parent.add_child(TreeNode::new("child", 3, 6));

        attach_text(&mut parent, &doc());

        // First child starts where the parent starts: nothing to keep
        assert!(parent.text.is_none());
        assert!(parent.nodes[0].text.is_some());
    }

    #[test]
    fn test_is_content_bearing() {
        assert!(is_content_bearing(
            "Covers revenue recognition policy and segment results.",
            "Item 8"
        ));
        assert!(!is_content_bearing("", "Item 8"));
        assert!(!is_content_bearing("   ", "Item 8"));
        assert!(!is_content_bearing("ok", "Item 8"));
        assert!(!is_content_bearing("Risk Factors", "Risk Factors"));
        assert!(!is_content_bearing("risk factors", "Risk Factors"));
    }
}
