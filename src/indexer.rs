//! Tree builder: turns per-page text into a validated section tree.
//!
//! The pipeline runs in phases:
//! 1. Scan the leading pages for a table of contents
//! 2. Verify ToC entries against the document text, fall back when
//!    too few survive
//! 3. Without a usable ToC, outline the document in token-bounded
//!    sliding windows
//! 4. Lift the flat outline into a hierarchy via LLM-assigned levels
//! 5. Recursively subdivide oversized leaves, guarding each split with
//!    an accuracy check
//! 6. Assign depth-first pre-order node ids
//!
//! Shape failures on subdivision degrade to "keep as leaf" with a
//! warning; shape failures on the initial outline fail the document.

use crate::config::IndexingConfig;
use crate::document::Document;
use crate::error::{IndexError, Result};
use crate::llm::{LlmClient, Prompts};
use crate::token::Tokenizer;
use crate::tree::{DocumentTree, OutlineEntry, TreeNode, build_tree_from_outline, normalize_children};
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{info, warn};

/// ToC detection response.
#[derive(Debug, Deserialize)]
struct TocDetection {
    has_toc: bool,
    #[serde(default)]
    entries: Vec<TocEntry>,
}

#[derive(Debug, Deserialize)]
struct TocEntry {
    title: String,
    page: Option<serde_json::Value>,
}

impl TocEntry {
    fn page_number(&self) -> Option<usize> {
        parse_page_value(self.page.as_ref())
    }
}

/// Raw outline item from an outlining or subdivision response.
#[derive(Debug, Clone, Deserialize)]
struct RawOutlineItem {
    title: String,
    #[serde(alias = "page")]
    physical_index: Option<serde_json::Value>,
}

impl RawOutlineItem {
    fn page_number(&self) -> Option<usize> {
        parse_page_value(self.physical_index.as_ref())
    }
}

/// Parse a page number that may arrive as an integer, a numeric string,
/// or the "<physical_index_X>" tag format.
fn parse_page_value(value: Option<&serde_json::Value>) -> Option<usize> {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().map(|n| n as usize),
        Some(serde_json::Value::String(s)) => {
            if s.starts_with("<physical_index_") {
                s.trim_start_matches("<physical_index_")
                    .trim_end_matches('>')
                    .parse()
                    .ok()
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct LevelAssignment {
    levels: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct AccuracyScore {
    score: f64,
}

/// Tree builder driving the LLM through the phases above.
pub struct TreeBuilder {
    client: LlmClient,
    tokenizer: Tokenizer,
    config: IndexingConfig,
}

impl TreeBuilder {
    /// Create a new tree builder.
    pub fn new(client: LlmClient, tokenizer: Tokenizer, config: IndexingConfig) -> Self {
        Self {
            client,
            tokenizer,
            config,
        }
    }

    /// Build a validated tree for a document.
    pub async fn build(&self, document: &Document) -> Result<DocumentTree> {
        let total_pages = document.page_count();

        let flat = match self.toc_outline(document).await {
            Some(entries) => entries,
            None => self.windowed_outline(document).await?,
        };

        let flat = de_overlap(flat);
        if flat.is_empty() {
            return Err(IndexError::TreeInvariant(
                "outline produced no sections".to_string(),
            ));
        }

        let entries = self.assign_levels(&flat).await;
        let mut roots = build_tree_from_outline(&entries, total_pages);

        for root in &mut roots {
            self.subdivide(root, document).await;
        }

        let mut tree = DocumentTree::new(&document.name, roots, total_pages);
        tree.assign_node_ids();
        tree.validate()?;

        info!(
            sections = tree.node_count(),
            depth = tree.max_depth(),
            "tree built for '{}'",
            document.name
        );
        Ok(tree)
    }

    /// Phases 1-2: detect a ToC in the leading pages and verify its entries.
    /// Returns `None` when there is no ToC reliable enough to use.
    async fn toc_outline(&self, document: &Document) -> Option<Vec<(String, usize)>> {
        let scan_end = self.config.toc_check_pages.min(document.page_count());
        let content = document.tagged_range(1, scan_end);

        let prompt = Prompts::toc_detector().replace("{content}", &content);
        let detection: TocDetection = match self
            .client
            .complete_json(Some(Prompts::system_document_analyzer()), &prompt)
            .await
        {
            Ok(d) => d,
            Err(e) => {
                warn!("ToC detection failed, falling back to windowed outline: {}", e);
                return None;
            }
        };

        if !detection.has_toc {
            return None;
        }

        let declared: Vec<(String, usize)> = detection
            .entries
            .iter()
            .filter_map(|e| e.page_number().map(|p| (e.title.clone(), p)))
            .filter(|(_, p)| *p >= 1 && *p <= document.page_count())
            .collect();

        if declared.is_empty() {
            return None;
        }

        let verified = self.verify_toc_entries(document, &declared);
        if verified.len() * 2 < declared.len() {
            warn!(
                declared = declared.len(),
                verified = verified.len(),
                "too few ToC entries verified, falling back to windowed outline"
            );
            return None;
        }

        info!(
            entries = verified.len(),
            "using verified table of contents"
        );
        Some(verified)
    }

    /// Cross-check each ToC entry's declared page against the document text
    /// within ±`toc_verify_window` pages. Entries that fail are discarded.
    fn verify_toc_entries(
        &self,
        document: &Document,
        entries: &[(String, usize)],
    ) -> Vec<(String, usize)> {
        entries
            .iter()
            .filter(|(title, page)| {
                let found = self.title_near_page(document, title, *page);
                if !found {
                    warn!("ToC entry '{}' not found near page {}", title, page);
                }
                found
            })
            .cloned()
            .collect()
    }

    /// Case- and whitespace-insensitive title containment near a page.
    fn title_near_page(&self, document: &Document, title: &str, page: usize) -> bool {
        let needle = normalize_for_match(title);
        if needle.is_empty() {
            return false;
        }

        let window = self.config.toc_verify_window;
        let start = page.saturating_sub(window).max(1);
        let end = (page + window).min(document.page_count());

        (start..=end).any(|p| {
            document
                .get_page(p)
                .map(|pg| normalize_for_match(&pg.content).contains(&needle))
                .unwrap_or(false)
        })
    }

    /// Phase 3: outline the document in token-bounded page windows. Shape
    /// failures here are critical and fail the document.
    async fn windowed_outline(&self, document: &Document) -> Result<Vec<(String, usize)>> {
        let pages = document.tagged_pages(1, document.page_count());
        let windows = self
            .tokenizer
            .page_windows(&pages, self.config.max_tokens_per_node);

        let mut items = Vec::new();
        for (start, end) in windows {
            let content: String = pages[start..=end].concat();
            let prompt = format!("{}\nGiven text\n:{}", Prompts::outline_window(), content);

            let raw: Vec<RawOutlineItem> = self
                .client
                .complete_json(Some(Prompts::system_document_analyzer()), &prompt)
                .await?;

            items.extend(
                raw.into_iter()
                    .filter_map(|item| item.page_number().map(|p| (item.title, p)))
                    .filter(|(_, p)| *p >= 1 && *p <= document.page_count()),
            );
        }

        Ok(items)
    }

    /// Phase 4: LLM-assigned hierarchy levels for the flat outline.
    /// Degrades to a flat level-1 outline on a shape failure.
    async fn assign_levels(&self, flat: &[(String, usize)]) -> Vec<OutlineEntry> {
        let listing = flat
            .iter()
            .enumerate()
            .map(|(i, (title, page))| format!("{}. {} (starts page {})", i + 1, title, page))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = Prompts::assign_levels().replace("{outline}", &listing);
        let levels = match self
            .client
            .complete_json::<LevelAssignment>(Some(Prompts::system_document_analyzer()), &prompt)
            .await
        {
            Ok(assignment) if assignment.levels.len() == flat.len() => assignment.levels,
            Ok(assignment) => {
                warn!(
                    expected = flat.len(),
                    got = assignment.levels.len(),
                    "level assignment count mismatch, keeping outline flat"
                );
                vec![1; flat.len()]
            }
            Err(e) => {
                warn!("level assignment failed, keeping outline flat: {}", e);
                vec![1; flat.len()]
            }
        };

        flat.iter()
            .zip(levels)
            .map(|((title, page), level)| OutlineEntry {
                title: title.clone(),
                start_page: *page,
                level,
            })
            .collect()
    }

    /// Phase 5: recursively subdivide oversized leaves. Every failure mode
    /// in here degrades to "keep as leaf"; the ingest never fails because a
    /// section would not split.
    fn subdivide<'a>(&'a self, node: &'a mut TreeNode, document: &'a Document) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if node.has_children() {
                for child in &mut node.nodes {
                    self.subdivide(child, document).await;
                }
                return;
            }

            if !self.is_oversized(node, document) {
                return;
            }

            let children = match self.propose_children(node, document).await {
                Ok(children) => children,
                Err(e) => {
                    warn!(
                        "subdivision of '{}' failed, keeping as leaf: {}",
                        node.title, e
                    );
                    return;
                }
            };

            if children.len() < 2 {
                return;
            }

            match self.check_accuracy(node, &children, document).await {
                Ok(score) if score >= self.config.accuracy_threshold => {
                    info!(
                        score,
                        children = children.len(),
                        "accepted subdivision of '{}'",
                        node.title
                    );
                    node.nodes = children;
                    for child in &mut node.nodes {
                        self.subdivide(child, document).await;
                    }
                }
                Ok(score) => {
                    warn!(
                        score,
                        threshold = self.config.accuracy_threshold,
                        "rejected subdivision of '{}', keeping as leaf",
                        node.title
                    );
                }
                Err(e) => {
                    warn!(
                        "accuracy check for '{}' failed, keeping as leaf: {}",
                        node.title, e
                    );
                }
            }
        })
    }

    /// A leaf is oversized when its page span or token count exceeds the
    /// configured budgets.
    fn is_oversized(&self, node: &TreeNode, document: &Document) -> bool {
        if node.page_span() > self.config.max_pages_per_node {
            return true;
        }
        let text = document.raw_range(node.start_index, node.end_index);
        self.tokenizer.count(&text) > self.config.max_tokens_per_node
    }

    /// Ask the LLM for child sections of an oversized node.
    async fn propose_children(
        &self,
        node: &TreeNode,
        document: &Document,
    ) -> Result<Vec<TreeNode>> {
        let content = document.tagged_range(node.start_index, node.end_index);
        let prompt = format!(
            "{}\nGiven text\n:{}",
            Prompts::subdivide_node().replace("{title}", &node.title),
            content
        );

        let raw: Vec<RawOutlineItem> = self
            .client
            .complete_json(Some(Prompts::system_document_analyzer()), &prompt)
            .await?;

        let proposals: Vec<(String, usize)> = raw
            .into_iter()
            .filter_map(|item| item.page_number().map(|p| (item.title, p)))
            .collect();

        Ok(normalize_children(
            &proposals,
            node.start_index,
            node.end_index,
        ))
    }

    /// Score whether proposed children faithfully cover the parent.
    async fn check_accuracy(
        &self,
        node: &TreeNode,
        children: &[TreeNode],
        document: &Document,
    ) -> Result<f64> {
        let listing = children
            .iter()
            .map(|c| format!("- \"{}\" (pages {}-{})", c.title, c.start_index, c.end_index))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = Prompts::subdivision_accuracy()
            .replace("{title}", &node.title)
            .replace("{start}", &node.start_index.to_string())
            .replace("{end}", &node.end_index.to_string())
            .replace("{children}", &listing)
            .replace(
                "{content}",
                &document.tagged_range(node.start_index, node.end_index),
            );

        let parsed: AccuracyScore = self
            .client
            .complete_json(Some(Prompts::system_document_analyzer()), &prompt)
            .await?;

        Ok(parsed.score.clamp(0.0, 1.0))
    }
}

/// Concatenated window results can jump backwards when a window re-reports
/// a section. Prefer earlier-declared starts: drop any entry whose page
/// precedes the last kept one, and collapse exact repeats.
fn de_overlap(items: Vec<(String, usize)>) -> Vec<(String, usize)> {
    let mut out: Vec<(String, usize)> = Vec::new();
    for (title, page) in items {
        match out.last() {
            Some((last_title, last_page)) if *last_title == title && *last_page == page => {}
            Some((_, last_page)) if page < *last_page => {}
            _ => out.push((title, page)),
        }
    }
    out
}

/// Lowercase with all whitespace removed, for fuzzy title matching.
fn normalize_for_match(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;

    fn builder() -> TreeBuilder {
        TreeBuilder::new(
            LlmClient::new(LlmConfig::default()),
            Tokenizer::new().unwrap(),
            IndexingConfig::default(),
        )
    }

    #[test]
    fn test_parse_page_value_formats() {
        let n = serde_json::Value::Number(5.into());
        assert_eq!(parse_page_value(Some(&n)), Some(5));

        let tagged = serde_json::Value::String("<physical_index_10>".to_string());
        assert_eq!(parse_page_value(Some(&tagged)), Some(10));

        let plain = serde_json::Value::String("7".to_string());
        assert_eq!(parse_page_value(Some(&plain)), Some(7));

        assert_eq!(parse_page_value(None), None);
        let junk = serde_json::Value::String("page ten".to_string());
        assert_eq!(parse_page_value(Some(&junk)), None);
    }

    #[test]
    fn test_de_overlap_prefers_earlier_starts() {
        let items = vec![
            ("A".to_string(), 1),
            ("B".to_string(), 8),
            ("stale".to_string(), 5), // backward jump, dropped
            ("C".to_string(), 12),
        ];
        let out = de_overlap(items);
        assert_eq!(
            out,
            vec![
                ("A".to_string(), 1),
                ("B".to_string(), 8),
                ("C".to_string(), 12)
            ]
        );
    }

    #[test]
    fn test_de_overlap_collapses_repeats() {
        let items = vec![
            ("A".to_string(), 1),
            ("A".to_string(), 1),
            ("B".to_string(), 4),
        ];
        assert_eq!(de_overlap(items).len(), 2);
    }

    #[test]
    fn test_normalize_for_match() {
        assert_eq!(
            normalize_for_match("Item 1.  Business\n"),
            "item1.business"
        );
    }

    #[test]
    fn test_title_near_page_tolerates_whitespace_and_case() {
        let b = builder();
        let doc = Document::from_page_texts(
            "f",
            vec![
                "cover page".to_string(),
                "ITEM 1.   BUSINESS\nsome text".to_string(),
                "other".to_string(),
            ],
        );

        // Declared page 2, exact
        assert!(b.title_near_page(&doc, "Item 1. Business", 2));
        // Declared page 3, found within ±1
        assert!(b.title_near_page(&doc, "Item 1. Business", 3));
        // Not present at all
        assert!(!b.title_near_page(&doc, "Item 99. Mines", 2));
    }

    #[test]
    fn test_verify_toc_entries_discards_failures() {
        let b = builder();
        let doc = Document::from_page_texts(
            "f",
            vec![
                "Table of Contents".to_string(),
                "Item 1. Business".to_string(),
                "Item 2. Risk Factors".to_string(),
            ],
        );

        let entries = vec![
            ("Item 1. Business".to_string(), 2),
            ("Item 2. Risk Factors".to_string(), 3),
            ("Item 3. Ghost Section".to_string(), 3),
        ];

        let verified = b.verify_toc_entries(&doc, &entries);
        assert_eq!(verified.len(), 2);
        assert!(verified.iter().all(|(t, _)| !t.contains("Ghost")));
    }

    #[test]
    fn test_is_oversized_by_pages() {
        let b = builder();
        let doc = Document::from_page_texts("f", vec!["x".to_string(); 40]);

        let small = TreeNode::new("small", 1, 10);
        let big = TreeNode::new("big", 1, 11);

        assert!(!b.is_oversized(&small, &doc));
        assert!(b.is_oversized(&big, &doc));
    }
}
