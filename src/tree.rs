//! Hierarchical tree structure for filing sections.
//!
//! Each node owns a contiguous page range of the source document. The
//! tree is strictly hierarchical with no back-references; parent links
//! are derived during traversal, never stored.

use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A node in the document tree structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    /// Depth-first pre-order identifier (e.g., "0000"), assigned once the
    /// topology is final.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// Section title, verbatim from the document.
    pub title: String,

    /// Starting page index (1-indexed, inclusive).
    pub start_index: usize,

    /// Ending page index (1-indexed, inclusive).
    pub end_index: usize,

    /// LLM-generated summary of the section.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Text of the node's own pages. For a node with children this is the
    /// prefix span only (parent start up to the first child's start), so
    /// child pages are never duplicated in the parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Child nodes (subsections).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<TreeNode>,
}

impl TreeNode {
    /// Create a new tree node.
    pub fn new(title: impl Into<String>, start_index: usize, end_index: usize) -> Self {
        Self {
            node_id: None,
            title: title.into(),
            start_index,
            end_index,
            summary: None,
            text: None,
            nodes: Vec::new(),
        }
    }

    /// Add a child node.
    pub fn add_child(&mut self, child: TreeNode) {
        self.nodes.push(child);
    }

    /// Check if this node has children.
    pub fn has_children(&self) -> bool {
        !self.nodes.is_empty()
    }

    /// Get the page span (number of pages covered).
    pub fn page_span(&self) -> usize {
        if self.end_index >= self.start_index {
            self.end_index - self.start_index + 1
        } else {
            0
        }
    }

    /// Recursively count all nodes in this subtree (including self).
    pub fn node_count(&self) -> usize {
        1 + self.nodes.iter().map(|n| n.node_count()).sum::<usize>()
    }

    /// Format the subtree as an indented string for display.
    pub fn format_tree(&self, indent: usize) -> String {
        let prefix = "  ".repeat(indent);
        let id = self
            .node_id
            .as_ref()
            .map(|s| format!("[{}] ", s))
            .unwrap_or_default();

        let mut result = format!(
            "{}{}{} [pages {}-{}]\n",
            prefix, id, self.title, self.start_index, self.end_index
        );

        for child in &self.nodes {
            result.push_str(&child.format_tree(indent + 1));
        }

        result
    }
}

/// A complete document tree (wrapper around root nodes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentTree {
    /// Document name.
    pub name: String,

    /// Root-level nodes.
    pub nodes: Vec<TreeNode>,

    /// Total page count.
    pub total_pages: usize,

    /// Optional whole-document description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A node with `text` and page indices stripped, used to fit LLM prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoTextNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NoTextNode>,
}

/// Text-stripped tree with identical topology to the full tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoTextTree {
    pub name: String,
    pub nodes: Vec<NoTextNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A single node flattened out of the tree for O(1) lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatNode {
    pub node_id: String,
    pub title: String,
    /// Titles from root to this node, joined with " > ".
    pub path: String,
    pub start_index: usize,
    pub end_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Mapping from node_id to flattened node.
pub type NodeMap = BTreeMap<String, FlatNode>;

impl DocumentTree {
    /// Create a new document tree.
    pub fn new(name: impl Into<String>, nodes: Vec<TreeNode>, total_pages: usize) -> Self {
        Self {
            name: name.into(),
            nodes,
            total_pages,
            description: None,
        }
    }

    /// Get total node count.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().map(|n| n.node_count()).sum()
    }

    /// Get maximum depth of the tree.
    pub fn max_depth(&self) -> usize {
        fn depth(node: &TreeNode) -> usize {
            if node.nodes.is_empty() {
                1
            } else {
                1 + node.nodes.iter().map(depth).max().unwrap_or(0)
            }
        }

        self.nodes.iter().map(depth).max().unwrap_or(0)
    }

    /// Assign depth-first pre-order node ids, zero-padded to a width that
    /// fits the total node count (at least four digits).
    pub fn assign_node_ids(&mut self) {
        let total = self.node_count();
        let width = total.to_string().len().max(4);

        fn visit(node: &mut TreeNode, counter: &mut usize, width: usize) {
            node.node_id = Some(format!("{:0width$}", *counter, width = width));
            *counter += 1;
            for child in &mut node.nodes {
                visit(child, counter, width);
            }
        }

        let mut counter = 0;
        for node in &mut self.nodes {
            visit(node, &mut counter, width);
        }
    }

    /// Validate the structural invariants of the tree.
    ///
    /// Root nodes must cover the document contiguously in order (preface
    /// pages before the first node are allowed); children must partition
    /// their parent's range contiguously; node ids, when assigned, must be
    /// unique and in pre-order.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(IndexError::TreeInvariant("tree has no nodes".to_string()));
        }

        fn check_node(node: &TreeNode) -> Result<()> {
            if node.start_index == 0 || node.start_index > node.end_index {
                return Err(IndexError::TreeInvariant(format!(
                    "node '{}' has invalid page range {}-{}",
                    node.title, node.start_index, node.end_index
                )));
            }

            if let Some(first) = node.nodes.first() {
                if first.start_index < node.start_index {
                    return Err(IndexError::TreeInvariant(format!(
                        "child '{}' starts before parent '{}'",
                        first.title, node.title
                    )));
                }
                let last = node.nodes.last().unwrap_or(first);
                if last.end_index != node.end_index {
                    return Err(IndexError::TreeInvariant(format!(
                        "children of '{}' end at {} but parent ends at {}",
                        node.title, last.end_index, node.end_index
                    )));
                }
                for pair in node.nodes.windows(2) {
                    if pair[1].start_index != pair[0].end_index + 1 {
                        return Err(IndexError::TreeInvariant(format!(
                            "children '{}' and '{}' are not contiguous ({} then {})",
                            pair[0].title,
                            pair[1].title,
                            pair[0].end_index,
                            pair[1].start_index
                        )));
                    }
                }
            }

            for child in &node.nodes {
                check_node(child)?;
            }
            Ok(())
        }

        for node in &self.nodes {
            check_node(node)?;
        }

        // Root cover: contiguous, ending at the last page.
        for pair in self.nodes.windows(2) {
            if pair[1].start_index != pair[0].end_index + 1 {
                return Err(IndexError::TreeInvariant(format!(
                    "root sections '{}' and '{}' are not contiguous",
                    pair[0].title, pair[1].title
                )));
            }
        }
        if let Some(last) = self.nodes.last() {
            if last.end_index != self.total_pages {
                return Err(IndexError::TreeInvariant(format!(
                    "root cover ends at page {} but document has {} pages",
                    last.end_index, self.total_pages
                )));
            }
        }

        // Node ids, when present, must be unique and pre-order sorted.
        let ids = self.collect_node_ids();
        if !ids.is_empty() {
            if ids.len() != self.node_count() {
                return Err(IndexError::TreeInvariant(
                    "some nodes are missing node ids".to_string(),
                ));
            }
            let mut sorted = ids.clone();
            sorted.sort();
            sorted.dedup();
            if sorted.len() != ids.len() {
                return Err(IndexError::TreeInvariant(
                    "duplicate node ids".to_string(),
                ));
            }
            if sorted != ids {
                return Err(IndexError::TreeInvariant(
                    "node ids are not in depth-first pre-order".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Node ids in depth-first pre-order (skips unassigned nodes).
    pub fn collect_node_ids(&self) -> Vec<String> {
        fn visit(node: &TreeNode, out: &mut Vec<String>) {
            if let Some(id) = &node.node_id {
                out.push(id.clone());
            }
            for child in &node.nodes {
                visit(child, out);
            }
        }

        let mut out = Vec::new();
        for node in &self.nodes {
            visit(node, &mut out);
        }
        out
    }

    /// Deep copy with `text` and page indices stripped.
    pub fn to_no_text(&self) -> NoTextTree {
        fn strip(node: &TreeNode) -> NoTextNode {
            NoTextNode {
                node_id: node.node_id.clone(),
                title: node.title.clone(),
                summary: node.summary.clone(),
                nodes: node.nodes.iter().map(strip).collect(),
            }
        }

        NoTextTree {
            name: self.name.clone(),
            nodes: self.nodes.iter().map(strip).collect(),
            description: self.description.clone(),
        }
    }

    /// Flatten the tree into a node_id-keyed map for O(1) lookup.
    pub fn to_node_map(&self) -> NodeMap {
        fn visit(node: &TreeNode, parent_path: &str, map: &mut NodeMap) {
            let path = if parent_path.is_empty() {
                node.title.clone()
            } else {
                format!("{} > {}", parent_path, node.title)
            };

            if let Some(id) = &node.node_id {
                map.insert(
                    id.clone(),
                    FlatNode {
                        node_id: id.clone(),
                        title: node.title.clone(),
                        path: path.clone(),
                        start_index: node.start_index,
                        end_index: node.end_index,
                        summary: node.summary.clone(),
                        text: node.text.clone(),
                    },
                );
            }

            for child in &node.nodes {
                visit(child, &path, map);
            }
        }

        let mut map = NodeMap::new();
        for node in &self.nodes {
            visit(node, "", &mut map);
        }
        map
    }

    /// Format the entire tree for display.
    pub fn format(&self) -> String {
        let mut result = format!(
            "Document: {} ({} pages, {} sections)\n",
            self.name,
            self.total_pages,
            self.node_count()
        );
        result.push_str(&"-".repeat(50));
        result.push('\n');

        for node in &self.nodes {
            result.push_str(&node.format_tree(0));
        }

        result
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| IndexError::Serialization(e.to_string()))
    }

    /// Parse from JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| IndexError::Serialization(e.to_string()))
    }
}

/// A flat outline entry: a section title with its start page and level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineEntry {
    pub title: String,
    pub start_page: usize,
    pub level: usize,
}

/// Lift a flat, page-ordered outline with hierarchy levels into a tree.
///
/// End pages derive from the next sibling's start (or the parent's end)
/// minus one; a sibling declared on an already-claimed page is bumped to
/// the next free page so sibling ranges never collide.
pub fn build_tree_from_outline(entries: &[OutlineEntry], total_pages: usize) -> Vec<TreeNode> {
    if entries.is_empty() {
        return Vec::new();
    }

    // Levels may not skip downward: clamp each to at most one deeper than
    // its predecessor, and at least 1.
    let mut normalized: Vec<OutlineEntry> = Vec::with_capacity(entries.len());
    let mut prev_level = 0usize;
    for entry in entries {
        let level = entry.level.max(1).min(prev_level + 1);
        normalized.push(OutlineEntry {
            title: entry.title.clone(),
            start_page: entry.start_page,
            level,
        });
        prev_level = level;
    }

    fn lift(entries: &[OutlineEntry], floor: usize, end_page: usize) -> Vec<TreeNode> {
        if entries.is_empty() {
            return Vec::new();
        }

        let level = entries[0].level;
        let mut group_starts: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.level == level)
            .map(|(i, _)| i)
            .collect();
        group_starts.push(entries.len());

        // Sibling starts must strictly increase inside the parent range, so
        // a section declared on an already-claimed page is bumped forward;
        // entries pushed past the range are dropped.
        let mut groups: Vec<(usize, usize, usize)> = Vec::new();
        let mut cursor = floor;
        for pair in group_starts.windows(2) {
            let (i, j) = (pair[0], pair[1]);
            let start = entries[i].start_page.max(cursor);
            if start > end_page {
                break;
            }
            groups.push((i, j, start));
            cursor = start + 1;
        }

        let mut nodes = Vec::new();
        for (k, &(i, j, start)) in groups.iter().enumerate() {
            let end = groups
                .get(k + 1)
                .map(|&(_, _, next_start)| next_start - 1)
                .unwrap_or(end_page);

            let mut node = TreeNode::new(&entries[i].title, start, end);
            node.nodes = lift(&entries[i + 1..j], start, end);
            nodes.push(node);
        }
        nodes
    }

    lift(&normalized, 1, total_pages)
}

/// Turn proposed (title, start_page) pairs into children that contiguously
/// cover `[first_start, parent_end]`, dropping proposals outside the
/// parent's range and collapsing duplicate starts.
pub fn normalize_children(
    proposals: &[(String, usize)],
    parent_start: usize,
    parent_end: usize,
) -> Vec<TreeNode> {
    let mut starts: Vec<(String, usize)> = proposals
        .iter()
        .filter(|(_, page)| *page >= parent_start && *page <= parent_end)
        .cloned()
        .collect();
    starts.sort_by_key(|(_, page)| *page);
    starts.dedup_by_key(|(_, page)| *page);

    let mut children = Vec::new();
    for (i, (title, start)) in starts.iter().enumerate() {
        let end = starts
            .get(i + 1)
            .map(|(_, next)| next.saturating_sub(1).max(*start))
            .unwrap_or(parent_end);
        children.push(TreeNode::new(title, *start, end));
    }
    children
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_section_tree() -> DocumentTree {
        let nodes = vec![
            TreeNode::new("Item 1. Business", 1, 10),
            TreeNode::new("Item 2. Risk Factors", 11, 20),
            TreeNode::new("Item 3. Financials", 21, 30),
        ];
        DocumentTree::new("filing", nodes, 30)
    }

    #[test]
    fn test_assign_node_ids_flat() {
        let mut tree = three_section_tree();
        tree.assign_node_ids();

        assert_eq!(
            tree.collect_node_ids(),
            vec!["0000", "0001", "0002"]
        );
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn test_assign_node_ids_preorder() {
        let mut parent = TreeNode::new("Item 1", 1, 20);
        parent.add_child(TreeNode::new("1.A", 1, 10));
        parent.add_child(TreeNode::new("1.B", 11, 20));
        let mut tree =
            DocumentTree::new("filing", vec![parent, TreeNode::new("Item 2", 21, 30)], 30);

        tree.assign_node_ids();

        // Pre-order: parent, its children, then the next root.
        assert_eq!(
            tree.collect_node_ids(),
            vec!["0000", "0001", "0002", "0003"]
        );
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn test_node_id_width_grows_with_count() {
        let nodes: Vec<TreeNode> = (0..12000)
            .map(|i| TreeNode::new(format!("s{}", i), i + 1, i + 1))
            .collect();
        let mut tree = DocumentTree::new("big", nodes, 12000);
        tree.assign_node_ids();

        let ids = tree.collect_node_ids();
        assert_eq!(ids[0], "00000");
        assert_eq!(ids[11999], "11999");
    }

    #[test]
    fn test_validate_rejects_root_gap() {
        let nodes = vec![
            TreeNode::new("A", 1, 10),
            TreeNode::new("B", 12, 30), // gap at page 11
        ];
        let tree = DocumentTree::new("filing", nodes, 30);
        assert!(tree.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_child_outside_parent() {
        let mut parent = TreeNode::new("A", 5, 20);
        parent.add_child(TreeNode::new("A.1", 3, 20)); // starts before parent
        let tree = DocumentTree::new("filing", vec![parent], 20);
        // Root cover starts late which is fine (preface), but the child is bad.
        assert!(tree.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_children_short_of_parent_end() {
        let mut parent = TreeNode::new("A", 1, 20);
        parent.add_child(TreeNode::new("A.1", 1, 10));
        parent.add_child(TreeNode::new("A.2", 11, 18)); // parent ends at 20
        let tree = DocumentTree::new("filing", vec![parent], 20);
        assert!(tree.validate().is_err());
    }

    #[test]
    fn test_validate_allows_prefix_span() {
        let mut parent = TreeNode::new("A", 1, 20);
        parent.add_child(TreeNode::new("A.1", 3, 10)); // pages 1-2 are prefix
        parent.add_child(TreeNode::new("A.2", 11, 20));
        let tree = DocumentTree::new("filing", vec![parent], 20);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn test_node_map_round_trip() {
        let mut tree = three_section_tree();
        tree.nodes[0].summary = Some("Describes the business.".to_string());
        tree.nodes[0].text = Some("We make things.".to_string());
        tree.assign_node_ids();

        let map = tree.to_node_map();
        assert_eq!(map.len(), tree.node_count());

        let flat = map.get("0000").unwrap();
        assert_eq!(flat.title, "Item 1. Business");
        assert_eq!(flat.start_index, 1);
        assert_eq!(flat.end_index, 10);
        assert_eq!(flat.summary.as_deref(), Some("Describes the business."));
        assert_eq!(flat.text.as_deref(), Some("We make things."));
    }

    #[test]
    fn test_node_map_paths() {
        let mut parent = TreeNode::new("Item 8", 1, 20);
        parent.add_child(TreeNode::new("Balance Sheet", 1, 20));
        let mut tree = DocumentTree::new("filing", vec![parent], 20);
        tree.assign_node_ids();

        let map = tree.to_node_map();
        assert_eq!(map.get("0001").unwrap().path, "Item 8 > Balance Sheet");
    }

    #[test]
    fn test_no_text_strips_everything_but_topology() {
        let mut tree = three_section_tree();
        tree.nodes[1].text = Some("secret".to_string());
        tree.nodes[1].summary = Some("risk overview".to_string());
        tree.assign_node_ids();

        let stripped = tree.to_no_text();
        let json = serde_json::to_string(&stripped).unwrap();

        assert!(!json.contains("secret"));
        assert!(!json.contains("start_index"));
        assert!(json.contains("risk overview"));
        assert_eq!(stripped.nodes.len(), 3);
        assert_eq!(stripped.nodes[1].node_id.as_deref(), Some("0001"));
    }

    #[test]
    fn test_build_tree_from_outline() {
        let entries = vec![
            OutlineEntry {
                title: "Item 1".into(),
                start_page: 1,
                level: 1,
            },
            OutlineEntry {
                title: "1.A".into(),
                start_page: 1,
                level: 2,
            },
            OutlineEntry {
                title: "1.B".into(),
                start_page: 6,
                level: 2,
            },
            OutlineEntry {
                title: "Item 2".into(),
                start_page: 11,
                level: 1,
            },
        ];

        let roots = build_tree_from_outline(&entries, 30);
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].end_index, 10);
        assert_eq!(roots[0].nodes.len(), 2);
        assert_eq!(roots[0].nodes[0].end_index, 5);
        assert_eq!(roots[0].nodes[1].end_index, 10);
        assert_eq!(roots[1].start_index, 11);
        assert_eq!(roots[1].end_index, 30);

        let tree = DocumentTree::new("t", roots, 30);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn test_build_tree_bumps_same_page_siblings() {
        let entries = vec![
            OutlineEntry {
                title: "A".into(),
                start_page: 5,
                level: 1,
            },
            OutlineEntry {
                title: "B".into(),
                start_page: 5, // same declared page as its sibling
                level: 1,
            },
        ];

        let roots = build_tree_from_outline(&entries, 10);
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].start_index, 5);
        assert_eq!(roots[0].end_index, 5);
        assert_eq!(roots[1].start_index, 6);
        assert_eq!(roots[1].end_index, 10);

        let tree = DocumentTree::new("t", roots, 10);
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn test_build_tree_clamps_skipping_levels() {
        let entries = vec![
            OutlineEntry {
                title: "A".into(),
                start_page: 1,
                level: 1,
            },
            OutlineEntry {
                title: "deep".into(),
                start_page: 3,
                level: 5, // clamped to 2
            },
            OutlineEntry {
                title: "B".into(),
                start_page: 11,
                level: 1,
            },
        ];

        let roots = build_tree_from_outline(&entries, 20);
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].nodes.len(), 1);
        assert_eq!(roots[0].nodes[0].title, "deep");
    }

    #[test]
    fn test_normalize_children_covers_parent_tail() {
        let proposals = vec![
            ("B".to_string(), 15),
            ("A".to_string(), 11),
            ("out of range".to_string(), 40),
        ];

        let children = normalize_children(&proposals, 11, 30);
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].title, "A");
        assert_eq!(children[0].start_index, 11);
        assert_eq!(children[0].end_index, 14);
        assert_eq!(children[1].start_index, 15);
        assert_eq!(children[1].end_index, 30);
    }

    #[test]
    fn test_tree_json_roundtrip() {
        let mut tree = three_section_tree();
        tree.assign_node_ids();

        let json = tree.to_json().unwrap();
        let parsed = DocumentTree::from_json(&json).unwrap();

        assert_eq!(parsed.name, tree.name);
        assert_eq!(parsed.total_pages, tree.total_pages);
        assert_eq!(parsed.collect_node_ids(), tree.collect_node_ids());
    }
}
