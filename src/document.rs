//! Page-based document representation.
//!
//! A filing is a collection of 1-indexed pages of extracted text. Pages
//! carry `<physical_index_X>` tags when rendered into LLM prompts so the
//! model can report page-accurate section starts.

use crate::error::{IndexError, Result};
use crate::token::Tokenizer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A single page in a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// 1-indexed page number.
    pub number: usize,
    /// Text content of the page.
    pub content: String,
}

impl Page {
    /// Create a new page.
    pub fn new(number: usize, content: String) -> Self {
        Self { number, content }
    }

    /// Format page content with physical index tags for LLM processing.
    pub fn with_index_tags(&self) -> String {
        format!(
            "<physical_index_{}>\n{}\n<physical_index_{}>\n\n",
            self.number, self.content, self.number
        )
    }
}

/// A document consisting of one or more pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Document name/title.
    pub name: String,
    /// Original file path (if loaded from file).
    pub path: Option<PathBuf>,
    /// Pages in the document.
    pub pages: Vec<Page>,
}

impl Document {
    /// Create a new document with given name and pages.
    pub fn new(name: impl Into<String>, pages: Vec<Page>) -> Self {
        Self {
            name: name.into(),
            path: None,
            pages,
        }
    }

    /// Extract a PDF into per-page text.
    pub fn from_pdf(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(IndexError::DocumentNotFound(path.to_path_buf()));
        }

        let page_texts = pdf_extract::extract_text_by_pages(path).map_err(|e| IndexError::Pdf {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        if page_texts.is_empty() {
            return Err(IndexError::Pdf {
                path: path.to_path_buf(),
                message: "PDF produced no pages".to_string(),
            });
        }

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("untitled")
            .to_string();

        let pages = page_texts
            .into_iter()
            .enumerate()
            .map(|(i, content)| Page::new(i + 1, content))
            .collect();

        Ok(Self {
            name,
            path: Some(path.to_path_buf()),
            pages,
        })
    }

    /// Create a document from page texts (1-indexed in given order).
    pub fn from_page_texts(name: impl Into<String>, texts: Vec<String>) -> Self {
        let pages = texts
            .into_iter()
            .enumerate()
            .map(|(i, content)| Page::new(i + 1, content))
            .collect();
        Self {
            name: name.into(),
            path: None,
            pages,
        }
    }

    /// Get total number of pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Total token count across all pages.
    pub fn total_tokens(&self, tokenizer: &Tokenizer) -> usize {
        self.pages.iter().map(|p| tokenizer.count(&p.content)).sum()
    }

    /// Get a specific page by number (1-indexed).
    pub fn get_page(&self, number: usize) -> Option<&Page> {
        if number == 0 || number > self.pages.len() {
            None
        } else {
            Some(&self.pages[number - 1])
        }
    }

    /// Tagged content for a range of pages (1-indexed, inclusive).
    pub fn tagged_range(&self, start: usize, end: usize) -> String {
        self.pages
            .iter()
            .filter(|p| p.number >= start && p.number <= end)
            .map(|p| p.with_index_tags())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Raw text for a range of pages (1-indexed, inclusive), no tags.
    pub fn raw_range(&self, start: usize, end: usize) -> String {
        self.pages
            .iter()
            .filter(|p| p.number >= start && p.number <= end)
            .map(|p| p.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Page texts for a range, used for token-bounded prompt windows.
    pub fn tagged_pages(&self, start: usize, end: usize) -> Vec<String> {
        self.pages
            .iter()
            .filter(|p| p.number >= start && p.number <= end)
            .map(|p| p.with_index_tags())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::from_page_texts(
            "test",
            vec![
                "Introduction".to_string(),
                "Risk Factors".to_string(),
                "Financial Statements".to_string(),
            ],
        )
    }

    #[test]
    fn test_page_with_index_tags() {
        let page = Page::new(5, "Test content".to_string());
        let tagged = page.with_index_tags();
        assert!(tagged.contains("<physical_index_5>"));
        assert!(tagged.contains("Test content"));
    }

    #[test]
    fn test_page_access() {
        let doc = doc();
        assert!(doc.get_page(0).is_none()); // 0 is invalid
        assert_eq!(doc.get_page(2).unwrap().content, "Risk Factors");
        assert!(doc.get_page(4).is_none()); // Out of range
    }

    #[test]
    fn test_raw_range_inclusive() {
        let doc = doc();
        let text = doc.raw_range(2, 3);
        assert!(text.contains("Risk Factors"));
        assert!(text.contains("Financial Statements"));
        assert!(!text.contains("Introduction"));
    }

    #[test]
    fn test_tagged_range() {
        let doc = doc();
        let text = doc.tagged_range(1, 1);
        assert!(text.contains("<physical_index_1>"));
        assert!(!text.contains("<physical_index_2>"));
    }

    #[test]
    fn test_missing_pdf_is_not_found() {
        let err = Document::from_pdf(Path::new("/nonexistent/filing.pdf")).unwrap_err();
        assert!(matches!(err, IndexError::DocumentNotFound(_)));
    }
}
