//! Error types for the filing index.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our custom error.
pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors that can occur while indexing or querying filings.
///
/// Variants are ordered roughly by escalation: transient adapter errors are
/// retried inside the adapters, shape errors let the caller decide between
/// degrading and failing, validation errors fail the operation immediately,
/// and storage errors roll back the document's logical transaction.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Error reading or writing files.
    #[error("I/O error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// PDF text extraction failed.
    #[error("Failed to extract text from '{path}': {message}")]
    Pdf { path: PathBuf, message: String },

    /// The document path does not exist.
    #[error("Document not found at '{0}'")]
    DocumentNotFound(PathBuf),

    /// Transient LLM API error (network, 5xx, deadline). Retried by the adapter.
    #[error("LLM API error: {0}")]
    LlmApi(String),

    /// LLM rate limit. Retried by the adapter with jitter.
    #[error("LLM capacity error: {0}")]
    LlmCapacity(String),

    /// LLM response did not match the required JSON shape after retries.
    #[error("Failed to parse LLM response: {0}")]
    LlmShape(String),

    /// Transient embedding service error. Retried per batch.
    #[error("Embedding service error: {0}")]
    Embedding(String),

    /// Embedding service returned vectors of an unexpected dimension. Fatal.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDim { expected: usize, actual: usize },

    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// A document already exists for this (ticker, fiscal_year, doc_type).
    #[error("Document already exists for {ticker} {fiscal_year} {doc_type} (doc_id {doc_id})")]
    DuplicateDocument {
        ticker: String,
        fiscal_year: i64,
        doc_type: String,
        doc_id: i64,
    },

    /// User-facing validation error (missing metadata, empty query, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Tree violates a structural invariant.
    #[error("Tree structure error: {0}")]
    TreeInvariant(String),

    /// Durable storage error. Rolls back the document's transaction.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl IndexError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the adapter may retry this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LlmApi(_) | Self::LlmCapacity(_) | Self::Embedding(_) | Self::Http(_)
        )
    }
}

impl From<reqwest::Error> for IndexError {
    fn from(err: reqwest::Error) -> Self {
        IndexError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::LlmShape(err.to_string())
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        IndexError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(IndexError::LlmApi("timeout".into()).is_transient());
        assert!(IndexError::LlmCapacity("429".into()).is_transient());
        assert!(IndexError::Embedding("connection reset".into()).is_transient());
        assert!(!IndexError::LlmShape("bad json".into()).is_transient());
        assert!(
            !IndexError::EmbeddingDim {
                expected: 768,
                actual: 384
            }
            .is_transient()
        );
        assert!(!IndexError::Validation("empty query".into()).is_transient());
    }

    #[test]
    fn test_duplicate_message_names_key() {
        let err = IndexError::DuplicateDocument {
            ticker: "INFY".into(),
            fiscal_year: 2022,
            doc_type: "20-F".into(),
            doc_id: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("already exists"));
        assert!(msg.contains("INFY"));
        assert!(msg.contains("2022"));
    }
}
