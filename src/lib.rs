//! Filing Index - hierarchical tree indexing and hybrid retrieval for
//! long financial filings.
//!
//! A filing PDF is transformed into a validated tree of titled,
//! page-ranged sections with per-node summaries and text. Questions are
//! answered by a hybrid pipeline that combines dense-embedding chunk
//! scoring with LLM reasoning over the text-stripped tree, producing
//! answers with per-claim page citations.
//!
//! # Overview
//!
//! Ingest: [`indexer::TreeBuilder`] drives the LLM through ToC
//! detection, windowed outlining, and recursive subdivision;
//! [`enrich::NodeEnricher`] attaches text and summaries;
//! [`chunker::Chunker`] splits node text into token-bounded overlapping
//! chunks, which are embedded in batches and persisted by
//! [`store::Store`] in one transaction per document.
//!
//! Query: [`retrieval::RetrievalOrchestrator`] decomposes the question,
//! selects documents by metadata, fans out [`value_search::ValueSearch`]
//! and [`search::LlmTreeSearch`] concurrently per document, merges
//! precision-first, packs whole nodes into a token budget, and
//! [`answer::AnswerGenerator`] produces the cited answer with a
//! confidence label.
//!
//! # Quick Start
//!
//! ```no_run
//! use filing_index::{config::Config, server::AppState, server};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!
//!     let state = Arc::new(AppState::from_config(config)?);
//!     server::serve(state, "127.0.0.1:8080").await
//! }
//! ```

pub mod answer;
pub mod chunker;
pub mod config;
pub mod document;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod indexer;
pub mod ingest;
pub mod llm;
pub mod retrieval;
pub mod search;
pub mod server;
pub mod store;
pub mod token;
pub mod tree;
pub mod value_search;

// Re-export commonly used types
pub use answer::{Answer, AnswerGenerator};
pub use config::Config;
pub use document::Document;
pub use error::{IndexError, Result};
pub use indexer::TreeBuilder;
pub use ingest::IngestOrchestrator;
pub use llm::LlmClient;
pub use retrieval::RetrievalOrchestrator;
pub use store::Store;
pub use tree::{DocumentTree, TreeNode};
