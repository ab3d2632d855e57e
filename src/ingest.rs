//! Ingest orchestrator.
//!
//! Sequences one document through the pipeline: save PDF, insert a
//! `processing` row, build the tree, enrich it, chunk it, embed the
//! chunks in batches, then write everything in a single transaction and
//! flip the row to `completed`. Any failure leaves the row `failed` with
//! its error message. Tree-building phases run sequentially; only the
//! retrieval side fans out.

use crate::chunker::{Chunk, Chunker};
use crate::config::Config;
use crate::document::Document;
use crate::embedding::EmbeddingClient;
use crate::enrich::NodeEnricher;
use crate::error::{IndexError, Result};
use crate::indexer::TreeBuilder;
use crate::llm::LlmClient;
use crate::store::{DocStatus, Store};
use crate::token::Tokenizer;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Metadata accompanying an uploaded filing.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub company: String,
    pub ticker: String,
    pub fiscal_year: i64,
    pub doc_type: String,
    pub filename: String,
    pub force: bool,
}

/// Result of a completed ingest.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub doc_id: i64,
    pub status: DocStatus,
    pub page_count: usize,
    pub node_count: usize,
    pub chunks_created: usize,
}

/// Drives one document through tree building, enrichment, chunking,
/// embedding, and storage.
pub struct IngestOrchestrator {
    config: Config,
    store: Arc<Store>,
    llm: LlmClient,
    embedder: EmbeddingClient,
    tokenizer: Tokenizer,
}

impl IngestOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        config: Config,
        store: Arc<Store>,
        llm: LlmClient,
        embedder: EmbeddingClient,
        tokenizer: Tokenizer,
    ) -> Self {
        Self {
            config,
            store,
            llm,
            embedder,
            tokenizer,
        }
    }

    /// Ingest a PDF under the given metadata.
    ///
    /// A duplicate (ticker, fiscal_year, doc_type) is rejected unless
    /// `force` is set, in which case the prior document is deleted first
    /// (tree and chunks cascade).
    pub async fn ingest_pdf(&self, pdf_path: &Path, request: &IngestRequest) -> Result<IngestOutcome> {
        if request.ticker.trim().is_empty() || request.company.trim().is_empty() {
            return Err(IndexError::Validation(
                "company and ticker are required".to_string(),
            ));
        }

        if let Some(existing) =
            self.store
                .find_document(&request.ticker, request.fiscal_year, &request.doc_type)?
        {
            if !request.force {
                return Err(IndexError::DuplicateDocument {
                    ticker: request.ticker.clone(),
                    fiscal_year: request.fiscal_year,
                    doc_type: request.doc_type.clone(),
                    doc_id: existing.id,
                });
            }
            info!(
                doc_id = existing.id,
                "force replacing {} {} {}", request.ticker, request.fiscal_year, request.doc_type
            );
            self.store.delete_document(existing.id)?;
        }

        let stored_path = self.save_upload(pdf_path, &request.filename)?;

        let doc_id = self.store.insert_document(
            &request.company,
            &request.ticker,
            request.fiscal_year,
            &request.doc_type,
            &request.filename,
        )?;

        match self.run_pipeline(&stored_path, doc_id).await {
            Ok(outcome) => {
                info!(
                    doc_id,
                    pages = outcome.page_count,
                    nodes = outcome.node_count,
                    chunks = outcome.chunks_created,
                    "ingest completed for {} {} {}",
                    request.ticker,
                    request.fiscal_year,
                    request.doc_type
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(doc_id, "ingest failed: {}", e);
                self.store.mark_failed(doc_id, &e.to_string())?;
                Err(e)
            }
        }
    }

    /// Copy the PDF into the upload directory, keeping the display name.
    fn save_upload(&self, source: &Path, filename: &str) -> Result<std::path::PathBuf> {
        let upload_dir = &self.config.storage.upload_dir;
        if !upload_dir.exists() {
            std::fs::create_dir_all(upload_dir).map_err(|e| IndexError::io(upload_dir, e))?;
        }

        let dest = upload_dir.join(filename);
        if source != dest {
            std::fs::copy(source, &dest).map_err(|e| IndexError::io(source, e))?;
        }
        Ok(dest)
    }

    async fn run_pipeline(&self, pdf_path: &Path, doc_id: i64) -> Result<IngestOutcome> {
        let document = Document::from_pdf(pdf_path)?;
        let total_tokens = document.total_tokens(&self.tokenizer);

        let builder = TreeBuilder::new(
            self.llm.clone(),
            self.tokenizer.clone(),
            self.config.indexing.clone(),
        );
        let mut tree = builder.build(&document).await?;

        let enricher = NodeEnricher::new(self.llm.clone());
        enricher.enrich(&mut tree, &document).await;

        let chunker = Chunker::new(self.tokenizer.clone(), self.config.chunking.clone());
        let chunks = chunker.chunk_node_map(&tree.to_node_map())?;

        let embedded = self.embed_chunks(chunks).await?;

        self.store.complete_document(
            doc_id,
            document.page_count(),
            total_tokens,
            &tree,
            &embedded,
        )?;

        Ok(IngestOutcome {
            doc_id,
            status: DocStatus::Completed,
            page_count: document.page_count(),
            node_count: tree.node_count(),
            chunks_created: embedded.len(),
        })
    }

    /// Embed chunks in configured batches. Each batch is one remote call,
    /// submitted sequentially; retries happen inside the embedding client.
    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<(Chunk, Vec<f32>)>> {
        let batch_size = self.config.embedding.batch_size.max(1);
        let mut embedded = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;

            for (chunk, vector) in batch.iter().zip(vectors) {
                embedded.push((chunk.clone(), vector));
            }
        }

        Ok(embedded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn orchestrator(store: Arc<Store>, dir: &Path) -> IngestOrchestrator {
        let mut config = Config::with_llm("http://localhost:1", "k", "m");
        config.storage.upload_dir = dir.join("uploads");
        IngestOrchestrator::new(
            config.clone(),
            store,
            LlmClient::new(config.llm.clone()),
            EmbeddingClient::new(config.embedding.clone()),
            Tokenizer::new().unwrap(),
        )
    }

    fn request(force: bool) -> IngestRequest {
        IngestRequest {
            company: "Infosys".to_string(),
            ticker: "INFY".to_string(),
            fiscal_year: 2022,
            doc_type: "20-F".to_string(),
            filename: "INFY_20F_2022.pdf".to_string(),
            force,
        }
    }

    #[tokio::test]
    async fn test_duplicate_rejected_without_force() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let first = store
            .insert_document("Infosys", "INFY", 2022, "20-F", "INFY_20F_2022.pdf")
            .unwrap();

        let orch = orchestrator(store.clone(), dir.path());
        let err = orch
            .ingest_pdf(Path::new("/nonexistent.pdf"), &request(false))
            .await
            .unwrap_err();

        match err {
            IndexError::DuplicateDocument { doc_id, .. } => assert_eq!(doc_id, first),
            other => panic!("expected duplicate error, got {other}"),
        }
        // The original row is untouched
        assert_eq!(store.document_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_force_deletes_prior_document() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let first = store
            .insert_document("Infosys", "INFY", 2022, "20-F", "INFY_20F_2022.pdf")
            .unwrap();

        let orch = orchestrator(store.clone(), dir.path());
        // Pipeline fails on the missing PDF, but the prior document is
        // already replaced by a fresh row.
        let result = orch
            .ingest_pdf(Path::new("/nonexistent.pdf"), &request(true))
            .await;

        assert!(result.is_err());
        assert!(store.get_document(first).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_metadata_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let orch = orchestrator(store, dir.path());

        let mut req = request(false);
        req.ticker = "  ".to_string();

        let err = orch
            .ingest_pdf(Path::new("/nonexistent.pdf"), &req)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Validation(_)));
    }

    #[tokio::test]
    async fn test_failed_pipeline_marks_document_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let orch = orchestrator(store.clone(), dir.path());

        // A real file that is not a PDF: the pipeline fails after insert.
        let bogus = dir.path().join("not_a.pdf");
        std::fs::write(&bogus, b"plain text, not a pdf").unwrap();

        let mut req = request(false);
        req.filename = "not_a.pdf".to_string();

        assert!(orch.ingest_pdf(&bogus, &req).await.is_err());

        let docs = store.list_documents().unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].status, DocStatus::Failed);
        assert!(docs[0].error_message.is_some());
    }
}
