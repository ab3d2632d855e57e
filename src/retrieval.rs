//! Retrieval orchestrator.
//!
//! Per query: decompose into sub-questions, select candidate documents
//! by metadata, fan out value search and LLM tree search concurrently
//! per (sub-question, document) pair, merge precision-first, then walk
//! the merged order packing whole nodes into the context budget.
//!
//! Merge ordering is semantic, not arrival-order: LLM-search ids always
//! precede value-search ids for a pair, no matter which task finished
//! first. A document whose searches fail degrades to an empty result and
//! is reported; it never sinks the query.

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingClient;
use crate::error::{IndexError, Result};
use crate::llm::{LlmClient, Prompts};
use crate::search::LlmTreeSearch;
use crate::store::{ChunkEmbedding, DocumentRecord, Store};
use crate::token::Tokenizer;
use crate::tree::{NoTextTree, NodeMap};
use crate::value_search::{NodeScore, ValueSearch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// An atomic sub-question from query decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuestion {
    pub question: String,
    #[serde(default)]
    pub target_company: Option<String>,
    #[serde(default)]
    pub target_year: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Decomposition {
    sub_questions: Vec<SubQuestion>,
}

/// One whole node of context, ready for answer generation.
#[derive(Debug, Clone, Serialize)]
pub struct ContextBlock {
    pub doc_id: i64,
    pub company: String,
    pub ticker: String,
    pub fiscal_year: i64,
    pub node_id: String,
    pub title: String,
    pub path: String,
    pub start_page: usize,
    pub end_page: usize,
    pub text: String,
}

/// Everything retrieval hands to the answer generator.
#[derive(Debug)]
pub struct RetrievalOutcome {
    pub sub_questions: Vec<SubQuestion>,
    pub context: Vec<ContextBlock>,
    /// Human-readable notes for documents whose retrieval failed.
    pub failed_documents: Vec<String>,
}

/// Loaded per-document state, shared immutably across concurrent readers.
struct DocData {
    record: DocumentRecord,
    tree_no_text: NoTextTree,
    node_map: NodeMap,
    chunks: Vec<ChunkEmbedding>,
}

/// Orchestrates hybrid retrieval across the corpus.
pub struct RetrievalOrchestrator {
    store: Arc<Store>,
    llm: LlmClient,
    embedder: EmbeddingClient,
    tokenizer: Tokenizer,
    config: RetrievalConfig,
}

impl RetrievalOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        store: Arc<Store>,
        llm: LlmClient,
        embedder: EmbeddingClient,
        tokenizer: Tokenizer,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            llm,
            embedder,
            tokenizer,
            config,
        }
    }

    /// Run the full retrieval pipeline for a query.
    pub async fn retrieve(
        &self,
        query: &str,
        companies: &[String],
        years: &[i64],
    ) -> Result<RetrievalOutcome> {
        if query.trim().is_empty() {
            return Err(IndexError::Validation("query must not be empty".to_string()));
        }

        let sub_questions = self.decompose(query).await;
        let completed = self.store.list_completed()?;

        // Candidate documents per sub-question, and the union to load.
        let selections: Vec<Vec<i64>> = sub_questions
            .iter()
            .map(|sq| {
                select_documents(&completed, companies, years, sq)
                    .iter()
                    .map(|d| d.id)
                    .collect()
            })
            .collect();

        let mut to_load: Vec<i64> = selections.iter().flatten().copied().collect();
        to_load.sort_unstable();
        to_load.dedup();

        let mut docs: Vec<Arc<DocData>> = Vec::new();
        let mut failed_documents = Vec::new();
        for doc_id in to_load {
            match self.load_doc(doc_id, &completed) {
                Ok(data) => docs.push(Arc::new(data)),
                Err(e) => {
                    warn!(doc_id, "failed to load document for retrieval: {}", e);
                    failed_documents.push(format!("doc {}: {}", doc_id, e));
                }
            }
        }

        info!(
            sub_questions = sub_questions.len(),
            documents = docs.len(),
            "retrieval fan-out starting"
        );

        // Fan out every (sub-question, document) pair; the semaphore caps
        // outstanding external calls across the whole fan-out.
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = Vec::new();

        for (sq_index, sub_question) in sub_questions.iter().enumerate() {
            for doc in &docs {
                if !selections[sq_index].contains(&doc.record.id) {
                    continue;
                }

                let doc = Arc::clone(doc);
                let semaphore = Arc::clone(&semaphore);
                let question = sub_question.question.clone();
                let value_search =
                    ValueSearch::new(self.embedder.clone(), self.config.value_search_top_k);
                let llm_search = LlmTreeSearch::new(self.llm.clone());

                tasks.push(async move {
                    let (llm_ids, value_scores) = tokio::join!(
                        async {
                            let _permit = semaphore.acquire().await.ok();
                            llm_search
                                .search(&question, &doc.tree_no_text, &doc.node_map)
                                .await
                        },
                        async {
                            let _permit = semaphore.acquire().await.ok();
                            value_search
                                .search(&question, &doc.chunks, &doc.node_map)
                                .await
                        }
                    );

                    let value_scores = match value_scores {
                        Ok(scores) => scores,
                        Err(e) => {
                            warn!(
                                doc_id = doc.record.id,
                                "value search failed, using LLM results only: {}", e
                            );
                            Vec::new()
                        }
                    };

                    (doc, merge_hybrid(&llm_ids, &value_scores))
                });
            }
        }

        // join_all preserves input order, so merged pair results come back
        // in (sub-question, document) order for the global merge.
        let pair_results = futures::future::join_all(tasks).await;

        let context = self.extract_context(&pair_results);

        Ok(RetrievalOutcome {
            sub_questions,
            context,
            failed_documents,
        })
    }

    /// Decompose a query into sub-questions; a parse failure treats the
    /// query as a single atomic sub-question.
    async fn decompose(&self, query: &str) -> Vec<SubQuestion> {
        let prompt = Prompts::decompose_query().replace("{query}", query);

        match self
            .llm
            .complete_json::<Decomposition>(Some(Prompts::system_document_analyzer()), &prompt)
            .await
        {
            Ok(d) if !d.sub_questions.is_empty() => d.sub_questions,
            Ok(_) => single_question(query),
            Err(e) => {
                warn!("query decomposition failed, treating as atomic: {}", e);
                single_question(query)
            }
        }
    }

    fn load_doc(&self, doc_id: i64, completed: &[DocumentRecord]) -> Result<DocData> {
        let record = completed
            .iter()
            .find(|d| d.id == doc_id)
            .cloned()
            .ok_or_else(|| IndexError::Storage(format!("document {} not found", doc_id)))?;

        let stored = self
            .store
            .load_tree(doc_id)?
            .ok_or_else(|| IndexError::Storage(format!("no tree stored for document {}", doc_id)))?;
        let chunks = self.store.load_chunk_embeddings(doc_id)?;

        Ok(DocData {
            record,
            tree_no_text: stored.tree_no_text,
            node_map: stored.node_map,
            chunks,
        })
    }

    /// Walk merged pair results in order, packing whole nodes until the
    /// context budget is reached. A node either fits entirely or is
    /// skipped; duplicates across pairs are packed once.
    fn extract_context(&self, pair_results: &[(Arc<DocData>, Vec<String>)]) -> Vec<ContextBlock> {
        let mut seen: BTreeSet<(i64, String)> = BTreeSet::new();
        let mut used_tokens = 0usize;
        let mut blocks = Vec::new();

        for (doc, node_ids) in pair_results {
            for node_id in node_ids {
                if !seen.insert((doc.record.id, node_id.clone())) {
                    continue;
                }

                let Some(node) = doc.node_map.get(node_id) else {
                    continue;
                };
                let Some(text) = node.text.as_ref().filter(|t| !t.trim().is_empty()) else {
                    continue;
                };

                let cost = self.tokenizer.count(text);
                if used_tokens + cost > self.config.context_budget_tokens {
                    continue;
                }

                used_tokens += cost;
                blocks.push(ContextBlock {
                    doc_id: doc.record.id,
                    company: doc.record.company.clone(),
                    ticker: doc.record.ticker.clone(),
                    fiscal_year: doc.record.fiscal_year,
                    node_id: node.node_id.clone(),
                    title: node.title.clone(),
                    path: node.path.clone(),
                    start_page: node.start_index,
                    end_page: node.end_index,
                    text: text.clone(),
                });
            }
        }

        info!(
            blocks = blocks.len(),
            tokens = used_tokens,
            "context extraction finished"
        );
        blocks
    }
}

fn single_question(query: &str) -> Vec<SubQuestion> {
    vec![SubQuestion {
        question: query.to_string(),
        target_company: None,
        target_year: None,
    }]
}

/// Metadata-filtered document selection for one sub-question.
///
/// User-supplied companies/years are hard constraints; the sub-question's
/// own tags narrow further. Only `completed` documents are candidates
/// (the caller passes the completed set).
pub fn select_documents<'a>(
    completed: &'a [DocumentRecord],
    companies: &[String],
    years: &[i64],
    sub_question: &SubQuestion,
) -> Vec<&'a DocumentRecord> {
    completed
        .iter()
        .filter(|doc| {
            if !companies.is_empty() && !companies.iter().any(|c| matches_company(doc, c)) {
                return false;
            }
            if !years.is_empty() && !years.contains(&doc.fiscal_year) {
                return false;
            }
            if let Some(target) = &sub_question.target_company {
                if !matches_company(doc, target) {
                    return false;
                }
            }
            if let Some(year) = sub_question.target_year {
                if doc.fiscal_year != year {
                    return false;
                }
            }
            true
        })
        .collect()
}

fn matches_company(doc: &DocumentRecord, name: &str) -> bool {
    doc.ticker.eq_ignore_ascii_case(name) || doc.company.eq_ignore_ascii_case(name)
}

/// Hybrid merge for one (sub-question, document) pair: LLM-search ids in
/// their returned order, then value-search ids by score, skipping ids
/// already present.
pub fn merge_hybrid(llm_ids: &[String], value_scores: &[NodeScore]) -> Vec<String> {
    let mut merged: Vec<String> = llm_ids.to_vec();
    let mut seen: BTreeSet<&str> = llm_ids.iter().map(|s| s.as_str()).collect();

    for score in value_scores {
        if seen.insert(score.node_id.as_str()) {
            merged.push(score.node_id.clone());
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocStatus;

    fn record(id: i64, ticker: &str, company: &str, year: i64) -> DocumentRecord {
        DocumentRecord {
            id,
            company: company.to_string(),
            ticker: ticker.to_string(),
            fiscal_year: year,
            doc_type: "20-F".to_string(),
            filename: format!("{}.pdf", ticker),
            page_count: 100,
            total_tokens: 1000,
            node_count: 10,
            chunk_count: 40,
            status: DocStatus::Completed,
            error_message: None,
            ingest_timestamp: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn score(node_id: &str, score_value: f32) -> NodeScore {
        NodeScore {
            node_id: node_id.to_string(),
            score: score_value,
        }
    }

    #[test]
    fn test_merge_hybrid_precedence() {
        // LLM returns ["0007","0012"]; value returns [("0012",0.9),("0005",0.7)]
        let llm_ids = vec!["0007".to_string(), "0012".to_string()];
        let value_scores = vec![score("0012", 0.9), score("0005", 0.7)];

        let merged = merge_hybrid(&llm_ids, &value_scores);
        assert_eq!(merged, vec!["0007", "0012", "0005"]);
    }

    #[test]
    fn test_merge_hybrid_no_duplicates() {
        let llm_ids = vec!["0001".to_string(), "0002".to_string()];
        let value_scores = vec![score("0002", 0.9), score("0001", 0.8), score("0003", 0.7)];

        let merged = merge_hybrid(&llm_ids, &value_scores);
        let unique: BTreeSet<&String> = merged.iter().collect();
        assert_eq!(unique.len(), merged.len());
        assert_eq!(merged, vec!["0001", "0002", "0003"]);
    }

    #[test]
    fn test_merge_hybrid_empty_llm_side() {
        let merged = merge_hybrid(&[], &[score("0004", 0.5)]);
        assert_eq!(merged, vec!["0004"]);
    }

    #[test]
    fn test_select_documents_user_filters_are_hard() {
        let docs = vec![
            record(1, "AAPL", "Apple Inc.", 2021),
            record(2, "AAPL", "Apple Inc.", 2022),
            record(3, "INFY", "Infosys", 2022),
        ];
        let sq = SubQuestion {
            question: "revenue?".to_string(),
            target_company: None,
            target_year: None,
        };

        let selected = select_documents(&docs, &["AAPL".to_string()], &[2022], &sq);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, 2);
    }

    #[test]
    fn test_select_documents_sub_question_narrows() {
        let docs = vec![
            record(1, "AAPL", "Apple Inc.", 2021),
            record(2, "AAPL", "Apple Inc.", 2022),
            record(3, "INFY", "Infosys", 2022),
        ];
        let sq = SubQuestion {
            question: "what was Infosys revenue in 2022?".to_string(),
            target_company: Some("Infosys".to_string()),
            target_year: Some(2022),
        };

        let selected = select_documents(&docs, &[], &[], &sq);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, 3);
    }

    #[test]
    fn test_select_documents_company_matches_ticker_or_name() {
        let docs = vec![record(1, "AAPL", "Apple Inc.", 2021)];
        let sq = SubQuestion {
            question: "q".to_string(),
            target_company: Some("apple inc.".to_string()),
            target_year: None,
        };
        assert_eq!(select_documents(&docs, &[], &[], &sq).len(), 1);

        let sq2 = SubQuestion {
            question: "q".to_string(),
            target_company: Some("aapl".to_string()),
            target_year: None,
        };
        assert_eq!(select_documents(&docs, &[], &[], &sq2).len(), 1);
    }

    #[test]
    fn test_decomposition_shape_parses() {
        let json = r#"{
            "sub_questions": [
                {"question": "AAPL revenue 2022?", "target_company": "AAPL", "target_year": 2022},
                {"question": "INFY headcount?", "target_company": "INFY", "target_year": null}
            ]
        }"#;

        let parsed: Decomposition = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.sub_questions.len(), 2);
        assert_eq!(parsed.sub_questions[0].target_year, Some(2022));
        assert!(parsed.sub_questions[1].target_year.is_none());
    }

    #[test]
    fn test_single_question_fallback_shape() {
        let qs = single_question("what was revenue?");
        assert_eq!(qs.len(), 1);
        assert!(qs[0].target_company.is_none());
    }
}
