//! HTTP surface for ingest, query, corpus, and health.
//!
//! Thin handlers over the orchestrators; all domain logic lives below.
//! Contract: `POST /ingest` (multipart), `POST /query` (json),
//! `GET /corpus`, `GET /health`.

use crate::answer::AnswerGenerator;
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::error::IndexError;
use crate::ingest::{IngestOrchestrator, IngestRequest};
use crate::llm::LlmClient;
use crate::retrieval::RetrievalOrchestrator;
use crate::store::Store;
use crate::token::Tokenizer;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub llm: LlmClient,
    pub embedder: EmbeddingClient,
    pub tokenizer: Tokenizer,
}

impl AppState {
    /// Build the shared state from a validated configuration.
    pub fn from_config(config: Config) -> crate::error::Result<Self> {
        let store = Arc::new(Store::open(&config.storage.database_path)?);
        let llm = LlmClient::new(config.llm.clone());
        let embedder = EmbeddingClient::new(config.embedding.clone());
        let tokenizer = Tokenizer::new()?;

        Ok(Self {
            config,
            store,
            llm,
            embedder,
            tokenizer,
        })
    }

    fn ingest_orchestrator(&self) -> IngestOrchestrator {
        IngestOrchestrator::new(
            self.config.clone(),
            Arc::clone(&self.store),
            self.llm.clone(),
            self.embedder.clone(),
            self.tokenizer.clone(),
        )
    }

    fn retrieval_orchestrator(&self) -> RetrievalOrchestrator {
        RetrievalOrchestrator::new(
            Arc::clone(&self.store),
            self.llm.clone(),
            self.embedder.clone(),
            self.tokenizer.clone(),
            self.config.retrieval.clone(),
        )
    }
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ingest", post(ingest_handler))
        .route("/query", post(query_handler))
        .route("/corpus", get(corpus_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(256 * 1024 * 1024))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until shutdown.
pub async fn serve(state: Arc<AppState>, addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    doc_id: i64,
    status: String,
    chunks_created: usize,
    node_count: usize,
    page_count: usize,
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename = String::new();
    let mut company = String::new();
    let mut ticker = String::new();
    let mut fiscal_year: Option<i64> = None;
    let mut doc_type_hint: Option<String> = None;
    let mut force = false;

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                filename = field
                    .file_name()
                    .unwrap_or("upload.pdf")
                    .to_string();
                match field.bytes().await {
                    Ok(bytes) => file_bytes = Some(bytes.to_vec()),
                    Err(e) => {
                        return error_response(IndexError::Validation(format!(
                            "failed to read uploaded file: {}",
                            e
                        )));
                    }
                }
            }
            "company" => company = field.text().await.unwrap_or_default(),
            "ticker" => ticker = field.text().await.unwrap_or_default(),
            "fiscal_year" => {
                fiscal_year = field.text().await.ok().and_then(|t| t.trim().parse().ok());
            }
            "doc_type_hint" => doc_type_hint = field.text().await.ok(),
            "force" => {
                force = field
                    .text()
                    .await
                    .map(|t| matches!(t.trim(), "true" | "1" | "yes"))
                    .unwrap_or(false);
            }
            _ => {}
        }
    }

    let Some(bytes) = file_bytes else {
        return error_response(IndexError::Validation("missing 'file' field".to_string()));
    };
    let Some(fiscal_year) = fiscal_year else {
        return error_response(IndexError::Validation(
            "missing or invalid 'fiscal_year' field".to_string(),
        ));
    };

    let doc_type = doc_type_hint
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| infer_doc_type(&filename));

    let upload_dir = &state.config.storage.upload_dir;
    if let Err(e) = tokio::fs::create_dir_all(upload_dir).await {
        return error_response(IndexError::io(upload_dir, e));
    }
    let pdf_path = upload_dir.join(&filename);
    if let Err(e) = tokio::fs::write(&pdf_path, &bytes).await {
        return error_response(IndexError::io(&pdf_path, e));
    }

    let request = IngestRequest {
        company,
        ticker,
        fiscal_year,
        doc_type,
        filename,
        force,
    };

    match state
        .ingest_orchestrator()
        .ingest_pdf(&pdf_path, &request)
        .await
    {
        Ok(outcome) => Json(IngestResponse {
            doc_id: outcome.doc_id,
            status: outcome.status.as_str().to_string(),
            chunks_created: outcome.chunks_created,
            node_count: outcome.node_count,
            page_count: outcome.page_count,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    companies: Option<Vec<String>>,
    #[serde(default)]
    years: Option<Vec<i64>>,
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    if request.query.trim().is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"error": "query must not be empty"})),
        )
            .into_response();
    }

    let companies = request.companies.unwrap_or_default();
    let years = request.years.unwrap_or_default();

    let outcome = match state
        .retrieval_orchestrator()
        .retrieve(&request.query, &companies, &years)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return error_response(e),
    };

    let generator = AnswerGenerator::new(state.llm.clone());
    match generator
        .generate(&request.query, &outcome.context, &outcome.sub_questions)
        .await
    {
        Ok(mut answer) => {
            for note in &outcome.failed_documents {
                answer
                    .conflicts_detected
                    .push(format!("document unavailable during retrieval: {}", note));
            }
            Json(answer).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn corpus_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_documents() {
        Ok(documents) => {
            let listing: Vec<_> = documents
                .iter()
                .map(|d| {
                    json!({
                        "id": d.id,
                        "company": d.company,
                        "ticker": d.ticker,
                        "fiscal_year": d.fiscal_year,
                        "doc_type": d.doc_type,
                        "chunk_count": d.chunk_count,
                        "node_count": d.node_count,
                        "page_count": d.page_count,
                        "status": d.status.as_str(),
                        "ingest_timestamp": d.ingest_timestamp,
                    })
                })
                .collect();
            Json(json!({ "documents": listing })).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let embedding_ok = state.embedder.test_connection().await.is_ok();
    let llm_ok = state.llm.test_connection().await.is_ok();
    let documents = state.store.document_count().unwrap_or(0);

    let status = if embedding_ok && llm_ok { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "embedding": if embedding_ok { "ok" } else { "unreachable" },
        "llm": if llm_ok { "ok" } else { "unreachable" },
        "documents": documents,
    }))
    .into_response()
}

/// Map a domain error to its HTTP status.
fn status_for(err: &IndexError) -> StatusCode {
    match err {
        IndexError::DuplicateDocument { .. } => StatusCode::CONFLICT,
        IndexError::Validation(_) => StatusCode::BAD_REQUEST,
        IndexError::DocumentNotFound(_) => StatusCode::NOT_FOUND,
        IndexError::LlmApi(_) | IndexError::LlmCapacity(_) | IndexError::Embedding(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: IndexError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("request failed: {}", err);
    }
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

/// Infer the filing type from the filename when no hint is given.
fn infer_doc_type(filename: &str) -> String {
    let upper = filename.to_uppercase();
    if upper.contains("20-F") || upper.contains("20F") {
        "20-F".to_string()
    } else if upper.contains("10-K") || upper.contains("10K") {
        "10-K".to_string()
    } else if upper.contains("10-Q") || upper.contains("10Q") {
        "10-Q".to_string()
    } else {
        "annual-report".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_doc_type() {
        assert_eq!(infer_doc_type("INFY_20F_2022.pdf"), "20-F");
        assert_eq!(infer_doc_type("aapl-10k-2023.pdf"), "10-K");
        assert_eq!(infer_doc_type("msft_10-Q_q3.pdf"), "10-Q");
        assert_eq!(infer_doc_type("annual.pdf"), "annual-report");
    }

    #[test]
    fn test_status_mapping() {
        let dup = IndexError::DuplicateDocument {
            ticker: "INFY".into(),
            fiscal_year: 2022,
            doc_type: "20-F".into(),
            doc_id: 1,
        };
        assert_eq!(status_for(&dup), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&IndexError::Validation("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&IndexError::LlmApi("x".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&IndexError::Storage("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
