//! Filing Index CLI
//!
//! Ingests filing PDFs into the index and answers questions over them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filing_index::{
    config::Config,
    embedding::EmbeddingClient,
    ingest::{IngestOrchestrator, IngestRequest},
    llm::LlmClient,
    retrieval::RetrievalOrchestrator,
    answer::AnswerGenerator,
    server::{self, AppState},
    store::Store,
    token::Tokenizer,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Filing Index - LLM-powered tree indexing and hybrid retrieval for filings
#[derive(Parser)]
#[command(name = "filing-index")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
    },

    /// Ingest a single filing PDF
    Ingest {
        /// Path to the PDF
        pdf: PathBuf,

        /// Company name
        #[arg(long)]
        company: String,

        /// Ticker symbol
        #[arg(long)]
        ticker: String,

        /// Fiscal year
        #[arg(long)]
        year: i64,

        /// Filing type (e.g. 20-F, 10-K)
        #[arg(long, default_value = "10-K")]
        doc_type: String,

        /// Replace an existing document with the same key
        #[arg(long)]
        force: bool,
    },

    /// Ingest every PDF in a directory, metadata taken from filenames
    /// shaped like TICKER_TYPE_YEAR.pdf
    IngestDir {
        /// Directory containing PDFs
        dir: PathBuf,

        /// Replace existing documents
        #[arg(long)]
        force: bool,
    },

    /// Ask a question over the ingested corpus
    Query {
        /// The question
        query: String,

        /// Restrict to these companies/tickers
        #[arg(long, value_delimiter = ',')]
        companies: Vec<String>,

        /// Restrict to these fiscal years
        #[arg(long, value_delimiter = ',')]
        years: Vec<i64>,
    },

    /// Display the section tree of an ingested document
    Show {
        /// Document id (see `corpus`)
        doc_id: i64,

        /// Output as JSON instead of a formatted tree
        #[arg(long)]
        json: bool,
    },

    /// List ingested documents
    Corpus,

    /// Test LLM and embedding connectivity
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr } => cmd_serve(addr).await,
        Commands::Ingest {
            pdf,
            company,
            ticker,
            year,
            doc_type,
            force,
        } => cmd_ingest(pdf, company, ticker, year, doc_type, force).await,
        Commands::IngestDir { dir, force } => cmd_ingest_dir(dir, force).await,
        Commands::Query {
            query,
            companies,
            years,
        } => cmd_query(query, companies, years).await,
        Commands::Show { doc_id, json } => cmd_show(doc_id, json),
        Commands::Corpus => cmd_corpus(),
        Commands::Test => cmd_test().await,
    }
}

fn load_config() -> Result<Config> {
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn cmd_serve(addr: String) -> Result<()> {
    let config = load_config()?;
    let state = Arc::new(AppState::from_config(config).context("Failed to initialize")?);
    server::serve(state, &addr).await
}

fn build_ingest(config: &Config) -> Result<IngestOrchestrator> {
    let store = Arc::new(Store::open(&config.storage.database_path)?);
    Ok(IngestOrchestrator::new(
        config.clone(),
        store,
        LlmClient::new(config.llm.clone()),
        EmbeddingClient::new(config.embedding.clone()),
        Tokenizer::new()?,
    ))
}

async fn cmd_ingest(
    pdf: PathBuf,
    company: String,
    ticker: String,
    year: i64,
    doc_type: String,
    force: bool,
) -> Result<()> {
    let config = load_config()?;
    let orchestrator = build_ingest(&config)?;

    let filename = pdf
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("upload.pdf")
        .to_string();

    println!("Ingesting {} ({} {} {})", filename, ticker, year, doc_type);
    println!("Using model: {}", config.llm.model);

    let start = Instant::now();
    let outcome = orchestrator
        .ingest_pdf(
            &pdf,
            &IngestRequest {
                company,
                ticker,
                fiscal_year: year,
                doc_type,
                filename,
                force,
            },
        )
        .await
        .context("Ingest failed")?;

    println!("\nIngest complete:");
    println!("  Document id: {}", outcome.doc_id);
    println!("  Pages:       {}", outcome.page_count);
    println!("  Sections:    {}", outcome.node_count);
    println!("  Chunks:      {}", outcome.chunks_created);
    println!("  Time:        {:.2?}", start.elapsed());

    Ok(())
}

async fn cmd_ingest_dir(dir: PathBuf, force: bool) -> Result<()> {
    let config = load_config()?;
    let orchestrator = build_ingest(&config)?;

    let mut ingested = 0usize;
    let mut skipped = 0usize;

    for entry in walkdir::WalkDir::new(&dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("pdf") {
            continue;
        }

        let Some(request) = request_from_filename(path, force) else {
            println!("Skipping {} (filename not TICKER_TYPE_YEAR.pdf)", path.display());
            skipped += 1;
            continue;
        };

        println!(
            "Ingesting {} as {} {} {}",
            path.display(),
            request.ticker,
            request.fiscal_year,
            request.doc_type
        );
        match orchestrator.ingest_pdf(path, &request).await {
            Ok(outcome) => {
                println!(
                    "  ok: doc {} ({} sections, {} chunks)",
                    outcome.doc_id, outcome.node_count, outcome.chunks_created
                );
                ingested += 1;
            }
            Err(e) => {
                println!("  failed: {}", e);
                skipped += 1;
            }
        }
    }

    println!("\n{} ingested, {} skipped", ingested, skipped);
    Ok(())
}

/// Parse `TICKER_TYPE_YEAR.pdf` (e.g. `INFY_20F_2022.pdf`) into a request.
fn request_from_filename(path: &Path, force: bool) -> Option<IngestRequest> {
    let stem = path.file_stem()?.to_str()?;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() != 3 {
        return None;
    }

    let ticker = parts[0].to_uppercase();
    let doc_type = match parts[1].to_uppercase().as_str() {
        "20F" => "20-F".to_string(),
        "10K" => "10-K".to_string(),
        "10Q" => "10-Q".to_string(),
        other => other.to_string(),
    };
    let fiscal_year: i64 = parts[2].parse().ok()?;

    Some(IngestRequest {
        company: ticker.clone(),
        ticker,
        fiscal_year,
        doc_type,
        filename: path.file_name()?.to_str()?.to_string(),
        force,
    })
}

async fn cmd_query(query: String, companies: Vec<String>, years: Vec<i64>) -> Result<()> {
    let config = load_config()?;
    let store = Arc::new(Store::open(&config.storage.database_path)?);
    let llm = LlmClient::new(config.llm.clone());

    let orchestrator = RetrievalOrchestrator::new(
        Arc::clone(&store),
        llm.clone(),
        EmbeddingClient::new(config.embedding.clone()),
        Tokenizer::new()?,
        config.retrieval.clone(),
    );

    println!("Query: \"{}\"", query);
    println!("Using model: {}", config.llm.model);
    println!();

    let start = Instant::now();
    let outcome = orchestrator
        .retrieve(&query, &companies, &years)
        .await
        .context("Retrieval failed")?;

    let generator = AnswerGenerator::new(llm);
    let answer = generator
        .generate(&query, &outcome.context, &outcome.sub_questions)
        .await
        .context("Answer generation failed")?;

    println!("{}", answer.answer);
    println!("{}", "-".repeat(60));
    println!(
        "Confidence: {:?} ({} of {} sub-questions answered, {} source sections)",
        answer.retrieval_confidence.label,
        answer.retrieval_confidence.answered_by_facts,
        outcome.sub_questions.len(),
        answer.retrieval_confidence.answered_by_chunks
    );

    if !answer.resolved_citations.is_empty() {
        println!("\nSources:");
        for citation in &answer.resolved_citations {
            println!(
                "  [{} {} p{}] {}",
                citation.ticker, citation.fiscal_year, citation.page, citation.section_path
            );
        }
    }

    if !answer.unanswerable_sub_questions.is_empty() {
        println!("\nUnanswerable:");
        for question in &answer.unanswerable_sub_questions {
            println!("  - {}", question);
        }
    }

    if !answer.conflicts_detected.is_empty() {
        println!("\nConflicts:");
        for conflict in &answer.conflicts_detected {
            println!("  - {}", conflict);
        }
    }

    println!("\nAnswered in {:.2?}", start.elapsed());
    Ok(())
}

fn cmd_show(doc_id: i64, json: bool) -> Result<()> {
    let config = load_config()?;
    let store = Store::open(&config.storage.database_path)?;

    let stored = store
        .load_tree(doc_id)?
        .with_context(|| format!("No tree stored for document {}", doc_id))?;

    if json {
        println!("{}", stored.tree.to_json()?);
    } else {
        println!("{}", stored.tree.format());
    }

    Ok(())
}

fn cmd_corpus() -> Result<()> {
    let config = load_config()?;
    let store = Store::open(&config.storage.database_path)?;

    let documents = store.list_documents().context("Failed to list corpus")?;
    if documents.is_empty() {
        println!("No documents ingested yet.");
        return Ok(());
    }

    println!(
        "{:>4}  {:<8} {:<6} {:<8} {:>6} {:>7} {:>7}  {}",
        "id", "ticker", "year", "type", "pages", "nodes", "chunks", "status"
    );
    println!("{}", "-".repeat(66));
    for d in &documents {
        println!(
            "{:>4}  {:<8} {:<6} {:<8} {:>6} {:>7} {:>7}  {}",
            d.id,
            d.ticker,
            d.fiscal_year,
            d.doc_type,
            d.page_count,
            d.node_count,
            d.chunk_count,
            d.status.as_str()
        );
    }

    Ok(())
}

async fn cmd_test() -> Result<()> {
    println!("Testing connectivity...\n");

    let config = load_config()?;

    println!("Configuration:");
    println!("  LLM base:       {}", config.llm.base_url);
    println!("  LLM model:      {}", config.llm.model);
    println!("  Embedding URL:  {}", config.embedding.url);
    println!("  Embedding model: {}", config.embedding.model);
    println!();

    let llm = LlmClient::new(config.llm.clone());
    print!("LLM: ");
    match llm.test_connection().await {
        Ok(()) => println!("ok"),
        Err(e) => println!("failed ({})", e),
    }

    let embedder = EmbeddingClient::new(config.embedding.clone());
    print!("Embedding: ");
    match embedder.test_connection().await {
        Ok(dim) => {
            if dim == config.embedding.dim {
                println!("ok ({} dims)", dim);
            } else {
                println!(
                    "dimension mismatch: service returns {}, config says {}",
                    dim, config.embedding.dim
                );
            }
        }
        Err(e) => println!("failed ({})", e),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_filename() {
        let req = request_from_filename(Path::new("/tmp/INFY_20F_2022.pdf"), false).unwrap();
        assert_eq!(req.ticker, "INFY");
        assert_eq!(req.doc_type, "20-F");
        assert_eq!(req.fiscal_year, 2022);
        assert_eq!(req.filename, "INFY_20F_2022.pdf");

        assert!(request_from_filename(Path::new("/tmp/notes.pdf"), false).is_none());
        assert!(request_from_filename(Path::new("/tmp/A_B_year.pdf"), false).is_none());
    }
}
