//! Answer generation with per-claim citations and confidence labelling.
//!
//! The generator never re-ranks context: blocks arrive in merged
//! retrieval order and are rendered as-is. The model answers from the
//! context alone, cites inline, and concludes with a structured citation
//! block that is parsed, verified against the context, and resolved into
//! section paths and previews.

use crate::error::{IndexError, Result};
use crate::llm::{LlmClient, Prompts, extract_json};
use crate::retrieval::{ContextBlock, SubQuestion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// Attempts to get a parseable citation block before the query fails.
const ANSWER_ATTEMPTS: usize = 3;

/// Characters of node text kept as a citation preview.
const PREVIEW_CHARS: usize = 200;

/// Coarse retrieval-quality label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceLabel {
    High,
    Medium,
    Low,
}

/// Retrieval-quality assessment attached to every answer.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalConfidence {
    pub label: ConfidenceLabel,
    /// Sub-questions with at least one cited claim.
    pub answered_by_facts: usize,
    /// Distinct source nodes cited across the answer.
    pub answered_by_chunks: usize,
    /// Sub-questions without any cited claim.
    pub unanswered: usize,
}

/// A citation resolved against the retrieval context.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedCitation {
    pub company: String,
    pub ticker: String,
    pub fiscal_year: i64,
    pub node_id: String,
    pub section_path: String,
    pub page: usize,
    pub content_preview: String,
}

/// The final answer payload.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub retrieval_confidence: RetrievalConfidence,
    pub resolved_citations: Vec<ResolvedCitation>,
    pub unanswerable_sub_questions: Vec<String>,
    pub conflicts_detected: Vec<String>,
}

/// Raw citation as emitted by the model.
#[derive(Debug, Deserialize)]
struct RawCitation {
    #[serde(default)]
    #[allow(dead_code)]
    company: Option<String>,
    #[serde(default)]
    ticker: Option<String>,
    #[serde(default)]
    fiscal_year: Option<i64>,
    node_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    start_page: Option<usize>,
    #[serde(default)]
    #[allow(dead_code)]
    end_page: Option<usize>,
    #[serde(default)]
    sub_question: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CitationBlock {
    #[serde(default)]
    citations: Vec<RawCitation>,
    #[serde(default)]
    unanswerable_sub_questions: Vec<usize>,
    #[serde(default)]
    conflicts_detected: Vec<String>,
}

/// Generates cited answers from retrieval context.
pub struct AnswerGenerator {
    client: LlmClient,
}

impl AnswerGenerator {
    /// Create a new answer generator.
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    /// Generate the final answer for a query.
    ///
    /// An empty context short-circuits to a LOW-confidence "insufficient
    /// context" answer rather than an error.
    pub async fn generate(
        &self,
        query: &str,
        context: &[ContextBlock],
        sub_questions: &[SubQuestion],
    ) -> Result<Answer> {
        if context.is_empty() {
            return Ok(insufficient_context(sub_questions));
        }

        let prompt = Prompts::generate_answer()
            .replace("{query}", query)
            .replace("{sub_questions}", &render_sub_questions(sub_questions))
            .replace("{context}", &render_context(context));

        let mut last_err = String::new();
        for attempt in 1..=ANSWER_ATTEMPTS {
            let response = self
                .client
                .complete(Some(Prompts::system_document_analyzer()), &prompt)
                .await?;

            match split_answer(&response) {
                Ok((prose, block)) => {
                    return Ok(assemble(prose, block, context, sub_questions));
                }
                Err(e) => {
                    warn!(attempt, "answer citation block did not parse: {}", e);
                    last_err = e.to_string();
                }
            }
        }

        Err(IndexError::LlmShape(format!(
            "answer generation produced no parseable citation block after {} attempts: {}",
            ANSWER_ATTEMPTS, last_err
        )))
    }
}

/// Decide the confidence label from sub-question coverage and source breadth.
pub fn label_confidence(answered: usize, total: usize, distinct_nodes: usize) -> ConfidenceLabel {
    if total > 0 && answered == total && distinct_nodes >= 3 {
        ConfidenceLabel::High
    } else if answered * 2 > total && distinct_nodes >= 1 {
        ConfidenceLabel::Medium
    } else {
        ConfidenceLabel::Low
    }
}

fn insufficient_context(sub_questions: &[SubQuestion]) -> Answer {
    Answer {
        answer: "Insufficient context: no relevant sections were retrieved for this question."
            .to_string(),
        retrieval_confidence: RetrievalConfidence {
            label: ConfidenceLabel::Low,
            answered_by_facts: 0,
            answered_by_chunks: 0,
            unanswered: sub_questions.len(),
        },
        resolved_citations: Vec::new(),
        unanswerable_sub_questions: sub_questions.iter().map(|s| s.question.clone()).collect(),
        conflicts_detected: Vec::new(),
    }
}

fn render_sub_questions(sub_questions: &[SubQuestion]) -> String {
    sub_questions
        .iter()
        .enumerate()
        .map(|(i, sq)| format!("{}. {}", i, sq.question))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_context(context: &[ContextBlock]) -> String {
    context
        .iter()
        .map(|block| {
            format!(
                "--- {} ({}) {} | node {} | \"{}\" | pages {}-{} ---\n{}",
                block.company,
                block.ticker,
                block.fiscal_year,
                block.node_id,
                block.title,
                block.start_page,
                block.end_page,
                block.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Split the model output into the prose answer and the trailing JSON
/// citation block.
fn split_answer(response: &str) -> std::result::Result<(String, CitationBlock), serde_json::Error> {
    let (prose, tail) = match response.rfind("```json") {
        Some(pos) => (&response[..pos], &response[pos..]),
        None => match response.rfind("\n{") {
            Some(pos) => (&response[..pos], &response[pos..]),
            None => ("", response),
        },
    };

    let block: CitationBlock = serde_json::from_str(&extract_json(tail))?;
    Ok((prose.trim().to_string(), block))
}

/// Verify citations against the context, resolve them, and compute
/// confidence.
fn assemble(
    prose: String,
    block: CitationBlock,
    context: &[ContextBlock],
    sub_questions: &[SubQuestion],
) -> Answer {
    let mut resolved = Vec::new();
    let mut cited_nodes: BTreeSet<(String, i64, String)> = BTreeSet::new();
    let mut answered: BTreeSet<usize> = BTreeSet::new();

    for citation in &block.citations {
        let matched = context.iter().find(|b| {
            b.node_id == citation.node_id
                && citation
                    .ticker
                    .as_ref()
                    .map(|t| b.ticker.eq_ignore_ascii_case(t))
                    .unwrap_or(true)
                && citation
                    .fiscal_year
                    .map(|y| b.fiscal_year == y)
                    .unwrap_or(true)
        });

        let Some(found) = matched else {
            warn!(
                "dropping citation of node '{}' that is not in the context",
                citation.node_id
            );
            continue;
        };

        if let Some(index) = citation.sub_question {
            if index < sub_questions.len() {
                answered.insert(index);
            }
        }

        cited_nodes.insert((
            found.ticker.clone(),
            found.fiscal_year,
            found.node_id.clone(),
        ));
        resolved.push(ResolvedCitation {
            company: found.company.clone(),
            ticker: found.ticker.clone(),
            fiscal_year: found.fiscal_year,
            node_id: found.node_id.clone(),
            section_path: found.path.clone(),
            page: found.start_page,
            content_preview: found.text.chars().take(PREVIEW_CHARS).collect(),
        });
    }

    let total = sub_questions.len();
    let answered_count = answered.len();
    let distinct_nodes = cited_nodes.len();

    // Sub-questions the model flagged, plus any left without a citation.
    let mut unanswerable: BTreeSet<usize> = block
        .unanswerable_sub_questions
        .into_iter()
        .filter(|i| *i < total)
        .collect();
    for index in 0..total {
        if !answered.contains(&index) {
            unanswerable.insert(index);
        }
    }

    Answer {
        answer: if prose.is_empty() {
            "No answer text was produced.".to_string()
        } else {
            prose
        },
        retrieval_confidence: RetrievalConfidence {
            label: label_confidence(answered_count, total, distinct_nodes),
            answered_by_facts: answered_count,
            answered_by_chunks: distinct_nodes,
            unanswered: total.saturating_sub(answered_count),
        },
        resolved_citations: resolved,
        unanswerable_sub_questions: unanswerable
            .into_iter()
            .map(|i| sub_questions[i].question.clone())
            .collect(),
        conflicts_detected: block.conflicts_detected,
    }
}
