//! HTTP embedding client.
//!
//! Calls an embedding service speaking the `POST /api/embed` protocol:
//! `{model, input: [string, ...]}` in, `{embeddings: [[f32, ...], ...]}` out.
//! The output dimension is fixed at configuration time; a mismatch is fatal
//! rather than retryable.

use crate::config::EmbeddingConfig;
use crate::error::{IndexError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Retries per batch before the batch error surfaces.
const BATCH_ATTEMPTS: usize = 3;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for a fixed-dimension embedding service.
#[derive(Clone)]
pub struct EmbeddingClient {
    client: Client,
    config: EmbeddingConfig,
}

impl EmbeddingClient {
    /// Create a new embedding client with the given configuration.
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embed", self.config.url.trim_end_matches('/'))
    }

    /// Embed a batch of texts. An empty batch returns an empty result
    /// without a remote call.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut last_err = IndexError::Embedding("no attempts made".to_string());

        for attempt in 1..=BATCH_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(Duration::from_millis(500 * (1 << attempt))).await;
            }

            match self.embed_once(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(err @ IndexError::EmbeddingDim { .. }) => return Err(err),
                Err(err) => {
                    warn!(attempt, "embedding batch failed, will retry: {}", err);
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let batch = vec![text.to_string()];
        let mut vectors = self.embed_batch(&batch).await?;
        vectors
            .pop()
            .ok_or_else(|| IndexError::Embedding("service returned no vectors".to_string()))
    }

    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            model: &self.config.model,
            input: texts,
        };

        let deadline = Duration::from_secs(self.config.timeout_secs);
        let send = self.client.post(self.endpoint()).json(&request).send();

        let response = tokio::time::timeout(deadline, send)
            .await
            .map_err(|_| IndexError::Embedding("deadline exceeded".to_string()))?
            .map_err(|e| IndexError::Embedding(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::Embedding(format!(
                "service returned {}: {}",
                status, body
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| IndexError::Embedding(format!("malformed response: {}", e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(IndexError::Embedding(format!(
                "service returned {} vectors for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }

        for vector in &parsed.embeddings {
            if vector.len() != self.config.dim {
                return Err(IndexError::EmbeddingDim {
                    expected: self.config.dim,
                    actual: vector.len(),
                });
            }
        }

        Ok(parsed.embeddings)
    }

    /// Check if the embedding service is reachable and the model works.
    pub async fn test_connection(&self) -> Result<usize> {
        let vector = self.embed_one("test connection").await?;
        Ok(vector.len())
    }
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_endpoint_construction() {
        let config = EmbeddingConfig {
            url: "http://localhost:11434/".to_string(),
            ..Default::default()
        };
        let client = EmbeddingClient::new(config);
        assert_eq!(client.endpoint(), "http://localhost:11434/api/embed");
    }

    #[tokio::test]
    async fn test_empty_batch_returns_empty() {
        let client = EmbeddingClient::new(EmbeddingConfig::default());
        let vectors = client.embed_batch(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
