//! OpenAI-compatible LLM client.
//!
//! Works with any OpenAI-compatible chat-completion endpoint. Transient
//! failures (network, 5xx, deadline expiry) are retried with exponential
//! backoff; rate limits are retried with jitter; non-retryable request
//! errors surface immediately. All responses are untrusted strings until
//! parsed against a declared shape.

use crate::config::LlmConfig;
use crate::error::{IndexError, Result};
use rand::Rng;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Message role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Request body for chat completion.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

/// Response from chat completion.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// OpenAI API error response.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Maximum attempts to parse a response into a declared JSON shape.
const SHAPE_ATTEMPTS: usize = 3;

/// OpenAI-compatible LLM client with bounded retries.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
}

impl LlmClient {
    /// Create a new LLM client with the given configuration.
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Get the API endpoint URL.
    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        format!("{}/v1/chat/completions", base)
    }

    /// Send a chat completion request, retrying transient failures.
    pub async fn chat(&self, messages: &[Message]) -> Result<String> {
        let mut last_err = IndexError::LlmApi("no attempts made".to_string());

        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            match self.chat_once(messages).await {
                Ok(content) => return Ok(content),
                Err(err) if err.is_transient() => {
                    warn!(
                        attempt,
                        retries = self.config.retries,
                        "LLM call failed, will retry: {}",
                        err
                    );
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err)
    }

    /// One request attempt under the configured deadline.
    async fn chat_once(&self, messages: &[Message]) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
        };

        let deadline = Duration::from_secs(self.config.timeout_secs);
        let send = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send();

        let response = tokio::time::timeout(deadline, send)
            .await
            .map_err(|_| IndexError::LlmApi("deadline exceeded".to_string()))?
            .map_err(|e| IndexError::LlmApi(e.to_string()))?;

        let status = response.status();
        let body = tokio::time::timeout(deadline, response.text())
            .await
            .map_err(|_| IndexError::LlmApi("deadline exceeded reading body".to_string()))?
            .map_err(|e| IndexError::LlmApi(e.to_string()))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);

            return Err(match status.as_u16() {
                429 => IndexError::LlmCapacity(format!("rate limited: {}", detail)),
                500..=599 => IndexError::LlmApi(format!("server error ({}): {}", status, detail)),
                _ => IndexError::Validation(format!("LLM request rejected ({}): {}", status, detail)),
            });
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| IndexError::LlmApi(format!("malformed completion response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| IndexError::LlmApi("no choices in response".to_string()))
    }

    /// Convenience method: single user message with optional system prompt.
    pub async fn complete(&self, system: Option<&str>, user: &str) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(Message::system(sys));
        }
        messages.push(Message::user(user));

        self.chat(&messages).await
    }

    /// Complete and parse the response against a declared JSON shape.
    ///
    /// Retries the full round trip up to [`SHAPE_ATTEMPTS`] times when the
    /// response does not parse; a persistent mismatch surfaces as
    /// [`IndexError::LlmShape`] and the caller decides whether to degrade.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        system: Option<&str>,
        user: &str,
    ) -> Result<T> {
        let mut last_err = String::new();

        for attempt in 1..=SHAPE_ATTEMPTS {
            let response = self.complete(system, user).await?;
            let json_str = extract_json(&response);

            match serde_json::from_str::<T>(&json_str) {
                Ok(parsed) => return Ok(parsed),
                Err(e) => {
                    let head: String = response.chars().take(120).collect();
                    warn!(
                        attempt,
                        "LLM response did not match required shape: {} (head: {})", e, head
                    );
                    last_err = e.to_string();
                }
            }
        }

        Err(IndexError::LlmShape(format!(
            "response did not match shape after {} attempts: {}",
            SHAPE_ATTEMPTS, last_err
        )))
    }

    /// Test connectivity to the API.
    pub async fn test_connection(&self) -> Result<()> {
        let response = self
            .complete(None, "Say 'hello' and nothing else.")
            .await?;

        if response.to_lowercase().contains("hello") {
            Ok(())
        } else {
            Err(IndexError::LlmApi(format!(
                "Unexpected response: {}",
                response
            )))
        }
    }
}

/// Exponential backoff with jitter, capped at 30 seconds.
fn backoff_delay(attempt: usize) -> Duration {
    let base_ms = 500u64.saturating_mul(1u64 << attempt.min(6) as u32);
    let jitter_ms = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(base_ms.min(30_000) + jitter_ms)
}

/// Extract JSON from a potentially markdown-wrapped response.
pub fn extract_json(response: &str) -> String {
    let response = response.trim();

    // Check for ```json code block
    if response.starts_with("```json") {
        if let Some(end) = response.rfind("```") {
            let start = "```json".len();
            if end > start {
                return response[start..end].trim().to_string();
            }
        }
    }

    // Check for ``` code block
    if response.starts_with("```") {
        if let Some(end) = response.rfind("```") {
            let start = response.find('\n').map(|n| n + 1).unwrap_or(3);
            if end > start {
                return response[start..end].trim().to_string();
            }
        }
    }

    // Find JSON object or array
    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            if end > start {
                return response[start..=end].to_string();
            }
        }
    }

    if let Some(start) = response.find('[') {
        if let Some(end) = response.rfind(']') {
            if end > start {
                return response[start..=end].to_string();
            }
        }
    }

    response.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let sys = Message::system("You are helpful.");
        let user = Message::user("Hello!");

        assert!(matches!(sys.role, Role::System));
        assert!(matches!(user.role, Role::User));
    }

    #[test]
    fn test_endpoint_construction() {
        let config = LlmConfig {
            base_url: "https://api.example.com/".to_string(),
            api_key: "test".to_string(),
            model: "gpt-4o".to_string(),
            ..Default::default()
        };
        let client = LlmClient::new(config);
        assert_eq!(
            client.endpoint(),
            "https://api.example.com/v1/chat/completions"
        );

        // Without trailing slash
        let config2 = LlmConfig {
            base_url: "https://api.example.com".to_string(),
            api_key: "test".to_string(),
            model: "gpt-4o".to_string(),
            ..Default::default()
        };
        let client2 = LlmClient::new(config2);
        assert_eq!(
            client2.endpoint(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_extract_json_plain() {
        let response = r#"[{"title": "Test"}]"#;
        assert_eq!(extract_json(response), r#"[{"title": "Test"}]"#);
    }

    #[test]
    fn test_extract_json_markdown() {
        let response = "```json\n[{\"title\": \"Test\"}]\n```";
        assert_eq!(extract_json(response), r#"[{"title": "Test"}]"#);
    }

    #[test]
    fn test_extract_json_with_text() {
        let response = "Here's the structure:\n{\"node_list\": []}\nThat's the result.";
        assert_eq!(extract_json(response), r#"{"node_list": []}"#);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert!(backoff_delay(1) >= Duration::from_millis(1000));
        assert!(backoff_delay(2) >= Duration::from_millis(2000));
        assert!(backoff_delay(20) <= Duration::from_millis(30_250));
    }
}
