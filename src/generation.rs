//! Generation service client: the opaque text-completion collaborator.
//!
//! [`GenerationClient`] is the seam used for both reference resolution
//! (short, temperature-0 call) and final answer synthesis. The OpenAI
//! implementation retries 429/5xx with exponential backoff and fails
//! immediately on other client errors. Timeouts live here, not in the
//! pipeline; callers fall back to their documented degraded paths.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};
use crate::models::Role;

/// One message in a generation request.
#[derive(Debug, Clone)]
pub struct GenerationMessage {
    pub role: Role,
    pub content: String,
}

/// A text-completion request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub messages: Vec<GenerationMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Completion text plus the provider's authoritative token count.
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub tokens_used: u64,
}

/// Opaque text-completion service.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn complete(&self, request: &GenerationRequest) -> Result<GenerationResponse>;
}

/// Generation client for the OpenAI chat completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIGenerationClient {
    config: GenerationConfig,
    client: reqwest::Client,
}

impl OpenAIGenerationClient {
    pub fn new(config: GenerationConfig) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(Error::Config(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn build_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.system,
        })];
        for m in &request.messages {
            messages.push(serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            }));
        }

        serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }
}

#[async_trait]
impl GenerationClient for OpenAIGenerationClient {
    async fn complete(&self, request: &GenerationRequest) -> Result<GenerationResponse> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY not set".to_string()))?;

        let body = self.build_body(request);
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| Error::GenerationFailed(e.to_string()))?;
                        let parsed = parse_completion_response(&json)?;
                        debug!(
                            tokens = parsed.tokens_used,
                            "generation call completed on attempt {}", attempt
                        );
                        return Ok(parsed);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(Error::GenerationFailed(format!(
                            "API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(Error::GenerationFailed(format!(
                        "API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(Error::GenerationFailed(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::GenerationFailed("exhausted retries".to_string())))
    }
}

/// Parse a chat completions response into text plus token usage.
fn parse_completion_response(json: &serde_json::Value) -> Result<GenerationResponse> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::GenerationFailed("response missing message content".to_string()))?
        .to_string();

    let tokens_used = json
        .pointer("/usage/total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    Ok(GenerationResponse { text, tokens_used })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_response() {
        let json = serde_json::json!({
            "choices": [
                { "message": { "role": "assistant", "content": "Paris." } }
            ],
            "usage": { "prompt_tokens": 40, "completion_tokens": 3, "total_tokens": 43 }
        });
        let parsed = parse_completion_response(&json).unwrap();
        assert_eq!(parsed.text, "Paris.");
        assert_eq!(parsed.tokens_used, 43);
    }

    #[test]
    fn test_parse_missing_content_is_error() {
        let json = serde_json::json!({ "choices": [] });
        assert!(parse_completion_response(&json).is_err());
    }

    #[test]
    fn test_parse_missing_usage_defaults_to_zero() {
        let json = serde_json::json!({
            "choices": [ { "message": { "content": "ok" } } ]
        });
        let parsed = parse_completion_response(&json).unwrap();
        assert_eq!(parsed.tokens_used, 0);
    }
}
