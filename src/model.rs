//! Chat-completion model adapter.
//!
//! The code generation feedback loop and the optional answer formatter talk
//! to a code-generating language model through the [`ChatModel`] trait.
//! The remote backend targets an OpenAI-compatible `/v1/chat/completions`
//! endpoint with the same retry discipline as the embedding client:
//! 429/5xx/network errors are retried with exponential backoff, other 4xx
//! fail immediately.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::ModelConfig;

/// Interface to a chat-completion model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier for logging/auditing.
    fn model_name(&self) -> &str;

    /// Run one completion with a system prompt and a user message, returning
    /// the assistant text.
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Instantiate the backend named by the configuration.
pub fn create_model(config: &ModelConfig) -> Result<Box<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledModel)),
        "openai" => Ok(Box::new(RemoteChatModel::new(config)?)),
        other => bail!("Unknown model provider: {}", other),
    }
}

/// A no-op backend that always errors; used when no model is configured.
pub struct DisabledModel;

#[async_trait]
impl ChatModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
        bail!("Chat model provider is disabled")
    }
}

/// Chat backend for an OpenAI-compatible completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct RemoteChatModel {
    model: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl RemoteChatModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("model.model required for openai provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        Ok(Self {
            model,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl ChatModel for RemoteChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": 0.0,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
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
                        let json: serde_json::Value = response.json().await?;
                        return parse_completion_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("Chat API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Chat API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Completion failed after retries")))
    }
}

/// Extract `choices[0].message.content` from a chat completions response.
fn parse_completion_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid chat response: missing choices[0].message.content"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_completion_content() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "return 1"}}]
        });
        assert_eq!(parse_completion_response(&json).unwrap(), "return 1");
    }

    #[test]
    fn missing_content_is_error() {
        let json = serde_json::json!({"choices": []});
        assert!(parse_completion_response(&json).is_err());
    }

    #[tokio::test]
    async fn disabled_model_errors() {
        let m = DisabledModel;
        assert!(m.complete("s", "u").await.is_err());
    }
}
