//! Language model clients.
//!
//! One adapter per provider, each normalizing its wire format into a
//! [`Completion`]. Adapters do not retry; failures surface as
//! [`RagError::Dependency`] naming the language model.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{RagError, Result};
use crate::models::Usage;

/// A single model response.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
    pub model: String,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<Completion>;
}

/// Used when `llm.provider = "disabled"`; every call fails.
pub struct DisabledClient;

#[async_trait]
impl LlmClient for DisabledClient {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str, _max_tokens: u32, _temperature: f32) -> Result<Completion> {
        Err(RagError::llm(
            "no language model configured (set [llm] provider in the config)",
        ))
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RagError::llm(format!("failed to build HTTP client: {}", e)))
}

// ============ OpenAI ============

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Chat completions against the OpenAI API or any compatible gateway.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::input("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RagError::llm("OPENAI_API_KEY environment variable not set"))?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            http: http_client(config.timeout_secs)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<Completion> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens,
            temperature,
        };

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::llm(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::llm(format!("OpenAI error {}: {}", status, text)));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| RagError::llm(format!("invalid OpenAI response: {}", e)))?;
        chat_completion(body, &self.model)
    }
}

fn chat_completion(body: ChatResponse, requested_model: &str) -> Result<Completion> {
    let text = body
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| RagError::llm("OpenAI response contained no choices"))?;
    let usage = body
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(Completion {
        text: text.trim().to_string(),
        usage,
        model: body.model.unwrap_or_else(|| requested_model.to_string()),
    })
}

// ============ Ollama ============

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

/// Text generation against a local Ollama instance (`/api/generate`).
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::input("llm.model required for Ollama provider"))?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            http: http_client(config.timeout_secs)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, max_tokens: u32, temperature: f32) -> Result<Completion> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature,
                num_predict: max_tokens,
            },
        };

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                RagError::llm(format!(
                    "Ollama request failed (is Ollama running at {}?): {}",
                    self.base_url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RagError::llm(format!("Ollama error {}: {}", status, text)));
        }

        let result: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RagError::llm(format!("invalid Ollama response: {}", e)))?;

        Ok(Completion {
            text: result.response.trim().to_string(),
            usage: Usage {
                prompt_tokens: result.prompt_eval_count,
                completion_tokens: result.eval_count,
            },
            model: result.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

/// Create the [`LlmClient`] named by `llm.provider`.
pub fn create_llm_client(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledClient)),
        "openai" => Ok(Box::new(OpenAiClient::new(config)?)),
        "ollama" => Ok(Box::new(OllamaClient::new(config)?)),
        other => Err(RagError::input(format!("unknown llm provider: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_completion_parsing() {
        let body: ChatResponse = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": " 30 days. "}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 4, "total_tokens": 124}
        }))
        .unwrap();
        let completion = chat_completion(body, "gpt-4o-mini").unwrap();
        assert_eq!(completion.text, "30 days.");
        assert_eq!(completion.usage.total_tokens(), 124);
        assert_eq!(completion.model, "gpt-4o-mini-2024-07-18");
    }

    #[test]
    fn test_chat_completion_without_choices() {
        let body: ChatResponse = serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        let err = chat_completion(body, "m").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Dependency);
    }

    #[test]
    fn test_ollama_response_defaults() {
        let body: GenerateResponse =
            serde_json::from_value(serde_json::json!({"response": "hi", "done": true})).unwrap();
        assert_eq!(body.eval_count, 0);
        assert!(body.model.is_none());
    }

    #[tokio::test]
    async fn test_disabled_client_names_service() {
        let err = DisabledClient.complete("q", 10, 0.0).await.unwrap_err();
        assert!(err.to_string().starts_with("language model unavailable"));
    }

    #[test]
    fn test_create_requires_model() {
        let config = LlmConfig {
            provider: "ollama".into(),
            ..Default::default()
        };
        assert!(create_llm_client(&config).is_err());
        assert!(create_llm_client(&LlmConfig::default()).is_ok());
    }
}
