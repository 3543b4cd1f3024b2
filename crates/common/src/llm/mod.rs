//! Chat-completion client abstraction
//!
//! The writer and the facts extractor only need "system + user in, text out",
//! so providers sit behind [`LlmClient`].

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One completion call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>, temperature: f32) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Trait for chat completion providers
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion and return the assistant text
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// OpenAI-compatible chat completions client
pub struct OpenAiChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl OpenAiChatClient {
    /// Create a new chat client
    pub fn new(api_key: String, config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model.clone(),
        })
    }

    async fn call(&self, request: &CompletionRequest) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::LlmError {
                message: format!("LLM API request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::LlmError {
                message: format!("LLM API error {}: {}", status, body),
            });
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| AppError::LlmError {
            message: format!("Failed to parse LLM response: {}", e),
        })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::LlmError {
                message: "Empty response from LLM".to_string(),
            })
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let started = Instant::now();
        let result = self.call(&request).await;
        metrics::record_llm(started.elapsed().as_secs_f64(), &self.model, result.is_ok());

        if let Err(ref e) = result {
            tracing::warn!(model = %self.model, error = %e, "LLM completion failed");
        }
        result
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Scripted client for tests and offline runs.
///
/// Replies with a fixed text (or fails) and records every request it saw.
pub struct MockLlmClient {
    reply: std::result::Result<String, String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmClient {
    /// Always answer with `text`
    pub fn replying(text: impl Into<String>) -> Self {
        Self {
            reply: Ok(text.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always fail with an upstream error
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            reply: Err(message.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::replying("Draft pending review.")
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        if let Ok(mut seen) = self.requests.lock() {
            seen.push(request);
        }
        self.reply.clone().map_err(|message| AppError::LlmError { message })
    }

    fn model_name(&self) -> &str {
        "mock-llm"
    }
}

/// Create an LLM client based on configuration
pub fn create_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "llm.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAiChatClient::new(key, config)?))
        }
        "mock" => Ok(Arc::new(MockLlmClient::default())),
        other => Err(AppError::Configuration {
            message: format!("Unknown LLM provider: {}", other),
        }),
    }
}
