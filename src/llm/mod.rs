//! Generative-text client.
//!
//! `LlmClient` is a stateless one-shot call: a model name, temperature,
//! token budget and prompt go in, a completion comes out. Executors receive
//! the client as an argument and never hold on to it.

mod anthropic;
mod stub;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use anthropic::AnthropicClient;
pub use stub::StubClient;

use crate::errors::LlmError;
use crate::phase::LlmParams;

/// Shape the caller expects back. Providers may use it as a hint; the stub
/// client relies on it to produce output that passes validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Markdown,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system: String,
    pub prompt: String,
    pub format: ResponseFormat,
}

impl CompletionRequest {
    pub fn new(params: &LlmParams, system: &str, prompt: String, format: ResponseFormat) -> Self {
        Self {
            model: params.model.clone(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            system: system.to_string(),
            prompt,
            format,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name for logs.
    fn provider(&self) -> &'static str;

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;
}

/// Which provider backs the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Anthropic,
    /// Offline deterministic output; no network access.
    Stub,
}

impl std::str::FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(Self::Anthropic),
            "stub" => Ok(Self::Stub),
            _ => Err(format!("Unknown LLM provider '{}' (expected anthropic or stub)", s)),
        }
    }
}

#[derive(Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Build the configured client.
pub fn from_config(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    match config.provider {
        LlmProvider::Anthropic => {
            let api_key = config.api_key.clone().ok_or_else(|| {
                LlmError::Misconfiguration("ANTHROPIC_API_KEY is not set".to_string())
            })?;
            let client = AnthropicClient::new(api_key, config.base_url.clone(), config.timeout)?;
            Ok(Arc::new(client))
        }
        LlmProvider::Stub => Ok(Arc::new(StubClient)),
    }
}
