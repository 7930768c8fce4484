// Completion module
// Client for an OpenAI-compatible chat-completions endpoint


use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::CompletionConfig;
use crate::http::{JsonService, RetryPolicy};
use crate::{RagError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[inline]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[inline]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[inline]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Text generation seam used for answers and query rewriting
pub trait CompletionBackend: Send + Sync {
    fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionClient {
    service: JsonService,
    endpoint: Url,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl CompletionClient {
    #[inline]
    pub fn new(config: &CompletionConfig, retry: RetryPolicy) -> Result<Self> {
        let endpoint = config
            .chat_completions_url()
            .map_err(|e| RagError::Config(e.to_string()))?;

        Ok(Self {
            service: JsonService::new(
                Duration::from_secs(config.timeout_secs),
                config.api_key.clone(),
                retry,
            ),
            endpoint,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.service = self.service.with_timeout(timeout);
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl CompletionBackend for CompletionClient {
    #[inline]
    fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let body = serde_json::to_string(&request)?;

        debug!(
            "Requesting completion from {} with {} messages",
            self.model,
            messages.len()
        );
        let response_text = self.service.post_json(&self.endpoint, &body)?;
        let response: CompletionResponse = serde_json::from_str(&response_text)?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| RagError::InvalidRequest("completion returned no content".to_string()))
    }
}
