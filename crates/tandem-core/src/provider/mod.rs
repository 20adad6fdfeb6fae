//! LLM providers
//!
//! A provider turns a chat request into a stream of text deltas. Runs pick a
//! provider through a [`ProviderFactory`] so tests can script the model.

pub mod openai;
pub mod retry;
#[cfg(test)]
pub(crate) mod scripted;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;

pub use openai::{OpenAiFactory, OpenAiProvider};
pub use retry::{is_retryable_status, with_retry, IsRetryable, RetryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Provider misconfigured: {0}")]
    Config(String),
}

impl IsRetryable for ProviderError {
    fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_) => true,
            ProviderError::Http { status, .. } => is_retryable_status(*status),
            ProviderError::Stream(_) | ProviderError::Config(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ProviderError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            },
            None => ProviderError::Network(e.to_string()),
        }
    }
}

/// Text deltas of one model response
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Open a streaming completion
    ///
    /// Errors returned here happen before any text was produced and may be
    /// retried. Errors inside the stream end the turn.
    async fn stream(&self, request: ChatRequest) -> Result<TextStream, ProviderError>;
}

/// Builds the provider for one run from its config
pub trait ProviderFactory: Send + Sync {
    fn create(&self, config: &RunConfig) -> Result<Arc<dyn LlmProvider>, ProviderError>;
}
