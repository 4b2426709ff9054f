//! Model Backend Traits
//!
//! Trait definitions for model backends. The dispatcher only ever sees an
//! `Arc<dyn ModelBackend>`: given a rendered prompt and per-backend options it
//! gets back a response with token usage, or a typed failure.
//!
//! # Design Philosophy
//!
//! Backends are opaque. They do not know about tasks, tiers or fallback;
//! timeouts are enforced by the dispatcher around `invoke`, and retries happen
//! by moving on to a different backend, never inside one.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::routing::config::BackendConfig;

/// Per-call generation options
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeOptions {
    /// Model identifier understood by the backend
    pub model: String,
    /// Maximum tokens in the response (0 = backend default)
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl InvokeOptions {
    /// Create options for a model with default sampling
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 0,
            temperature: 0.7,
        }
    }

    /// Options taken from a backend's static configuration
    #[must_use]
    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.name.clone())
            .with_max_tokens(config.max_tokens)
            .with_temperature(config.temperature)
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }
}

/// Successful backend output
#[derive(Clone, Debug, PartialEq)]
pub struct BackendResponse {
    /// Generated text
    pub text: String,
    /// Prompt plus completion tokens
    pub tokens_used: u64,
    /// Cost reported by the backend, if it reports one
    pub cost: Option<f64>,
}

impl BackendResponse {
    /// Create a response without a reported cost
    pub fn new(text: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            text: text.into(),
            tokens_used,
            cost: None,
        }
    }

    /// Attach a backend-reported cost
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Failure of a single backend call
#[derive(Clone, Debug, PartialEq, Error)]
pub enum BackendError {
    /// The call did not finish in time
    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend could not be reached
    #[error("connection failed: {0}")]
    Connection(String),

    /// The backend answered with something unusable
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The backend refused the call because of rate limits
    #[error("rate limited{}", .retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    RateLimited {
        /// Suggested wait before calling again
        retry_after: Option<Duration>,
    },
}

/// Model backend trait
///
/// Implement this trait to add support for a model provider.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Provider name for logs (e.g. "ollama")
    fn name(&self) -> &str;

    /// Generate a completion for `prompt`
    async fn invoke(
        &self,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<BackendResponse, BackendError>;
}
