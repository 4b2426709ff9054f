//! Ollama Backend Implementation
//!
//! Model backend for Ollama (local LLM server). One `OllamaBackend` serves
//! every model the server hosts; the model is chosen per call through
//! [`InvokeOptions::model`].
//!
//! # Ollama API
//!
//! - `/api/generate` - Generate completions (used non-streaming)
//! - `/api/tags` - List installed models

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use super::traits::{BackendError, BackendResponse, InvokeOptions, ModelBackend};

/// Ollama backend client
#[derive(Clone, Debug)]
pub struct OllamaBackend {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, BackendError> {
        // No overall request timeout: the dispatcher bounds every call
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        Ok(Self {
            host: host.into(),
            port,
            http_client,
        })
    }

    /// Create from environment variables (`OLLAMA_HOST`, `OLLAMA_PORT`)
    pub fn from_env() -> Result<Self, BackendError> {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);

        Self::new(host, port)
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get generate endpoint URL
    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url())
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    /// Names of the models installed on the server
    pub async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| map_request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, None, &body));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        parse_tags(&data)
    }
}

/// JSON body of a non-streaming generate call
fn generate_body(prompt: &str, options: &InvokeOptions) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": options.model,
        "prompt": prompt,
        "stream": false,
        "options": {
            "temperature": options.temperature,
        },
    });

    if options.max_tokens > 0 {
        body["options"]["num_predict"] = serde_json::json!(options.max_tokens);
    }

    body
}

/// Map a non-success HTTP status to a backend error
fn status_error(status: StatusCode, retry_after: Option<&str>, body: &str) -> BackendError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return BackendError::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        };
    }
    BackendError::InvalidResponse(format!("Ollama returned {status}: {body}"))
}

/// Extract text and token usage from a generate response
fn parse_generate(data: &serde_json::Value) -> Result<BackendResponse, BackendError> {
    if let Some(error) = data.get("error").and_then(|e| e.as_str()) {
        return Err(BackendError::InvalidResponse(error.to_string()));
    }

    let text = data
        .get("response")
        .and_then(|r| r.as_str())
        .ok_or_else(|| BackendError::InvalidResponse("missing `response` field".to_string()))?
        .to_string();

    let count = |field: &str| {
        data.get(field)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    };

    Ok(BackendResponse::new(
        text,
        count("eval_count") + count("prompt_eval_count"),
    ))
}

/// Extract model names from a tags response
fn parse_tags(data: &serde_json::Value) -> Result<Vec<String>, BackendError> {
    let models = data
        .get("models")
        .and_then(|m| m.as_array())
        .ok_or_else(|| BackendError::InvalidResponse("missing `models` field".to_string()))?;

    Ok(models
        .iter()
        .filter_map(|model| model.get("name").and_then(|n| n.as_str()))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect())
}

fn map_request_error(e: &reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(Duration::ZERO)
    } else if e.is_connect() || e.is_request() {
        BackendError::Connection(e.to_string())
    } else {
        BackendError::InvalidResponse(e.to_string())
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn invoke(
        &self,
        prompt: &str,
        options: &InvokeOptions,
    ) -> Result<BackendResponse, BackendError> {
        let response = self
            .http_client
            .post(self.generate_url())
            .json(&generate_body(prompt, options))
            .send()
            .await
            .map_err(|e| map_request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after.as_deref(), &body));
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        parse_generate(&data)
    }
}
