//! Model Backend Integration
//!
//! This module provides access to model backends through a common trait
//! interface.
//!
//! # Available Backends
//!
//! - **Ollama**: Local LLM server over HTTP
//! - **Simulated**: Scripted latency and outcomes for tests and dry runs
//!
//! # Usage
//!
//! ```ignore
//! use model_conductor::backend::{InvokeOptions, ModelBackend, OllamaBackend};
//!
//! let backend = OllamaBackend::from_env()?;
//! let options = InvokeOptions::new("llama2:7b").with_max_tokens(256);
//! let response = backend.invoke("Hello!", &options).await?;
//! ```

mod ollama;
mod simulated;
mod traits;

pub use ollama::OllamaBackend;
pub use simulated::{SimulatedBackend, SimulatedCall, SimulatedOutcome};
pub use traits::{BackendError, BackendResponse, InvokeOptions, ModelBackend};
