//! Model Conductor - Task Dispatch Across Heterogeneous Model Backends
//!
//! This crate routes typed development tasks (coding, review, planning,
//! testing, documentation, debugging, deployment) to a pool of model
//! backends. It bounds how many tasks each backend runs at once, falls back
//! to the next candidate when a backend fails or answers poorly, and keeps a
//! rolling performance history that shapes later routing decisions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Callers                                  │
//! │      ┌────────────────┐   ┌──────────────┐   ┌──────────────┐    │
//! │      │ conductor CLI  │   │  Test suite  │   │   Embedder   │    │
//! │      └───────┬────────┘   └──────┬───────┘   └──────┬───────┘    │
//! │              └───────────────────┼──────────────────┘            │
//! │                          Task (down) / TaskResult (up)           │
//! └──────────────────────────────────┼───────────────────────────────┘
//!                                    │
//! ┌──────────────────────────────────┼───────────────────────────────┐
//! │                         MODEL CONDUCTOR                           │
//! │  ┌───────────────────────────────┴──────────────────────────────┐ │
//! │  │                        Orchestrator                           │ │
//! │  │  ┌──────────┐  ┌───────────┐  ┌──────────┐  ┌──────────────┐ │ │
//! │  │  │ Registry │  │ Admission │  │  Ledger  │  │  Dispatcher  │ │ │
//! │  │  └──────────┘  └───────────┘  └──────────┘  └──────────────┘ │ │
//! │  └──────────────────────────────────────────────────────────────┘ │
//! │                 ModelBackend (Ollama, Simulated)                   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Orchestrator`]: Owns the registry, admission gates and ledger
//! - [`Task`]: A unit of work with a type and complexity
//! - [`TaskResult`]: Terminal outcome with the full attempt history
//! - [`ModelBackend`]: Capability every backend implements
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use model_conductor::{
//!     backend::OllamaBackend, load_config, ModelBackend, Orchestrator, Task, TaskType,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let ollama: Arc<dyn ModelBackend> = Arc::new(OllamaBackend::from_env()?);
//!     let orchestrator = Orchestrator::from_config(&config, |_| Arc::clone(&ollama))?;
//!
//!     let task = Task::new(TaskType::Coding, "Write a binary search in Rust");
//!     let result = orchestrator.execute(&task).await?;
//!     println!("{}", result.response.unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: Model backend capability (Ollama, simulated)
//! - [`config`]: TOML and environment configuration loading
//! - [`orchestrator`]: Dispatch context
//! - [`routing`]: Registry, admission, selection, dispatch, ledger
//! - [`tasks`]: Task model
//!
//! # No Global State
//!
//! Nothing in this crate is process-wide. Logging subscribers are installed
//! by binaries, never here.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod orchestrator;
pub mod routing;
pub mod tasks;

// Re-exports for convenience
pub use backend::{
    BackendError, BackendResponse, InvokeOptions, ModelBackend, OllamaBackend, SimulatedBackend,
    SimulatedOutcome,
};
pub use orchestrator::Orchestrator;
pub use tasks::{Complexity, Task, TaskId, TaskType};

// Routing exports
pub use routing::{
    AdmissionController, AdmissionError, AttemptRecord, BackendConfig, BackendRegistry,
    BackendStats, DegradedPolicy, DispatchConfig, DispatchError, Dispatcher, ErrorKind,
    ExecuteOptions, HeuristicEvaluator, LedgerConfig, PerformanceLedger, QualityEvaluator,
    Recommendation, RegistryError, SelectionError, Selector, TaskResult, Tier,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConductorConfig, ConductorToml,
    ConfigError, ConfigOverrides, ConfigSource,
};
