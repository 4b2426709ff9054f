//! Task Routing
//!
//! Admission control, candidate selection, fallback dispatch and performance
//! tracking for a pool of heterogeneous model backends.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |    Dispatcher    |  <-- Entry point: execute / execute_all
//! +--------+---------+
//!          |
//!          v
//! +------------------+        +---------------------+
//! |     Selector     | <----- |  PerformanceLedger  |  <-- rolling quality
//! +--------+---------+        +----------^----------+
//!          |                             | every attempt
//!          v                             |
//! +------------------+        +----------+----------+
//! | BackendRegistry  |        | AdmissionController |  <-- per-backend slots
//! +--------+---------+        +---------------------+
//!          |
//!    +-----+-----+
//!    |     |     |
//!    v     v     v
//! +------+ +---------+
//! |Ollama| |Simulated|  <-- ModelBackend implementations
//! +------+ +---------+
//! ```
//!
//! # Design Principles
//!
//! 1. **Bounded Concurrency**: a backend never runs more tasks than its limit
//! 2. **Graceful Degradation**: ranked fallback when a backend fails or underperforms
//! 3. **Feedback**: ledger statistics shape future rankings
//! 4. **Observability**: every attempt is recorded and exportable

pub mod admission;
pub mod config;
pub mod dispatcher;
pub mod ledger;
pub mod metrics;
pub mod quality;
pub mod registry;
pub mod selector;

pub use admission::{AdmissionController, AdmissionError, AdmissionSlot, AdmissionStats};
pub use config::{BackendConfig, DegradedPolicy, DispatchConfig, LedgerConfig, RetryConfig, Tier};
pub use dispatcher::{DispatchError, Dispatcher, ExecuteOptions, TaskResult};
pub use ledger::{
    AttemptRecord, BackendStats, DetailedReport, ErrorKind, LatencyPercentiles,
    PerformanceLedger, Recommendation,
};
pub use quality::{FixedEvaluator, HeuristicEvaluator, QualityEvaluator};
pub use registry::{BackendRegistry, RegistryError};
pub use selector::{Candidate, SelectionError, Selector};
