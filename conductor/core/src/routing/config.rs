//! Routing Configuration
//!
//! Configuration types for backends, dispatch limits, retry backoff and the
//! performance ledger window.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tasks::TaskType;

// ============================================================================
// Capacity Tiers
// ============================================================================

/// Coarse capability/cost class of a backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Small models, quick responses
    Fast,
    /// Mid-size models, good balance
    Balanced,
    /// Large models, best quality
    Powerful,
}

impl Tier {
    /// Position on the fast..powerful scale
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Fast => 0,
            Self::Balanced => 1,
            Self::Powerful => 2,
        }
    }

    /// Affinity towards a preferred tier: 2 = exact, 1 = adjacent, 0 = most distant
    #[must_use]
    pub fn affinity_to(&self, preferred: Tier) -> u8 {
        2 - self.rank().abs_diff(preferred.rank())
    }

    /// Parse a tier name (case-insensitive)
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "balanced" => Some(Self::Balanced),
            "powerful" => Some(Self::Powerful),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Balanced => write!(f, "balanced"),
            Self::Powerful => write!(f, "powerful"),
        }
    }
}

// ============================================================================
// Backend Configuration
// ============================================================================

/// Static description of one model backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name (also the model identifier sent to the backend)
    pub name: String,

    /// Task types this backend accepts
    #[serde(rename = "task_types")]
    pub supported_task_types: BTreeSet<TaskType>,

    /// Capability tier
    pub tier: Tier,

    /// Maximum tasks running on this backend at once
    pub concurrency_limit: usize,

    /// Operator preference (higher = more preferred)
    #[serde(default)]
    pub priority_weight: i32,

    /// Maximum tokens per response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Price per 1000 tokens (0 for local models)
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

impl BackendConfig {
    /// Create a backend config with one slot and default sampling settings
    pub fn new(
        name: impl Into<String>,
        tier: Tier,
        task_types: impl IntoIterator<Item = TaskType>,
    ) -> Self {
        Self {
            name: name.into(),
            supported_task_types: task_types.into_iter().collect(),
            tier,
            concurrency_limit: 1,
            priority_weight: 0,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            cost_per_1k_tokens: 0.0,
        }
    }

    /// Set the concurrency limit
    #[must_use]
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Set the priority weight
    #[must_use]
    pub fn with_priority_weight(mut self, weight: i32) -> Self {
        self.priority_weight = weight;
        self
    }

    /// Set max tokens and temperature
    #[must_use]
    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set the price per 1000 tokens
    #[must_use]
    pub fn with_cost_per_1k_tokens(mut self, cost: f64) -> Self {
        self.cost_per_1k_tokens = cost;
        self
    }

    /// Whether this backend accepts the given task type
    #[must_use]
    pub fn supports(&self, task_type: TaskType) -> bool {
        self.supported_task_types.contains(&task_type)
    }

    /// Cost of a call that used `tokens` tokens
    #[must_use]
    pub fn cost_for(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.cost_per_1k_tokens
    }

    /// Defaults for a model the server hosts but the catalog does not describe
    ///
    /// Balanced tier with two slots and weight 5.
    #[must_use]
    pub fn discovered(name: impl Into<String>) -> Self {
        Self::new(
            name,
            Tier::Balanced,
            [TaskType::Planning, TaskType::Coding, TaskType::Review],
        )
        .with_concurrency_limit(2)
        .with_priority_weight(5)
    }

    /// Local Ollama models known to work well for each kind of task
    #[must_use]
    pub fn default_catalog() -> Vec<BackendConfig> {
        use TaskType::{Coding, Debugging, Documentation, Planning, Review, Testing};

        vec![
            Self::new("llama2:7b-chat", Tier::Fast, [Planning, Testing, Documentation])
                .with_concurrency_limit(3)
                .with_priority_weight(3),
            Self::new("mistral:7b-instruct", Tier::Fast, [Planning, Testing, Documentation])
                .with_concurrency_limit(3)
                .with_priority_weight(4),
            Self::new("llama2:13b-chat", Tier::Balanced, [Planning, Review, Documentation])
                .with_concurrency_limit(2)
                .with_priority_weight(5),
            Self::new("codellama:13b-instruct", Tier::Balanced, [Coding, Review, Debugging])
                .with_concurrency_limit(2)
                .with_priority_weight(6)
                .with_sampling(4096, 0.3),
            Self::new("deepseek-coder:33b", Tier::Powerful, [Coding, Review, Debugging])
                .with_priority_weight(8)
                .with_sampling(8192, 0.2),
            Self::new("codellama:34b-instruct", Tier::Powerful, [Coding, Review, Debugging])
                .with_priority_weight(7)
                .with_sampling(8192, 0.2),
            Self::new("wizardcoder:34b", Tier::Powerful, [Coding, Review, Debugging])
                .with_priority_weight(9)
                .with_sampling(8192, 0.2),
            Self::new("llama2:7b", Tier::Fast, [Planning, Testing])
                .with_concurrency_limit(3)
                .with_priority_weight(2),
            Self::new("neural-chat:7b", Tier::Fast, [Planning, Documentation])
                .with_concurrency_limit(3)
                .with_priority_weight(3),
        ]
    }
}

// ============================================================================
// Dispatch Configuration
// ============================================================================

/// What to do when every candidate answered but none met the quality threshold
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Fail the task with the full attempt history
    #[default]
    HardFailure,
    /// Return the highest-quality structurally valid response, flagged degraded
    BestEffort,
}

impl DegradedPolicy {
    /// Parse a policy name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "hard_failure" | "hard" | "fail" => Some(Self::HardFailure),
            "best_effort" | "best" | "degraded" => Some(Self::BestEffort),
            _ => None,
        }
    }
}

/// Backoff between fallback attempts of one task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the second attempt (0 = no backoff)
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f32,

    /// Add jitter to backoff
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 0,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration after failed attempt N (0-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_backoff_ms == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_backoff_ms as f64
            * f64::from(self.backoff_multiplier).powi(attempt as i32);
        let jittered = if self.use_jitter {
            // Add up to 25% jitter
            base * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            base
        };

        // The cap bounds the jittered value too
        Duration::from_millis(jittered.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Limits applied to every task the dispatcher runs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum distinct backends tried per task
    pub max_attempts: usize,

    /// Time limit for one backend call
    pub per_attempt_timeout: Duration,

    /// Time limit for waiting on a backend slot before moving on
    pub admission_timeout: Duration,

    /// Minimum quality score for a response to win
    pub quality_threshold: f64,

    /// Behaviour when only below-threshold responses were produced
    pub degraded_policy: DegradedPolicy,

    /// Backoff between attempts
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_secs(300), // long generations
            admission_timeout: Duration::from_secs(5),
            quality_threshold: 0.6,
            degraded_policy: DegradedPolicy::HardFailure,
            retry: RetryConfig::default(),
        }
    }
}

// ============================================================================
// Ledger Configuration
// ============================================================================

/// Retention window of the performance ledger
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Raw records kept per (backend, task type)
    pub window_size: usize,

    /// Raw records older than this are folded into the lifetime aggregate
    pub window_max_age: Option<Duration>,

    /// Windowed attempts needed before a backend is recommended
    pub min_samples_for_recommendation: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            window_max_age: Some(Duration::from_secs(3600)),
            min_samples_for_recommendation: 3,
        }
    }
}
